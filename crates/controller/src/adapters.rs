use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{DeleteParams, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, DynamicObject};
use kube::{Api, Client};
use serde_json::{Value, json};

use crate::api::{OverrideSpec, PlacementSpec, PropagatedVersion, PropagatedVersionSpec};
use crate::engine::{ControlStore, MemberObjects, QualifiedName};
use crate::kinds::{FederatedKind, VersionCompare};
use crate::registry::ClusterRegistry;
use crate::{Error, Result};

const MANAGER_NAME: &str = "fedmesh-engine";

/// Namespace holding PropagatedVersion records for cluster-scoped
/// kinds, which have no template namespace of their own.
pub const CLUSTER_SCOPED_VERSION_NAMESPACE: &str = "fedmesh-system";

/// Parse the `spec` of a placement resource.
pub fn parse_placement(obj: &DynamicObject) -> Result<PlacementSpec> {
    match obj.data.get("spec") {
        Some(spec) => Ok(serde_json::from_value(spec.clone())?),
        None => Ok(PlacementSpec::default()),
    }
}

/// Parse the `spec` of an override resource.
pub fn parse_override(obj: &DynamicObject) -> Result<OverrideSpec> {
    match obj.data.get("spec") {
        Some(spec) => Ok(serde_json::from_value(spec.clone())?),
        None => Ok(OverrideSpec::default()),
    }
}

/// Materialize the desired member-cluster object for `cluster`.
///
/// Copies only labels and annotations from the template's metadata
/// (server-managed fields never propagate), forces name and namespace
/// to the template's own, deep-copies the embedded body, then applies
/// the first override entry matching `cluster`, if any.
pub fn object_for_cluster(
    kind: &FederatedKind,
    template: &DynamicObject,
    overrides: Option<&OverrideSpec>,
    cluster: &str,
) -> Result<DynamicObject> {
    let name = template.metadata.name.clone().ok_or(Error::MissingField)?;

    let mut desired = DynamicObject::new(&name, &kind.target_resource());
    if kind.namespaced {
        desired.metadata.namespace = template.metadata.namespace.clone();
    }
    desired.metadata.labels = template.metadata.labels.clone();
    desired.metadata.annotations = template.metadata.annotations.clone();

    desired.data = template
        .data
        .get("spec")
        .and_then(|spec| spec.get("template"))
        .cloned()
        .unwrap_or_else(|| json!({}));

    if let Some(entry) = overrides.and_then(|o| o.entry_for(cluster)) {
        if let Some(replicas) = entry.replicas {
            if let Some(path) = kind.replica_path {
                set_pointer(&mut desired.data, path, json!(replicas));
            }
        }
        if let Some(patch) = &entry.patch {
            merge_patch(&mut desired.data, patch);
        }
    }

    Ok(desired)
}

/// Prepare `desired` for an update against `live`, carrying forward
/// server-assigned fields the member cluster manages so the write is
/// not rejected and does not clobber them.
pub fn object_for_update(
    kind: &FederatedKind,
    desired: &DynamicObject,
    live: &DynamicObject,
) -> DynamicObject {
    let mut to_send = desired.clone();
    to_send.metadata.resource_version = live.metadata.resource_version.clone();

    if kind.target_kind == "Service" {
        carry_service_fields(&mut to_send.data, &live.data);
    }

    to_send
}

/// The member cluster allocates these on create; an update without
/// them is rejected or resets live traffic configuration.
fn carry_service_fields(desired: &mut Value, live: &Value) {
    let Some(live_spec) = live.get("spec") else {
        return;
    };

    for field in ["clusterIP", "clusterIPs", "healthCheckNodePort"] {
        if let Some(value) = live_spec.get(field) {
            set_pointer(desired, &format!("/spec/{field}"), value.clone());
        }
    }

    let live_ports = live_spec.get("ports").and_then(Value::as_array).cloned();
    let desired_ports = desired
        .get_mut("spec")
        .and_then(|s| s.get_mut("ports"))
        .and_then(Value::as_array_mut);
    if let (Some(live_ports), Some(desired_ports)) = (live_ports, desired_ports) {
        for port in desired_ports {
            if port.get("nodePort").is_some() {
                continue;
            }
            let matched = live_ports
                .iter()
                .find(|lp| lp.get("port") == port.get("port"));
            if let Some(node_port) = matched.and_then(|lp| lp.get("nodePort")) {
                if let Some(map) = port.as_object_mut() {
                    map.insert("nodePort".to_string(), node_port.clone());
                }
            }
        }
    }
}

/// Version string used for drift detection, per the kind's declared
/// comparison mode.
pub fn observed_version(kind: &FederatedKind, obj: &DynamicObject) -> String {
    match kind.version_compare {
        VersionCompare::ResourceVersion => obj.metadata.resource_version.clone().unwrap_or_default(),
        VersionCompare::Generation => obj
            .metadata
            .generation
            .map(|g| g.to_string())
            .unwrap_or_default(),
    }
}

/// Set `value` at a JSON pointer, creating intermediate objects.
fn set_pointer(target: &mut Value, pointer: &str, value: Value) {
    let mut current = target;
    let segments: Vec<&str> = pointer.trim_start_matches('/').split('/').collect();
    for (i, segment) in segments.iter().enumerate() {
        if !current.is_object() {
            *current = json!({});
        }
        let Some(map) = current.as_object_mut() else {
            return;
        };
        if i == segments.len() - 1 {
            map.insert((*segment).to_string(), value);
            return;
        }
        current = map
            .entry((*segment).to_string())
            .or_insert_with(|| json!({}));
    }
}

/// RFC 7386 merge patch: objects merge recursively, null deletes,
/// everything else replaces.
fn merge_patch(target: &mut Value, patch: &Value) {
    let Some(patch_map) = patch.as_object() else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = json!({});
    }
    let Some(target_map) = target.as_object_mut() else {
        return;
    };
    for (key, value) in patch_map {
        if value.is_null() {
            target_map.remove(key);
        } else {
            merge_patch(target_map.entry(key.clone()).or_insert(Value::Null), value);
        }
    }
}

/// Production adapter for one federated kind: uniform CRUD access to
/// its template/placement/override resources on the control plane and
/// to its target resource in member clusters, all through one generic
/// dynamic client parameterized by the kind's resource metadata.
pub struct KindAdapter {
    kind: FederatedKind,
    control_plane: Client,
    registry: Arc<ClusterRegistry>,
}

impl KindAdapter {
    pub fn new(kind: FederatedKind, control_plane: Client, registry: Arc<ClusterRegistry>) -> Self {
        Self {
            kind,
            control_plane,
            registry,
        }
    }

    pub fn kind(&self) -> &FederatedKind {
        &self.kind
    }

    fn control_api(&self, resource: &ApiResource, q: &QualifiedName) -> Api<DynamicObject> {
        match &q.namespace {
            Some(ns) => Api::namespaced_with(self.control_plane.clone(), ns, resource),
            None => Api::all_with(self.control_plane.clone(), resource),
        }
    }

    fn member_client(&self, cluster: &str) -> Result<Client> {
        self.registry
            .client(cluster)
            .ok_or_else(|| Error::ClusterUnavailable {
                cluster: cluster.to_string(),
                message: "no client registered".to_string(),
            })
    }

    fn target_api(&self, client: Client, q: &QualifiedName) -> Api<DynamicObject> {
        let resource = self.kind.target_resource();
        match (&q.namespace, self.kind.namespaced) {
            (Some(ns), true) => Api::namespaced_with(client, ns, &resource),
            _ => Api::all_with(client, &resource),
        }
    }

    fn version_record_location(&self, q: &QualifiedName) -> (String, String) {
        let namespace = q
            .namespace
            .clone()
            .unwrap_or_else(|| CLUSTER_SCOPED_VERSION_NAMESPACE.to_string());
        (namespace, self.kind.propagated_version_name(&q.name))
    }

    fn cluster_error(cluster: &str, err: kube::Error) -> Error {
        Error::ClusterUnavailable {
            cluster: cluster.to_string(),
            message: err.to_string(),
        }
    }
}

#[async_trait]
impl ControlStore for KindAdapter {
    async fn template(&self, q: &QualifiedName) -> Result<Option<DynamicObject>> {
        let api = self.control_api(&self.kind.template_resource(), q);
        Ok(api.get_opt(&q.name).await?)
    }

    async fn placement(&self, q: &QualifiedName) -> Result<Option<PlacementSpec>> {
        let api = self.control_api(&self.kind.placement_resource(), q);
        match api.get_opt(&q.name).await? {
            Some(obj) => Ok(Some(parse_placement(&obj)?)),
            None => Ok(None),
        }
    }

    async fn overrides(&self, q: &QualifiedName) -> Result<Option<(OverrideSpec, String)>> {
        let api = self.control_api(&self.kind.override_resource(), q);
        match api.get_opt(&q.name).await? {
            Some(obj) => {
                let version = obj.metadata.resource_version.clone().unwrap_or_default();
                Ok(Some((parse_override(&obj)?, version)))
            }
            None => Ok(None),
        }
    }

    async fn propagated_version(&self, q: &QualifiedName) -> Result<Option<PropagatedVersionSpec>> {
        let (namespace, name) = self.version_record_location(q);
        let api = Api::<PropagatedVersion>::namespaced(self.control_plane.clone(), &namespace);
        Ok(api.get_opt(&name).await?.map(|pv| pv.spec))
    }

    async fn write_propagated_version(
        &self,
        q: &QualifiedName,
        spec: PropagatedVersionSpec,
    ) -> Result<()> {
        let (namespace, name) = self.version_record_location(q);
        let api = Api::<PropagatedVersion>::namespaced(self.control_plane.clone(), &namespace);
        let pp = PatchParams::apply(MANAGER_NAME).force();
        api.patch(&name, &pp, &Patch::Apply(&PropagatedVersion::new(&name, spec)))
            .await?;
        Ok(())
    }

    async fn delete_propagated_version(&self, q: &QualifiedName) -> Result<()> {
        let (namespace, name) = self.version_record_location(q);
        let api = Api::<PropagatedVersion>::namespaced(self.control_plane.clone(), &namespace);
        match api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl MemberObjects for KindAdapter {
    async fn get(&self, cluster: &str, q: &QualifiedName) -> Result<Option<DynamicObject>> {
        let api = self.target_api(self.member_client(cluster)?, q);
        api.get_opt(&q.name)
            .await
            .map_err(|e| Self::cluster_error(cluster, e))
    }

    async fn create(
        &self,
        cluster: &str,
        q: &QualifiedName,
        desired: &DynamicObject,
    ) -> Result<String> {
        let api = self.target_api(self.member_client(cluster)?, q);
        let created = api
            .create(&PostParams::default(), desired)
            .await
            .map_err(|e| Self::cluster_error(cluster, e))?;
        Ok(observed_version(&self.kind, &created))
    }

    async fn update(
        &self,
        cluster: &str,
        q: &QualifiedName,
        desired: &DynamicObject,
        live: &DynamicObject,
    ) -> Result<String> {
        let api = self.target_api(self.member_client(cluster)?, q);
        let to_send = object_for_update(&self.kind, desired, live);
        match api.replace(&q.name, &PostParams::default(), &to_send).await {
            Ok(updated) => Ok(observed_version(&self.kind, &updated)),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Err(Error::Conflict(q.to_string())),
            Err(e) => Err(Self::cluster_error(cluster, e)),
        }
    }

    async fn delete(&self, cluster: &str, q: &QualifiedName) -> Result<()> {
        let api = self.target_api(self.member_client(cluster)?, q);
        match api.delete(&q.name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(Self::cluster_error(cluster, e)),
        }
    }
}

use std::collections::BTreeMap;

use kube::core::{ApiResource, GroupVersionKind};

use crate::{Error, Result, api};

/// How the engine decides that a live member-cluster object already
/// matches what was last applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VersionCompare {
    /// Opaque `metadata.resourceVersion` string equality
    ResourceVersion,
    /// Monotonic `metadata.generation` comparison; ignores
    /// status-only writes made by the member cluster
    Generation,
}

/// Metadata for one federated kind: the target workload type plus the
/// template/placement/override resources that describe it on the
/// control plane.
#[derive(Clone, Debug)]
pub struct FederatedKind {
    /// Target kind name, e.g. "Deployment"
    pub target_kind: String,
    /// API group of the target kind, "" for core
    pub target_group: String,
    /// API version of the target kind
    pub target_version: String,
    /// Plural of the target kind
    pub target_plural: String,
    /// False only for cluster-scoped targets such as Namespace
    pub namespaced: bool,
    /// JSON pointer to the replica-count field inside the object
    /// content, when the kind carries one
    pub replica_path: Option<&'static str>,
    pub version_compare: VersionCompare,
}

impl FederatedKind {
    /// Kind name of the control-plane template resource.
    pub fn template_kind(&self) -> String {
        format!("Federated{}", self.target_kind)
    }

    /// `ApiResource` for the template resource.
    pub fn template_resource(&self) -> ApiResource {
        control_plane_resource(&self.template_kind())
    }

    /// `ApiResource` for the placement resource.
    pub fn placement_resource(&self) -> ApiResource {
        control_plane_resource(&format!("{}Placement", self.template_kind()))
    }

    /// `ApiResource` for the override resource.
    pub fn override_resource(&self) -> ApiResource {
        control_plane_resource(&format!("{}Override", self.template_kind()))
    }

    /// `ApiResource` for the target workload resource in member clusters.
    pub fn target_resource(&self) -> ApiResource {
        ApiResource::from_gvk_with_plural(
            &GroupVersionKind::gvk(&self.target_group, &self.target_version, &self.target_kind),
            &self.target_plural,
        )
    }

    /// Name of the PropagatedVersion record for one template.
    pub fn propagated_version_name(&self, template_name: &str) -> String {
        format!(
            "propagated-version-{}-{}",
            self.target_kind.to_lowercase(),
            template_name
        )
    }
}

fn control_plane_resource(kind: &str) -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk(api::API_GROUP, api::API_VERSION, kind),
        &format!("{}s", kind.to_lowercase()),
    )
}

/// Explicit table of registered federated kinds, constructed once at
/// startup and passed by reference to the engine and CLI.
#[derive(Clone, Debug, Default)]
pub struct KindRegistry {
    kinds: BTreeMap<String, FederatedKind>,
}

impl KindRegistry {
    /// Empty registry; combine with [`KindRegistry::register`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with every supported workload kind.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for kind in builtin_kinds() {
            // Static table, distinct kind names by construction
            registry
                .register(kind)
                .expect("builtin kind table is well-formed");
        }
        registry
    }

    /// Register a kind. Duplicate kind names and empty target metadata
    /// are configuration errors, fatal for that kind.
    pub fn register(&mut self, kind: FederatedKind) -> Result<()> {
        if kind.target_kind.is_empty() || kind.target_plural.is_empty() {
            return Err(Error::config(
                "kind registration requires a non-empty target kind and plural",
            ));
        }
        if self.kinds.contains_key(&kind.target_kind) {
            return Err(Error::config(format!(
                "kind {} is already registered",
                kind.target_kind
            )));
        }
        self.kinds.insert(kind.target_kind.clone(), kind);
        Ok(())
    }

    /// Look up a kind by target kind name.
    pub fn get(&self, target_kind: &str) -> Option<&FederatedKind> {
        self.kinds.get(target_kind)
    }

    /// All registered kinds in name order.
    pub fn iter(&self) -> impl Iterator<Item = &FederatedKind> {
        self.kinds.values()
    }
}

fn builtin_kinds() -> Vec<FederatedKind> {
    vec![
        FederatedKind {
            target_kind: "ConfigMap".into(),
            target_group: "".into(),
            target_version: "v1".into(),
            target_plural: "configmaps".into(),
            namespaced: true,
            replica_path: None,
            version_compare: VersionCompare::ResourceVersion,
        },
        FederatedKind {
            target_kind: "Deployment".into(),
            target_group: "apps".into(),
            target_version: "v1".into(),
            target_plural: "deployments".into(),
            namespaced: true,
            replica_path: Some("/spec/replicas"),
            version_compare: VersionCompare::Generation,
        },
        FederatedKind {
            target_kind: "Job".into(),
            target_group: "batch".into(),
            target_version: "v1".into(),
            target_plural: "jobs".into(),
            namespaced: true,
            replica_path: Some("/spec/parallelism"),
            version_compare: VersionCompare::Generation,
        },
        FederatedKind {
            target_kind: "Namespace".into(),
            target_group: "".into(),
            target_version: "v1".into(),
            target_plural: "namespaces".into(),
            namespaced: false,
            replica_path: None,
            version_compare: VersionCompare::ResourceVersion,
        },
        FederatedKind {
            target_kind: "ReplicaSet".into(),
            target_group: "apps".into(),
            target_version: "v1".into(),
            target_plural: "replicasets".into(),
            namespaced: true,
            replica_path: Some("/spec/replicas"),
            version_compare: VersionCompare::Generation,
        },
        FederatedKind {
            target_kind: "Secret".into(),
            target_group: "".into(),
            target_version: "v1".into(),
            target_plural: "secrets".into(),
            namespaced: true,
            replica_path: None,
            version_compare: VersionCompare::ResourceVersion,
        },
        FederatedKind {
            target_kind: "Service".into(),
            target_group: "".into(),
            target_version: "v1".into(),
            target_plural: "services".into(),
            namespaced: true,
            replica_path: None,
            version_compare: VersionCompare::ResourceVersion,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_covers_all_workload_kinds() {
        let registry = KindRegistry::builtin();
        for kind in [
            "ConfigMap",
            "Deployment",
            "Job",
            "Namespace",
            "ReplicaSet",
            "Secret",
            "Service",
        ] {
            assert!(registry.get(kind).is_some(), "missing builtin kind {kind}");
        }
        assert_eq!(registry.iter().count(), 7);
    }

    #[test]
    fn control_plane_resources_derive_from_the_target_kind() {
        let registry = KindRegistry::builtin();
        let deployment = registry.get("Deployment").unwrap();

        let template = deployment.template_resource();
        assert_eq!(template.kind, "FederatedDeployment");
        assert_eq!(template.plural, "federateddeployments");
        assert_eq!(template.group, api::API_GROUP);

        let placement = deployment.placement_resource();
        assert_eq!(placement.kind, "FederatedDeploymentPlacement");
        assert_eq!(placement.plural, "federateddeploymentplacements");

        let override_ = deployment.override_resource();
        assert_eq!(override_.kind, "FederatedDeploymentOverride");

        let target = deployment.target_resource();
        assert_eq!(target.group, "apps");
        assert_eq!(target.api_version, "apps/v1");
        assert_eq!(target.plural, "deployments");
    }

    #[test]
    fn replica_paths_exist_only_for_replica_bearing_kinds() {
        let registry = KindRegistry::builtin();
        assert_eq!(
            registry.get("Deployment").unwrap().replica_path,
            Some("/spec/replicas")
        );
        assert_eq!(
            registry.get("Job").unwrap().replica_path,
            Some("/spec/parallelism")
        );
        assert_eq!(registry.get("ConfigMap").unwrap().replica_path, None);
        assert_eq!(registry.get("Service").unwrap().replica_path, None);
    }

    #[test]
    fn duplicate_registration_is_a_config_error() {
        let mut registry = KindRegistry::builtin();
        let duplicate = registry.get("Deployment").unwrap().clone();
        match registry.register(duplicate) {
            Err(Error::Config(msg)) => assert!(msg.contains("already registered")),
            other => panic!("expected Config error, got {other:?}"),
        }
    }

    #[test]
    fn namespace_is_the_only_cluster_scoped_kind() {
        let registry = KindRegistry::builtin();
        let cluster_scoped: Vec<_> = registry
            .iter()
            .filter(|k| !k.namespaced)
            .map(|k| k.target_kind.as_str())
            .collect();
        assert_eq!(cluster_scoped, vec!["Namespace"]);
    }

    #[test]
    fn propagated_version_names_are_kind_qualified() {
        let registry = KindRegistry::builtin();
        let deployment = registry.get("Deployment").unwrap();
        assert_eq!(
            deployment.propagated_version_name("web"),
            "propagated-version-deployment-web"
        );
    }
}

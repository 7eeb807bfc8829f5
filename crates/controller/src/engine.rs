use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures::{StreamExt, stream};
use kube::core::DynamicObject;
use tracing::{Level, debug, instrument};

#[cfg(test)]
use mockall::automock;

use crate::adapters;
use crate::api::{ClusterVersion, OverrideSpec, PlacementSpec, PropagatedVersionSpec};
use crate::kinds::FederatedKind;
use crate::registry::ClusterRegistry;
use crate::{ClusterFailure, Error, Result};

/// Default bound on concurrent member-cluster calls within one reconcile.
pub const DEFAULT_CLUSTER_FANOUT: usize = 4;

/// (namespace, name) key of one federated object. Namespace is absent
/// for cluster-scoped kinds.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct QualifiedName {
    pub namespace: Option<String>,
    pub name: String,
}

impl QualifiedName {
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    pub fn cluster_scoped(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }
}

impl std::fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Control-plane store access for one federated kind.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ControlStore: Send + Sync {
    async fn template(&self, q: &QualifiedName) -> Result<Option<DynamicObject>>;
    async fn placement(&self, q: &QualifiedName) -> Result<Option<PlacementSpec>>;
    /// Override spec plus its resourceVersion
    async fn overrides(&self, q: &QualifiedName) -> Result<Option<(OverrideSpec, String)>>;
    async fn propagated_version(&self, q: &QualifiedName)
    -> Result<Option<PropagatedVersionSpec>>;
    async fn write_propagated_version(
        &self,
        q: &QualifiedName,
        spec: PropagatedVersionSpec,
    ) -> Result<()>;
    async fn delete_propagated_version(&self, q: &QualifiedName) -> Result<()>;
}

/// CRUD access to the target object in named member clusters.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MemberObjects: Send + Sync {
    async fn get(&self, cluster: &str, q: &QualifiedName) -> Result<Option<DynamicObject>>;
    /// Returns the observed version of the created object
    async fn create(
        &self,
        cluster: &str,
        q: &QualifiedName,
        desired: &DynamicObject,
    ) -> Result<String>;
    /// Returns the observed version of the updated object. A single
    /// attempt: a stale `live` surfaces as [`Error::Conflict`] and the
    /// caller decides whether to re-fetch and retry.
    async fn update(
        &self,
        cluster: &str,
        q: &QualifiedName,
        desired: &DynamicObject,
        live: &DynamicObject,
    ) -> Result<String>;
    async fn delete(&self, cluster: &str, q: &QualifiedName) -> Result<()>;
}

/// View of the member-cluster set used to resolve wildcard placements.
#[cfg_attr(test, automock)]
pub trait ClusterSet: Send + Sync {
    /// Names of clusters whose last health sample was Ready=True
    fn ready_clusters(&self) -> Vec<String>;
}

impl ClusterSet for ClusterRegistry {
    fn ready_clusters(&self) -> Vec<String> {
        ClusterRegistry::ready_clusters(self)
    }
}

impl<T: ClusterSet + ?Sized> ClusterSet for Arc<T> {
    fn ready_clusters(&self) -> Vec<String> {
        (**self).ready_clusters()
    }
}

/// Level-triggered reconciliation of one federated kind: recomputes the
/// full desired state from the stored objects, diffs it against every
/// target cluster, and applies creates/updates/deletes, tracking what
/// was applied in a PropagatedVersion record.
pub struct Engine<S, M, C> {
    kind: FederatedKind,
    store: S,
    members: M,
    clusters: C,
    fanout: usize,
}

impl<S: ControlStore, M: MemberObjects, C: ClusterSet> Engine<S, M, C> {
    pub fn new(kind: FederatedKind, store: S, members: M, clusters: C) -> Self {
        Self {
            kind,
            store,
            members,
            clusters,
            fanout: DEFAULT_CLUSTER_FANOUT,
        }
    }

    pub fn with_fanout(mut self, fanout: usize) -> Self {
        self.fanout = fanout.max(1);
        self
    }

    pub fn kind(&self) -> &FederatedKind {
        &self.kind
    }

    /// Reconcile one work item. Failures on individual clusters do not
    /// stop the remaining clusters; they surface together as
    /// [`Error::PartialFailure`] after the version record is persisted.
    #[instrument(level = Level::DEBUG, skip(self), fields(kind = %self.kind.target_kind, object = %q))]
    pub async fn reconcile(&self, q: &QualifiedName) -> Result<()> {
        let Some(template) = self.store.template(q).await? else {
            return self.teardown(q).await;
        };
        let template_version = template.metadata.resource_version.clone().unwrap_or_default();

        let placement = self.store.placement(q).await?;
        let target_clusters = self.resolve_clusters(placement.as_ref());

        let (override_spec, override_version) = match self.store.overrides(q).await? {
            Some((spec, version)) => (Some(spec), version),
            None => (None, String::new()),
        };

        let previous = self.store.propagated_version(q).await?;
        let recorded_valid = previous.as_ref().is_some_and(|prev| {
            prev.template_version == template_version && prev.override_version == override_version
        });

        if recorded_valid {
            let prev = previous.as_ref().ok_or(Error::MissingField)?;
            let prev_set: BTreeSet<&str> = prev
                .cluster_versions
                .iter()
                .map(|cv| cv.cluster_name.as_str())
                .collect();
            let current_set: BTreeSet<&str> =
                target_clusters.iter().map(String::as_str).collect();
            if prev_set == current_set {
                debug!("versions and cluster set unchanged, skipping member calls");
                return Ok(());
            }
        }

        let recorded: BTreeMap<&str, &str> = previous
            .as_ref()
            .filter(|_| recorded_valid)
            .map(|prev| {
                prev.cluster_versions
                    .iter()
                    .map(|cv| (cv.cluster_name.as_str(), cv.version.as_str()))
                    .collect()
            })
            .unwrap_or_default();

        let mut failures: Vec<ClusterFailure> = Vec::new();
        let mut cluster_versions: Vec<ClusterVersion> = Vec::new();

        let template_ref = &template;
        let override_ref = override_spec.as_ref();
        let applies = target_clusters.iter().cloned().map(|cluster| {
            let expected = recorded.get(cluster.as_str()).copied();
            async move {
                let result = self
                    .apply_to_cluster(q, template_ref, override_ref, &cluster, expected)
                    .await;
                (cluster, result)
            }
        });
        let results: Vec<_> = stream::iter(applies)
            .buffer_unordered(self.fanout)
            .collect()
            .await;

        for (cluster, result) in results {
            match result {
                Ok(version) => cluster_versions.push(ClusterVersion {
                    cluster_name: cluster,
                    version,
                }),
                Err(e) => failures.push(ClusterFailure {
                    cluster,
                    message: e.to_string(),
                }),
            }
        }

        // Clusters previously propagated to but no longer targeted: the
        // object is deleted there. On failure the entry is retained so
        // the delete is retried on the next pass.
        if let Some(prev) = &previous {
            for cv in &prev.cluster_versions {
                if target_clusters.contains(&cv.cluster_name) {
                    continue;
                }
                if let Err(e) = self.members.delete(&cv.cluster_name, q).await {
                    cluster_versions.push(cv.clone());
                    failures.push(ClusterFailure {
                        cluster: cv.cluster_name.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }

        cluster_versions.sort_by(|a, b| a.cluster_name.cmp(&b.cluster_name));
        self.store
            .write_propagated_version(
                q,
                PropagatedVersionSpec {
                    template_version,
                    override_version,
                    cluster_versions,
                },
            )
            .await?;

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::PartialFailure { failures })
        }
    }

    fn resolve_clusters(&self, placement: Option<&PlacementSpec>) -> Vec<String> {
        match placement {
            None => Vec::new(),
            Some(p) if p.is_wildcard() => self.clusters.ready_clusters(),
            Some(p) => {
                let mut names = p.cluster_names.clone();
                names.sort();
                names.dedup();
                names
            }
        }
    }

    async fn apply_to_cluster(
        &self,
        q: &QualifiedName,
        template: &DynamicObject,
        overrides: Option<&OverrideSpec>,
        cluster: &str,
        expected_version: Option<&str>,
    ) -> Result<String> {
        let desired = adapters::object_for_cluster(&self.kind, template, overrides, cluster)?;
        match self.members.get(cluster, q).await? {
            None => self.members.create(cluster, q, &desired).await,
            Some(live) => {
                let live_version = adapters::observed_version(&self.kind, &live);
                if expected_version == Some(live_version.as_str()) {
                    return Ok(live_version);
                }
                match self.members.update(cluster, q, &desired, &live).await {
                    Err(Error::Conflict(_)) => {
                        // The object moved between our read and the
                        // write: re-fetch and retry exactly once.
                        match self.members.get(cluster, q).await? {
                            Some(fresh) => self.members.update(cluster, q, &desired, &fresh).await,
                            None => self.members.create(cluster, q, &desired).await,
                        }
                    }
                    result => result,
                }
            }
        }
    }

    /// The template is gone: remove the object from every cluster the
    /// version record names, then the record itself.
    async fn teardown(&self, q: &QualifiedName) -> Result<()> {
        let Some(previous) = self.store.propagated_version(q).await? else {
            return Ok(());
        };

        let mut failures = Vec::new();
        for cv in &previous.cluster_versions {
            if let Err(e) = self.members.delete(&cv.cluster_name, q).await {
                failures.push(ClusterFailure {
                    cluster: cv.cluster_name.clone(),
                    message: e.to_string(),
                });
            }
        }

        if failures.is_empty() {
            self.store.delete_propagated_version(q).await?;
            Ok(())
        } else {
            Err(Error::PartialFailure { failures })
        }
    }
}

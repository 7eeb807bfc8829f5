use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use serde_json::json;
use tracing::{debug, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::api::{
    ClusterCondition, ClusterConditionType, ConditionStatus, MemberCluster, MemberClusterStatus,
};
use crate::{Error, Result};

const HEALTHZ_OK: &str = "ok";

/// Turns a MemberCluster's credential reference into a live client.
///
/// This is the credential/config collaborator: the production
/// implementation reads the referenced Secret for a kubeconfig, while
/// tests substitute a mock.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClientFactory: Send + Sync {
    /// Build a client for the given member cluster
    async fn client_for(&self, cluster: &MemberCluster) -> Result<Client>;
}

/// Reads the Secret named by `spec.secretRef`, expecting a `kubeconfig`
/// key, and builds a client from it.
pub struct SecretClientFactory {
    control_plane: Client,
}

impl SecretClientFactory {
    pub fn new(control_plane: Client) -> Self {
        Self { control_plane }
    }
}

#[async_trait]
impl ClusterClientFactory for SecretClientFactory {
    async fn client_for(&self, cluster: &MemberCluster) -> Result<Client> {
        let secret_ref = &cluster.spec.secret_ref;
        let secrets = Api::<k8s_openapi::api::core::v1::Secret>::namespaced(
            self.control_plane.clone(),
            &secret_ref.namespace,
        );
        let secret = secrets.get(&secret_ref.name).await?;
        let kubeconfig_bytes = secret
            .data
            .as_ref()
            .and_then(|data| data.get("kubeconfig"))
            .ok_or_else(|| {
                Error::config(format!(
                    "secret {}/{} has no kubeconfig key",
                    secret_ref.namespace, secret_ref.name
                ))
            })?;
        let kubeconfig_text = std::str::from_utf8(&kubeconfig_bytes.0)
            .map_err(|e| Error::config(format!("kubeconfig is not valid UTF-8: {e}")))?;
        let kubeconfig = Kubeconfig::from_yaml(kubeconfig_text)
            .map_err(|e| Error::config(format!("malformed kubeconfig: {e}")))?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| Error::config(format!("unusable kubeconfig: {e}")))?;
        Ok(Client::try_from(config)?)
    }
}

/// Owns the set of known member clusters: one live client per cluster
/// plus the last health sample. Reads take the read lock, registry
/// mutations take the write lock.
#[derive(Default)]
pub struct ClusterRegistry {
    clients: RwLock<HashMap<String, Client>>,
    statuses: RwLock<HashMap<String, Vec<ClusterCondition>>>,
}

impl ClusterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a client for `name`. A cluster already known is a no-op.
    pub fn add_cluster(&self, name: &str, client: Client) {
        let mut clients = self.clients.write().expect("cluster registry lock");
        if clients.contains_key(name) {
            return;
        }
        debug!(cluster = name, "registering member cluster");
        clients.insert(name.to_string(), client);
    }

    /// Evict the client and any cached health status for `name`.
    pub fn remove_cluster(&self, name: &str) {
        self.clients
            .write()
            .expect("cluster registry lock")
            .remove(name);
        self.statuses
            .write()
            .expect("cluster registry lock")
            .remove(name);
    }

    /// Client for a member cluster, if it is registered.
    pub fn client(&self, name: &str) -> Option<Client> {
        self.clients
            .read()
            .expect("cluster registry lock")
            .get(name)
            .cloned()
    }

    /// Names of all registered clusters, sorted.
    pub fn cluster_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .clients
            .read()
            .expect("cluster registry lock")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Names of clusters whose last probe reported Ready=True, sorted.
    pub fn ready_clusters(&self) -> Vec<String> {
        let statuses = self.statuses.read().expect("cluster registry lock");
        let mut names: Vec<_> = statuses
            .iter()
            .filter(|(_, conditions)| {
                conditions.iter().any(|c| {
                    c.type_ == ClusterConditionType::Ready && c.status == ConditionStatus::True
                })
            })
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Last cached health sample for a cluster.
    pub fn cached_conditions(&self, name: &str) -> Option<Vec<ClusterCondition>> {
        self.statuses
            .read()
            .expect("cluster registry lock")
            .get(name)
            .cloned()
    }

    fn cache_conditions(&self, name: &str, conditions: Vec<ClusterCondition>) {
        self.statuses
            .write()
            .expect("cluster registry lock")
            .insert(name.to_string(), conditions);
    }
}

/// Result of one liveness probe against a member API server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// `/healthz` answered `ok`
    Healthy,
    /// `/healthz` answered, but not with `ok`
    NotReady(String),
    /// Transport or protocol failure
    Unreachable(String),
}

/// Issue `GET /healthz` through the cluster's client.
pub async fn probe(client: &Client) -> ProbeOutcome {
    let request = match http::Request::get("/healthz").body(Vec::new()) {
        Ok(request) => request,
        Err(e) => return ProbeOutcome::Unreachable(e.to_string()),
    };
    match client.request_text(request).await {
        Ok(body) if body.trim() == HEALTHZ_OK => ProbeOutcome::Healthy,
        Ok(body) => ProbeOutcome::NotReady(body),
        Err(e) => ProbeOutcome::Unreachable(e.to_string()),
    }
}

/// Translate a probe outcome into status conditions, carrying
/// `lastTransitionTime` forward from the previous sample unless the
/// condition's (type, status) pair actually changed. An unreachable
/// cluster records `Ready=False` alongside `Offline=True`, so a record
/// that went offline is distinguishable from one never probed.
pub fn conditions_for(
    outcome: &ProbeOutcome,
    previous: &[ClusterCondition],
    now: Time,
) -> Vec<ClusterCondition> {
    let samples: &[(ClusterConditionType, ConditionStatus, &str, &str)] = match outcome {
        ProbeOutcome::Healthy => &[(
            ClusterConditionType::Ready,
            ConditionStatus::True,
            "ClusterReady",
            "/healthz responded with ok",
        )],
        ProbeOutcome::NotReady(_) => &[(
            ClusterConditionType::Ready,
            ConditionStatus::False,
            "ClusterNotReady",
            "/healthz responded without ok",
        )],
        ProbeOutcome::Unreachable(_) => &[
            (
                ClusterConditionType::Offline,
                ConditionStatus::True,
                "ClusterNotReachable",
                "cluster is not reachable",
            ),
            (
                ClusterConditionType::Ready,
                ConditionStatus::False,
                "ClusterNotReachable",
                "cluster is not reachable",
            ),
        ],
    };

    samples
        .iter()
        .map(|(type_, status, reason, message)| {
            let last_transition_time = previous
                .iter()
                .find(|c| c.type_ == *type_ && c.status == *status)
                .map(|c| c.last_transition_time.clone())
                .unwrap_or_else(|| now.clone());
            ClusterCondition {
                type_: *type_,
                status: *status,
                reason: Some((*reason).to_string()),
                message: Some((*message).to_string()),
                last_probe_time: now.clone(),
                last_transition_time,
            }
        })
        .collect()
}

/// One pass of the health monitor: probe every registered cluster,
/// refresh the cached sample, and write the status back to the
/// cluster's persisted record. A write failure for one cluster is
/// logged and does not stop processing of the remaining clusters.
#[instrument(skip(registry, control_plane))]
pub async fn probe_all(registry: &ClusterRegistry, control_plane: &Client) {
    let clusters = Api::<MemberCluster>::all(control_plane.clone());
    let pp = kube::api::PatchParams::apply("fedmesh-health-monitor");

    for name in registry.cluster_names() {
        let Some(client) = registry.client(&name) else {
            // Removed concurrently, skip
            continue;
        };

        let outcome = probe(&client).await;
        let previous = registry.cached_conditions(&name).unwrap_or_default();
        let conditions = conditions_for(&outcome, &previous, Time(Utc::now()));
        registry.cache_conditions(&name, conditions.clone());

        let status = MemberClusterStatus { conditions };
        if let Err(e) = clusters
            .patch_status(
                &name,
                &pp,
                &kube::api::Patch::Merge(json!({"status": status})),
            )
            .await
        {
            warn!(cluster = %name, error = %e, "failed to write cluster health status");
        }
    }
}

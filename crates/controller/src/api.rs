use std::collections::BTreeMap;

use garde::Validate;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Group served by every control-plane resource in this crate.
pub const API_GROUP: &str = "fedmesh.dev";
/// Version served by every control-plane resource in this crate.
pub const API_VERSION: &str = "v1alpha1";

/// The wildcard cluster name. In a placement it selects every known
/// Ready cluster; in a scheduling preference it supplies the default
/// bounds for clusters without an explicit entry.
pub const WILDCARD: &str = "*";

/// A member cluster joined to the control plane. Cluster-scoped.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Validate, JsonSchema)]
#[kube(group = "fedmesh.dev", version = "v1alpha1", kind = "MemberCluster")]
#[kube(status = "MemberClusterStatus")]
#[serde(rename_all = "camelCase")]
pub struct MemberClusterSpec {
    /// URL of the member cluster's API server
    #[garde(length(min = 1))]
    pub api_endpoint: String,
    /// Secret holding credentials for the member cluster
    #[garde(skip)]
    pub secret_ref: SecretRef,
    /// Optional PEM bundle for the member API server
    #[garde(skip)]
    pub ca_bundle: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretRef {
    pub namespace: String,
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MemberClusterStatus {
    /// Ordered health conditions, most recent probe wins
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ClusterCondition>,
}

/// Health condition kinds reported by the health monitor.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ClusterConditionType {
    /// The member API server answered the liveness probe
    Ready,
    /// The member API server could not be reached at all
    Offline,
}

/// "True" / "False", kept as its own type to match condition semantics
/// elsewhere in the Kubernetes API.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCondition {
    #[serde(rename = "type")]
    pub type_: ClusterConditionType,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_probe_time: Time,
    pub last_transition_time: Time,
}

/// Drift-tracking record of what the propagation engine last applied
/// for one federated template. Written only by the engine; deleted when
/// the owning template is deleted.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Validate, JsonSchema)]
#[kube(
    group = "fedmesh.dev",
    version = "v1alpha1",
    kind = "PropagatedVersion",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct PropagatedVersionSpec {
    /// resourceVersion of the template that was applied
    #[garde(skip)]
    pub template_version: String,
    /// resourceVersion of the override that was applied, empty if none
    #[garde(skip)]
    #[serde(default)]
    pub override_version: String,
    /// Per-cluster version of the propagated object
    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cluster_versions: Vec<ClusterVersion>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterVersion {
    pub cluster_name: String,
    pub version: String,
}

/// Desired distribution of a total replica count across the member
/// clusters selected by the placement of the same qualified name.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Validate, JsonSchema)]
#[kube(
    group = "fedmesh.dev",
    version = "v1alpha1",
    kind = "ReplicaSchedulingPreference",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaSchedulingPreferenceSpec {
    /// Kind of the target template, e.g. "Deployment"
    #[garde(length(min = 1))]
    pub target_kind: String,
    #[garde(range(min = 1))]
    pub total_replicas: u32,
    /// When false, prefer the distribution that changes the fewest
    /// already-running per-cluster counts
    #[garde(skip)]
    #[serde(default)]
    pub rebalance: bool,
    /// Per-cluster bounds and weight; the "*" key supplies defaults
    #[garde(skip)]
    #[serde(default)]
    pub clusters: BTreeMap<String, ClusterPreferences>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterPreferences {
    #[serde(default)]
    pub min_replicas: u64,
    /// Unbounded when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_replicas: Option<u64>,
    #[serde(default)]
    pub weight: u64,
}

/// Parsed `spec` of a per-kind placement resource.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PlacementSpec {
    #[serde(default)]
    pub cluster_names: Vec<String>,
}

impl PlacementSpec {
    /// True if the placement selects all known Ready clusters.
    pub fn is_wildcard(&self) -> bool {
        self.cluster_names.iter().any(|n| n == WILDCARD)
    }
}

/// Parsed `spec` of a per-kind override resource.
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct OverrideSpec {
    #[serde(default)]
    pub overrides: Vec<ClusterOverride>,
}

impl OverrideSpec {
    /// First entry naming `cluster`, if any. Duplicate entries for one
    /// cluster are legal; only the first is ever applied.
    pub fn entry_for(&self, cluster: &str) -> Option<&ClusterOverride> {
        self.overrides.iter().find(|o| o.cluster_name == cluster)
    }
}

/// Per-cluster customization applied on top of a template when
/// materializing the member-cluster object.
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ClusterOverride {
    pub cluster_name: String,
    /// Routed through the kind's replica field (spec.replicas, or
    /// spec.parallelism for Job)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i64>,
    /// JSON merge patch (RFC 7386) applied onto the materialized body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn placement_wildcard_detection() {
        let explicit = PlacementSpec {
            cluster_names: vec!["east".into(), "west".into()],
        };
        assert!(!explicit.is_wildcard());

        let wildcard: PlacementSpec =
            serde_json::from_value(json!({"clusterNames": ["*", "east"]})).unwrap();
        assert!(wildcard.is_wildcard());

        let empty = PlacementSpec::default();
        assert!(!empty.is_wildcard());
        assert!(empty.cluster_names.is_empty());
    }

    #[test]
    fn override_first_entry_wins_for_duplicate_cluster_names() {
        let spec: OverrideSpec = serde_json::from_value(json!({
            "overrides": [
                {"clusterName": "east", "replicas": 5},
                {"clusterName": "east", "replicas": 9},
                {"clusterName": "west", "replicas": 2},
            ]
        }))
        .unwrap();

        assert_eq!(spec.entry_for("east").unwrap().replicas, Some(5));
        assert_eq!(spec.entry_for("west").unwrap().replicas, Some(2));
        assert!(spec.entry_for("north").is_none());
    }

    #[test]
    fn scheduling_preference_rejects_zero_total_replicas() {
        let spec = ReplicaSchedulingPreferenceSpec {
            target_kind: "Deployment".into(),
            total_replicas: 0,
            rebalance: false,
            clusters: BTreeMap::new(),
        };
        assert!(spec.validate().is_err());

        let spec = ReplicaSchedulingPreferenceSpec {
            total_replicas: 1,
            ..spec
        };
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn cluster_preferences_default_to_zero_bounds_and_unbounded_max() {
        let prefs: ClusterPreferences = serde_json::from_value(json!({"weight": 3})).unwrap();
        assert_eq!(prefs.min_replicas, 0);
        assert_eq!(prefs.max_replicas, None);
        assert_eq!(prefs.weight, 3);
    }

    #[test]
    fn condition_wire_shape_uses_camel_case() {
        let cond = ClusterCondition {
            type_: ClusterConditionType::Ready,
            status: ConditionStatus::True,
            reason: Some("ClusterReady".into()),
            message: None,
            last_probe_time: Time(chrono::Utc::now()),
            last_transition_time: Time(chrono::Utc::now()),
        };
        let value = serde_json::to_value(&cond).unwrap();
        assert_eq!(value["type"], "Ready");
        assert_eq!(value["status"], "True");
        assert!(value.get("lastProbeTime").is_some());
        assert!(value.get("lastTransitionTime").is_some());
        assert!(value.get("message").is_none());
    }
}

//! Multi-cluster workload propagation controller.
//!
//! Propagates declaratively-specified workload resources from a
//! federation control plane into a dynamic set of member clusters,
//! applying per-cluster customization and weighted replica scheduling
//! while continuously monitoring member-cluster health.
//!
//! # Modules
//!
//! - [`api`] - control-plane CRD types (MemberCluster, PropagatedVersion, ...)
//! - [`kinds`] - the federated-kind registry and per-kind resource metadata
//! - [`registry`] - member-cluster client registry and health monitor
//! - [`adapters`] - type-adapter abstraction over per-kind resources
//! - [`engine`] - the propagation / reconciliation engine
//! - [`scheduler`] - weighted replica scheduling
//! - [`reconcilers`] - kube-runtime controller wiring

/// Control-plane API objects
pub mod api;

/// K8s reconciliation logic
pub mod reconcilers;

pub mod adapters;
pub mod engine;
pub mod kinds;
pub mod registry;
pub mod scheduler;

use thiserror::Error;

/// One failed member-cluster operation inside an otherwise-successful
/// reconcile pass.
#[derive(Debug, Clone)]
pub struct ClusterFailure {
    /// Member cluster the operation targeted
    pub cluster: String,
    /// What went wrong
    pub message: String,
}

impl std::fmt::Display for ClusterFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.cluster, self.message)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("kube error: {0}")]
    Kube(#[from] kube::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Malformed kind registration; fatal for that kind at startup.
    #[error("configuration error: {0}")]
    Config(String),
    /// Member cluster unreachable or has no registered client.
    #[error("cluster {cluster} unavailable: {message}")]
    ClusterUnavailable { cluster: String, message: String },
    /// Write rejected because the live object's version moved. The
    /// engine re-fetches and retries once before giving up on the
    /// cluster for this pass.
    #[error("update conflict on {0}")]
    Conflict(String),
    #[error("validation error: {0}")]
    Validation(String),
    /// One or more member-cluster operations failed during a reconcile;
    /// the remaining clusters were still processed.
    #[error("partial failure across {} cluster(s): {}", .failures.len(), format_failures(.failures))]
    PartialFailure { failures: Vec<ClusterFailure> },
    #[error("missing field in object reference")]
    MissingField,
}

fn format_failures(failures: &[ClusterFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// True if this error should be retried with backoff rather than
    /// treated as a permanent failure of the work item.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Kube(_)
                | Self::ClusterUnavailable { .. }
                | Self::Conflict(_)
                | Self::PartialFailure { .. }
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

//! Reconciliation engine error types.

use thiserror::Error;

use keel_cluster::{ClusterError, ResourceKey};
use keel_state::StateError;

/// The spec/release pair cannot be turned into resources. Never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ComposeError {
    #[error("invalid service spec: {}", .0.join("; "))]
    InvalidSpec(Vec<String>),
}

impl ComposeError {
    pub fn problems(&self) -> &[String] {
        match self {
            Self::InvalidSpec(problems) => problems,
        }
    }
}

/// A single sub-resource operation failed.
#[derive(Debug, Clone, Error)]
pub enum ApplyError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error("{key}: still conflicting after {attempts} re-reads")]
    ConflictRetriesExhausted { key: ResourceKey, attempts: u32 },

    #[error("cancelled before {0} was applied")]
    Cancelled(ResourceKey),
}

impl ApplyError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Cluster(e) => e.is_transient(),
            Self::ConflictRetriesExhausted { .. } => true,
            Self::Cancelled(_) => false,
        }
    }
}

/// Errors returned by the inbound engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("release {release} not found for service {service}")]
    ReleaseNotFound { service: String, release: String },

    #[error("release {release} of service {service} is not ready")]
    ReleaseNotReady { service: String, release: String },

    #[error("service {service} already has an active rollout to {release}")]
    RolloutInProgress { service: String, release: String },

    #[error("service {service} is already serving release {release}")]
    AlreadyServing { service: String, release: String },

    #[error("service {0} has nothing deployed to roll back from")]
    NothingDeployed(String),

    #[error(
        "service {0} mounts exclusive (ReadWriteOnce) volumes; a canary would need two writers"
    )]
    ExclusiveVolumes(String),

    #[error("service {service} cannot use {namespace}/{name}: already owned by {owner}")]
    NameTaken {
        service: String,
        namespace: String,
        name: String,
        owner: String,
    },

    #[error(transparent)]
    Compose(#[from] ComposeError),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("platform error: {0}")]
    Cluster(#[from] ClusterError),
}

impl EngineError {
    /// Rejected request, as opposed to a failure worth retrying.
    pub fn is_rejection(&self) -> bool {
        !matches!(self, Self::State(_) | Self::Cluster(_))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

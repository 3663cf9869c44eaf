//! Resource client — create/get/update/delete/list against the platform.

use async_trait::async_trait;
use thiserror::Error;

use crate::resource::{LabelSelector, Resource, ResourceKind};

pub type ClusterResult<T> = Result<T, ClusterError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClusterError {
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: ResourceKind,
        namespace: String,
        name: String,
    },

    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists {
        kind: ResourceKind,
        namespace: String,
        name: String,
    },

    #[error("{kind} {namespace}/{name} changed: expected version {expected}, found {actual}")]
    Conflict {
        kind: ResourceKind,
        namespace: String,
        name: String,
        expected: u64,
        actual: u64,
    },

    #[error("platform unavailable: {0}")]
    Unavailable(String),

    #[error("rejected by platform: {0}")]
    Invalid(String),
}

impl ClusterError {
    /// Worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Conflict { .. } | Self::Unavailable(_) | Self::AlreadyExists { .. }
        )
    }
}

/// Operations the engine needs from the orchestration platform.
///
/// `update` carries the caller's last-read `resource_version`; the platform
/// rejects the write with [`ClusterError::Conflict`] if the object changed
/// since.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    async fn create(&self, resource: Resource) -> ClusterResult<Resource>;

    async fn get(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> ClusterResult<Option<Resource>>;

    async fn update(&self, resource: Resource) -> ClusterResult<Resource>;

    async fn delete(&self, kind: ResourceKind, namespace: &str, name: &str) -> ClusterResult<()>;

    async fn list(
        &self,
        kind: ResourceKind,
        namespace: &str,
        selector: &LabelSelector,
    ) -> ClusterResult<Vec<Resource>>;

    /// Create the namespace, labelled as managed by keel, unless it exists.
    /// Returns whether it was created.
    async fn ensure_namespace(&self, namespace: &str) -> ClusterResult<bool>;
}

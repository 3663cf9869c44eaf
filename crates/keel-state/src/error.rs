//! Error types for the Keel state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors surfaced by [`StateStore`](crate::StateStore).
///
/// Engine errors from redb are carried as-is so callers can tell a missing
/// or locked database file apart from a failed commit.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("state database unavailable: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("state transaction could not begin: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("state table unavailable: {0}")]
    Table(#[from] redb::TableError),

    #[error("state storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("state commit failed: {0}")]
    Commit(#[from] redb::CommitError),

    /// A value could not be encoded or a stored row could not be decoded,
    /// e.g. a record written by an incompatible version.
    #[error("{table} entry {key:?} is not valid JSON for its type: {source}")]
    Codec {
        table: String,
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("release {release_id} of service {service_id} not found")]
    ReleaseNotFound {
        service_id: String,
        release_id: String,
    },
}

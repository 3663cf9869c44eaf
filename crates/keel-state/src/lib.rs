//! keel-state — embedded state store for Keel.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! state for service specs, releases, reconciliation records and SLO
//! signal snapshots.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{service_id}:{release_id}`) enable prefix scans for
//! everything belonging to one service.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;

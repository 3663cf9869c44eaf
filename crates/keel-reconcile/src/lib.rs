//! keel-reconcile — the service reconciliation engine.
//!
//! Turns a declarative [`ServiceSpec`](keel_state::ServiceSpec) into
//! platform resources and keeps them converged.
//!
//! # Components
//!
//! - **`manifest`** — Pure composition of the desired resource set for a traffic plan
//! - **`routing`** — Route/domain merge into one routing resource per service
//! - **`volumes`** — Claim lifecycle: create once, reuse, delete on teardown
//! - **`apply`** — Diff desired against observed and apply with conflict retries
//! - **`dispatcher`** — Keyed work queue and fixed worker pool with backoff
//! - **`status`** — Reconciliation records with a bounded cache
//! - **`reconciler`** — One reconciliation pass for one service
//! - **`engine`** — Inbound operations: reconcile, status, promote, rollback, delete

pub mod apply;
pub mod clock;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod labels;
pub mod manifest;
pub mod reconciler;
pub mod routing;
pub mod settings;
pub mod signals;
pub mod status;
pub mod validate;
pub mod volumes;

#[cfg(test)]
mod fixtures;

pub use clock::{Clock, ManualClock, SystemClock};
pub use dispatcher::{Dispatcher, PassOutcome};
pub use engine::Engine;
pub use error::{ComposeError, EngineError, EngineResult};
pub use manifest::{ComposeOptions, DesiredResourceSet, TrafficPlan, compose};
pub use settings::EngineSettings;
pub use signals::{DomainVerifier, MemoryDomains, RecordedDomains, SloSignals, StoreSignals};
pub use status::StatusReporter;

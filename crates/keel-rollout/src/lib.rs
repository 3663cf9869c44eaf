//! Keel progressive delivery: canary analysis, promotion and rollback.
//!
//! This crate holds the rollout state machine. It is pure: callers pass
//! in observations (workload readiness, SLO samples) together with the
//! current time, and act on the returned [`RolloutAction`]. Nothing here
//! talks to the orchestration platform.
//!
//! # Components
//!
//! - **`strategy`** — Rollout strategy configuration (Direct, Canary) and rollback monitoring
//! - **`controller`** — Rollout state machine (start, advance, traffic split)

pub mod controller;
pub mod strategy;

pub use controller::{
    Observation, Rollout, RolloutAction, RolloutKind, RolloutPhase, SloSample, Track,
    TrafficShare,
};
pub use strategy::{CanaryConfig, RollbackConfig, RolloutStrategy};

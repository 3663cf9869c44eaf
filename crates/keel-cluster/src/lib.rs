//! keel-cluster — the engine's view of the orchestration platform.
//!
//! - **`resource`** — Resource model (workloads, exposures, routing, claims, autoscalers, network policies)
//! - **`client`** — `ResourceClient` trait and its error type
//! - **`k8s`** — Kubernetes backend using server-side apply
//! - **`memory`** — In-process backend with optimistic concurrency and fault injection

pub mod client;
pub mod k8s;
pub mod memory;
pub mod resource;

pub use client::{ClusterError, ClusterResult, ResourceClient};
pub use k8s::KubeCluster;
pub use memory::{FaultOp, MemoryCluster};
pub use resource::*;

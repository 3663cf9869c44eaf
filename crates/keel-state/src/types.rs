//! Domain types for the Keel state store.
//!
//! Service specs and releases are written by the API layer and the build
//! pipeline; the engine only reads them (apart from marking a rolled-back
//! release failed). Reconciliation records are owned by the engine. All
//! types are serializable to/from JSON for storage in redb tables, and
//! every map is a `BTreeMap` so serialized output is deterministic.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use keel_rollout::{Rollout, RolloutStrategy};

/// Service identity, `{project}/{name}`.
pub type ServiceId = String;

/// Unique identifier for a release of a service.
pub type ReleaseId = String;

// ── Service spec ───────────────────────────────────────────────────

/// Declarative description of a service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceSpec {
    pub id: ServiceId,
    /// DNS-1123 label used for every managed resource name.
    pub name: String,
    pub namespace: String,
    pub project: String,
    /// Bumped by the API layer on every change.
    pub version: u64,
    /// Empty means a single `http` port on 4200.
    #[serde(default)]
    pub ports: Vec<ServicePort>,
    #[serde(default)]
    pub resources: ResourceRequests,
    pub replicas: ReplicaBounds,
    #[serde(default)]
    pub env: BTreeMap<String, EnvSource>,
    #[serde(default)]
    pub routes: Vec<Route>,
    #[serde(default)]
    pub domains: Vec<CustomDomain>,
    #[serde(default)]
    pub volumes: Vec<Volume>,
    #[serde(default)]
    pub autoscaling: Option<AutoscalingTarget>,
    #[serde(default)]
    pub health: Option<HealthCheck>,
    /// Registry credentials secret for pulling release images.
    #[serde(default)]
    pub image_pull_secret: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl ServiceSpec {
    pub fn table_key(&self) -> String {
        self.id.clone()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServicePort {
    pub name: String,
    /// Kept wide so out-of-range values are reported instead of failing to parse.
    pub port: u32,
    #[serde(default)]
    pub protocol: Protocol,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

/// Container resource requests and limits. Unset values take platform defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ResourceRequests {
    pub cpu_request: Option<String>,
    pub cpu_limit: Option<String>,
    pub memory_request: Option<String>,
    pub memory_limit: Option<String>,
}

/// Min/max replica count for a service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplicaBounds {
    pub min: u32,
    pub max: u32,
}

/// Where an environment variable's value comes from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EnvSource {
    Value(String),
    /// Reference to a key in a platform secret. The value never enters the spec.
    Secret { name: String, key: String },
}

/// A host+path rule directing traffic to one of the service's ports.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Route {
    /// `None` applies the route to every custom domain of the service.
    #[serde(default)]
    pub host: Option<String>,
    pub path: String,
    #[serde(default)]
    pub path_type: PathType,
    pub target_port: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum PathType {
    Exact,
    #[default]
    Prefix,
    ImplementationSpecific,
}

/// A user-owned DNS name bound to a service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CustomDomain {
    pub domain: String,
    #[serde(default)]
    pub verification: VerificationState,
    #[serde(default)]
    pub tls: TlsState,
    /// Certificate issuer; the platform default when unset.
    #[serde(default)]
    pub issuer: Option<String>,
    /// Hold the host out of routing until a certificate is issued.
    #[serde(default)]
    pub require_tls: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum VerificationState {
    #[default]
    Unverified,
    PendingCheck,
    Verified,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TlsState {
    #[default]
    None,
    Requested,
    Issued,
    Renewing,
    Expired,
}

/// A persistent volume declared by a service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Volume {
    pub name: String,
    pub mount_path: String,
    /// Quantity such as `1Gi`.
    pub size: String,
    #[serde(default)]
    pub storage_class: Option<String>,
    #[serde(default)]
    pub access_mode: AccessMode,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum AccessMode {
    #[default]
    ReadWriteOnce,
    ReadWriteMany,
    ReadOnlyMany,
}

impl AccessMode {
    /// At most one writer may mount the claim.
    pub fn is_exclusive(&self) -> bool {
        matches!(self, Self::ReadWriteOnce)
    }
}

/// Horizontal autoscaling target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AutoscalingTarget {
    pub metric: ScalingMetric,
    /// Utilization percent for cpu/memory, requests per second per replica otherwise.
    pub target: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScalingMetric {
    Cpu,
    Memory,
    RequestsPerSecond,
}

/// Liveness/readiness probe overrides.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct HealthCheck {
    #[serde(default)]
    pub disabled: bool,
    /// Liveness path; `/health` when unset.
    #[serde(default)]
    pub liveness_path: Option<String>,
    /// Readiness path; the liveness path when unset.
    #[serde(default)]
    pub readiness_path: Option<String>,
    /// Probe port; the primary service port when unset.
    #[serde(default)]
    pub port: Option<u32>,
}

// ── Release ────────────────────────────────────────────────────────

/// An immutable build artifact of a service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Release {
    pub id: ReleaseId,
    pub service_id: ServiceId,
    pub version: u64,
    pub image: String,
    #[serde(default)]
    pub source_revision: Option<String>,
    #[serde(default)]
    pub provenance: Option<Provenance>,
    pub status: ReleaseStatus,
    pub created_at: u64,
}

impl Release {
    pub fn table_key(&self) -> String {
        release_key(&self.service_id, &self.id)
    }

    pub fn is_ready(&self) -> bool {
        self.status == ReleaseStatus::Ready
    }
}

pub fn release_key(service_id: &str, release_id: &str) -> String {
    format!("{service_id}:{release_id}")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Provenance {
    pub builder: String,
    pub build_id: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseStatus {
    Building,
    Ready,
    Failed,
}

// ── Deployment ─────────────────────────────────────────────────────

/// The release currently deployed to a service's environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentRecord {
    pub release_id: ReleaseId,
    /// Namespace the release runs in.
    pub environment: String,
    pub replicas: u32,
    pub strategy: RolloutStrategy,
    pub deployed_at: u64,
}

// ── Reconciliation record ──────────────────────────────────────────

/// Convergence state, used both per sub-resource and for the whole service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileState {
    #[default]
    Pending,
    Applying,
    Healthy,
    Degraded,
    Failed,
}

/// Last known state of one managed resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubResourceStatus {
    pub kind: String,
    pub name: String,
    pub state: ReconcileState,
    /// Hash of the last applied desired object.
    #[serde(default)]
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub resource_version: Option<u64>,
    #[serde(default)]
    pub message: Option<String>,
    pub updated_at: u64,
}

impl SubResourceStatus {
    pub fn key(&self) -> String {
        format!("{}/{}", self.kind, self.name)
    }
}

/// A host held out of routing, with the reason.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingHost {
    pub host: String,
    pub reason: String,
}

/// Everything the engine knows about a service's convergence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconciliationRecord {
    pub service_id: ServiceId,
    /// Where the service's resources live; kept so teardown works after
    /// the spec is gone.
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub project: String,
    pub phase: ReconcileState,
    /// Spec version the last pass worked from.
    #[serde(default)]
    pub observed_spec_version: u64,
    /// Keyed by `{kind}/{name}`.
    #[serde(default)]
    pub resources: BTreeMap<String, SubResourceStatus>,
    #[serde(default)]
    pub pending_hosts: Vec<PendingHost>,
    #[serde(default)]
    pub deployment: Option<DeploymentRecord>,
    /// At most one rollout is active per service.
    #[serde(default)]
    pub rollout: Option<Rollout>,
    #[serde(default)]
    pub last_rollout: Option<Rollout>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Consecutive failed passes.
    #[serde(default)]
    pub attempts: u32,
    pub updated_at: u64,
}

impl ReconciliationRecord {
    pub fn new(service_id: &str) -> Self {
        Self {
            service_id: service_id.to_string(),
            namespace: String::new(),
            name: String::new(),
            project: String::new(),
            phase: ReconcileState::Pending,
            observed_spec_version: 0,
            resources: BTreeMap::new(),
            pending_hosts: Vec::new(),
            deployment: None,
            rollout: None,
            last_rollout: None,
            message: None,
            last_error: None,
            attempts: 0,
            updated_at: epoch_secs(),
        }
    }

    pub fn table_key(&self) -> String {
        self.service_id.clone()
    }

    /// The release currently taking traffic, if any.
    pub fn serving_release(&self) -> Option<&str> {
        self.deployment.as_ref().map(|d| d.release_id.as_str())
    }
}

// ── SLO signals ────────────────────────────────────────────────────

/// SLO reading for one release, written by the metrics collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalSnapshot {
    pub service_id: ServiceId,
    pub release_id: ReleaseId,
    /// Error rate as a percentage (0-100).
    pub error_rate: f64,
    pub p99_latency_ms: u64,
    pub request_count: u64,
    /// Unix timestamp (seconds) of the reading.
    pub epoch: u64,
}

impl SignalSnapshot {
    /// Zero-padded epoch so lexicographic key order is chronological.
    pub fn table_key(&self) -> String {
        format!("{}:{}:{:020}", self.service_id, self.release_id, self.epoch)
    }
}

pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

//! Resource model for the orchestration platform.
//!
//! A [`Resource`] is metadata plus one of a closed set of specs. The engine
//! writes `meta` labels/annotations and `spec`; the platform owns `uid`,
//! `resource_version` and `status`.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use keel_state::{AccessMode, PathType, Protocol, ScalingMetric};

/// Label key/value pairs that must all match.
pub type LabelSelector = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Workload,
    Exposure,
    Routing,
    VolumeClaim,
    Autoscaler,
    NetworkPolicy,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 6] = [
        ResourceKind::VolumeClaim,
        ResourceKind::NetworkPolicy,
        ResourceKind::Workload,
        ResourceKind::Exposure,
        ResourceKind::Autoscaler,
        ResourceKind::Routing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Workload => "workload",
            Self::Exposure => "exposure",
            Self::Routing => "routing",
            Self::VolumeClaim => "volume_claim",
            Self::Autoscaler => "autoscaler",
            Self::NetworkPolicy => "network_policy",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a resource on the platform.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Assigned by the platform on create.
    #[serde(default)]
    pub uid: Option<String>,
    /// Bumped by the platform on every write; 0 before the first create.
    #[serde(default)]
    pub resource_version: u64,
}

impl ObjectMeta {
    pub fn new(name: &str, namespace: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            ..Default::default()
        }
    }

    pub fn matches(&self, selector: &LabelSelector) -> bool {
        selector
            .iter()
            .all(|(k, v)| self.labels.get(k).is_some_and(|have| have == v))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub meta: ObjectMeta,
    pub spec: ResourceSpec,
    #[serde(default)]
    pub status: ResourceStatus,
}

impl Resource {
    pub fn new(meta: ObjectMeta, spec: ResourceSpec) -> Self {
        Self {
            meta,
            spec,
            status: ResourceStatus::default(),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.spec.kind()
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey {
            kind: self.kind(),
            namespace: self.meta.namespace.clone(),
            name: self.meta.name.clone(),
        }
    }

    /// SHA-256 of the engine-owned parts (labels, annotations, spec).
    pub fn fingerprint(&self) -> String {
        #[derive(Serialize)]
        struct Owned<'a> {
            labels: &'a BTreeMap<String, String>,
            annotations: &'a BTreeMap<String, String>,
            spec: &'a ResourceSpec,
        }
        let owned = Owned {
            labels: &self.meta.labels,
            annotations: &self.meta.annotations,
            spec: &self.spec,
        };
        // Serializing plain structs and BTreeMaps cannot fail.
        let bytes = serde_json::to_vec(&owned).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }

    /// Workloads are ready once every desired replica reports ready.
    /// Other kinds are ready as soon as they exist.
    pub fn is_ready(&self) -> bool {
        match &self.spec {
            ResourceSpec::Workload(w) => self.status.ready_replicas >= w.replicas,
            ResourceSpec::VolumeClaim(_) => self.status.bound,
            _ => true,
        }
    }

    pub fn as_workload(&self) -> Option<&WorkloadSpec> {
        match &self.spec {
            ResourceSpec::Workload(w) => Some(w),
            _ => None,
        }
    }

    pub fn as_routing(&self) -> Option<&RoutingSpec> {
        match &self.spec {
            ResourceSpec::Routing(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_claim(&self) -> Option<&ClaimSpec> {
        match &self.spec {
            ResourceSpec::VolumeClaim(c) => Some(c),
            _ => None,
        }
    }
}

/// Platform-reported state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ResourceStatus {
    #[serde(default)]
    pub ready_replicas: u32,
    /// Backing volume of a bound claim.
    #[serde(default)]
    pub volume_handle: Option<String>,
    #[serde(default)]
    pub bound: bool,
    /// A workload's pods are stuck in a state they will not leave without
    /// a new image or configuration (image pull failure, crash loop).
    #[serde(default)]
    pub failure: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceSpec {
    Workload(WorkloadSpec),
    Exposure(ExposureSpec),
    Routing(RoutingSpec),
    VolumeClaim(ClaimSpec),
    Autoscaler(AutoscalerSpec),
    NetworkPolicy(NetworkPolicySpec),
}

impl ResourceSpec {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Workload(_) => ResourceKind::Workload,
            Self::Exposure(_) => ResourceKind::Exposure,
            Self::Routing(_) => ResourceKind::Routing,
            Self::VolumeClaim(_) => ResourceKind::VolumeClaim,
            Self::Autoscaler(_) => ResourceKind::Autoscaler,
            Self::NetworkPolicy(_) => ResourceKind::NetworkPolicy,
        }
    }
}

// ── Workload ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadSpec {
    pub replicas: u32,
    /// Immutable after create.
    pub selector: LabelSelector,
    pub template_labels: BTreeMap<String, String>,
    pub strategy: UpdateStrategy,
    pub container: Container,
    #[serde(default)]
    pub volumes: Vec<PodVolume>,
    #[serde(default)]
    pub image_pull_secrets: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UpdateStrategy {
    RollingUpdate {
        max_surge: String,
        max_unavailable: String,
    },
    /// Stop old replicas before starting new ones.
    Recreate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub name: String,
    pub image: String,
    pub ports: Vec<ContainerPort>,
    pub env: Vec<EnvVar>,
    pub resources: ContainerResources,
    #[serde(default)]
    pub liveness: Option<Probe>,
    #[serde(default)]
    pub readiness: Option<Probe>,
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMount>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerPort {
    pub name: String,
    pub container_port: u16,
    pub protocol: Protocol,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub secret_ref: Option<SecretKeyRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretKeyRef {
    pub name: String,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ContainerResources {
    pub requests: BTreeMap<String, String>,
    pub limits: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Probe {
    pub path: String,
    pub port: u16,
    pub initial_delay_secs: u32,
    pub timeout_secs: u32,
    pub period_secs: u32,
    pub failure_threshold: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodVolume {
    pub name: String,
    pub claim_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub name: String,
    pub mount_path: String,
}

// ── Exposure ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposureSpec {
    pub selector: LabelSelector,
    pub ports: Vec<ExposurePort>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposurePort {
    pub name: String,
    pub port: u16,
    pub target_port: u16,
    pub protocol: Protocol,
}

// ── Routing ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingSpec {
    pub ingress_class: String,
    pub rules: Vec<RoutingRule>,
    #[serde(default)]
    pub tls: Vec<TlsEntry>,
}

impl RoutingSpec {
    pub fn rule(&self, host: &str) -> Option<&RoutingRule> {
        self.rules.iter().find(|r| r.host == host)
    }

    pub fn hosts(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.host.as_str()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingRule {
    pub host: String,
    pub paths: Vec<RoutingPath>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingPath {
    pub path: String,
    pub path_type: PathType,
    pub backends: Vec<Backend>,
}

/// Traffic destination. Weights across one path's backends sum to 100.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backend {
    /// Exposure name.
    pub service: String,
    pub port: u16,
    pub weight: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsEntry {
    pub hosts: Vec<String>,
    pub secret_name: String,
}

// ── Volume claim ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimSpec {
    pub storage_class: String,
    pub access_modes: Vec<AccessMode>,
    pub size: String,
}

// ── Autoscaler ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoscalerSpec {
    /// Workload name scaled by this autoscaler.
    pub target: String,
    pub min_replicas: u32,
    pub max_replicas: u32,
    pub metric: ScalingMetric,
    pub target_value: u32,
}

// ── Network policy ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyDirection {
    Ingress,
    Egress,
}

/// Allow-list for one traffic direction of the selected pods. Anything
/// not matched by a rule is denied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPolicySpec {
    pub pod_selector: LabelSelector,
    pub direction: PolicyDirection,
    pub rules: Vec<PolicyRule>,
}

/// Traffic to or from any of `peers` on any of `ports`. An empty list
/// matches everything for that field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    #[serde(default)]
    pub peers: Vec<PolicyPeer>,
    #[serde(default)]
    pub ports: Vec<PolicyPort>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PolicyPeer {
    /// Every pod in the named namespace.
    Namespace { name: String },
    /// Pods matching `pods` in the named namespace.
    NamespacePods { name: String, pods: LabelSelector },
    /// An address range, e.g. `10.0.0.0/8`.
    IpBlock { cidr: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyPort {
    pub port: u16,
    pub protocol: Protocol,
}

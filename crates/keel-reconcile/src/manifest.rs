//! Manifest composer — `ServiceSpec × Release(s) → DesiredResourceSet`.
//!
//! Pure and deterministic: the same spec, traffic plan and options always
//! produce byte-identical resources. Nothing here reads the clock or the
//! platform.

use std::collections::BTreeMap;

use keel_cluster::{
    AutoscalerSpec, ClaimSpec, Container, ContainerPort, ContainerResources, EnvVar,
    ExposurePort, ExposureSpec, LabelSelector, NetworkPolicySpec, ObjectMeta, PodVolume,
    PolicyDirection, PolicyPeer, PolicyPort, PolicyRule, Probe, Resource, ResourceKind,
    ResourceSpec, SecretKeyRef, UpdateStrategy, VolumeMount, WorkloadSpec,
};
use keel_rollout::Track;
use keel_state::{EnvSource, PendingHost, Protocol, Release, ServicePort, ServiceSpec};

use crate::error::ComposeError;
use crate::labels;
use crate::routing::{BackendPlan, compose_routing};
use crate::validate::{validate_release, validate_spec};
use crate::volumes::{claim_name, requires_exclusive_access};

pub const DEFAULT_PORT: u16 = 4200;
const DEFAULT_CPU_REQUEST: &str = "100m";
const DEFAULT_CPU_LIMIT: &str = "500m";
const DEFAULT_MEMORY_REQUEST: &str = "128Mi";
const DEFAULT_MEMORY_LIMIT: &str = "512Mi";
const DEFAULT_HEALTH_PATH: &str = "/health";
const CANARY_REPLICAS: u32 = 1;
const DNS_NAMESPACE: &str = "kube-system";
const HTTPS_PORT: u16 = 443;

/// Platform-wide composition defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeOptions {
    pub ingress_class: String,
    pub default_issuer: String,
    pub default_storage_class: String,
    /// Emit `{name}-ingress` and `{name}-egress` network policies.
    pub network_policies: bool,
    /// Namespaces allowed to open connections to the service's pods.
    pub ingress_namespaces: Vec<String>,
    /// Namespaces the pods may reach besides their own and cluster DNS.
    pub egress_namespaces: Vec<String>,
}

impl Default for ComposeOptions {
    fn default() -> Self {
        Self {
            ingress_class: "nginx".to_string(),
            default_issuer: "letsencrypt-prod".to_string(),
            default_storage_class: "standard".to_string(),
            network_policies: true,
            ingress_namespaces: vec!["ingress-nginx".to_string()],
            egress_namespaces: Vec::new(),
        }
    }
}

/// Which release(s) serve the service.
#[derive(Debug, Clone, PartialEq)]
pub enum TrafficPlan {
    Single(Release),
    /// `stable` keeps `100 - canary_weight` percent of traffic.
    Split {
        stable: Release,
        canary: Release,
        canary_weight: u32,
    },
}

impl TrafficPlan {
    pub fn releases(&self) -> Vec<&Release> {
        match self {
            Self::Single(r) => vec![r],
            Self::Split { stable, canary, .. } => vec![stable, canary],
        }
    }
}

/// Everything the service should look like on the platform.
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredResourceSet {
    /// Network policies, workloads, exposures, autoscaler and routing, in
    /// apply order.
    pub resources: Vec<Resource>,
    /// Volume claims; created once and never patched.
    pub claims: Vec<Resource>,
    pub pending_hosts: Vec<PendingHost>,
}

impl DesiredResourceSet {
    pub fn get(&self, kind: ResourceKind, name: &str) -> Option<&Resource> {
        self.resources
            .iter()
            .chain(self.claims.iter())
            .find(|r| r.kind() == kind && r.meta.name == name)
    }

    pub fn routing(&self) -> Option<&Resource> {
        self.resources
            .iter()
            .find(|r| r.kind() == ResourceKind::Routing)
    }
}

/// The port traffic goes to when nothing else is said.
pub fn primary_port(spec: &ServiceSpec) -> u16 {
    spec.ports
        .first()
        .and_then(|p| u16::try_from(p.port).ok())
        .unwrap_or(DEFAULT_PORT)
}

fn ports(spec: &ServiceSpec) -> Vec<ServicePort> {
    if spec.ports.is_empty() {
        vec![ServicePort {
            name: "http".to_string(),
            port: u32::from(DEFAULT_PORT),
            protocol: Protocol::Tcp,
        }]
    } else {
        spec.ports.clone()
    }
}

fn port16(port: u32) -> u16 {
    u16::try_from(port).unwrap_or(DEFAULT_PORT)
}

/// Compose the desired resource set. Validation problems are returned all
/// at once and never reach the platform.
pub fn compose(
    spec: &ServiceSpec,
    plan: &TrafficPlan,
    opts: &ComposeOptions,
) -> Result<DesiredResourceSet, ComposeError> {
    let mut problems = validate_spec(spec);
    for release in plan.releases() {
        problems.extend(validate_release(spec, release));
    }
    if let TrafficPlan::Split { canary_weight, .. } = plan {
        if *canary_weight > 99 {
            problems.push(format!("canary weight {canary_weight} must be below 100"));
        }
        if requires_exclusive_access(&spec.volumes) {
            problems.push(
                "canary split cannot share ReadWriteOnce volumes between two workloads"
                    .to_string(),
            );
        }
    }

    let backend_plan = match plan {
        TrafficPlan::Single(_) => BackendPlan::Single,
        TrafficPlan::Split { canary_weight, .. } => BackendPlan::Split {
            canary_weight: *canary_weight,
        },
    };
    let routing = match compose_routing(spec, backend_plan, opts) {
        Ok(routing) => Some(routing),
        Err(conflicts) => {
            problems.extend(conflicts);
            None
        }
    };
    if !problems.is_empty() {
        return Err(ComposeError::InvalidSpec(problems));
    }

    let mut resources = Vec::new();
    if opts.network_policies {
        resources.extend(network_policies(spec, opts));
    }
    match plan {
        TrafficPlan::Single(release) => {
            resources.push(workload(spec, release, Track::Stable));
            resources.push(exposure(spec, Track::Stable));
        }
        TrafficPlan::Split { stable, canary, .. } => {
            resources.push(workload(spec, stable, Track::Stable));
            resources.push(workload(spec, canary, Track::Canary));
            resources.push(exposure(spec, Track::Stable));
            resources.push(exposure(spec, Track::Canary));
        }
    }
    if let Some(autoscaler) = autoscaler(spec) {
        resources.push(autoscaler);
    }

    let mut pending_hosts = Vec::new();
    if let Some(routing) = routing {
        if let Some(resource) = routing.resource {
            resources.push(resource);
        }
        pending_hosts = routing.pending_hosts;
    }

    Ok(DesiredResourceSet {
        resources,
        claims: claims(spec, opts),
        pending_hosts,
    })
}

fn workload(spec: &ServiceSpec, release: &Release, track: Track) -> Resource {
    let name = labels::track_name(&spec.name, track);
    let selector = labels::track_selector(&spec.name, track);

    let mut template_labels = selector.clone();
    template_labels.insert(labels::PROJECT.to_string(), spec.project.clone());
    template_labels.insert(labels::MANAGED_BY.to_string(), labels::MANAGER.to_string());
    template_labels.insert(labels::RELEASE.to_string(), release.id.clone());

    let mut meta = ObjectMeta::new(&name, &spec.namespace);
    meta.labels = labels::managed(&spec.project, &spec.name);
    meta.labels
        .insert(labels::TRACK.to_string(), track.as_str().to_string());
    meta.labels
        .insert(labels::RELEASE.to_string(), release.id.clone());
    meta.annotations.insert(
        labels::RELEASE_VERSION.to_string(),
        release.version.to_string(),
    );
    if let Some(revision) = &release.source_revision {
        meta.annotations
            .insert(labels::SOURCE_REVISION.to_string(), revision.clone());
    }

    let autoscaled = track == Track::Stable && autoscaler(spec).is_some();
    if autoscaled {
        meta.annotations
            .insert(labels::REPLICAS_OWNER.to_string(), "autoscaler".to_string());
    }
    let replicas = match track {
        Track::Stable => spec.replicas.min,
        Track::Canary => CANARY_REPLICAS,
    };

    let strategy = if requires_exclusive_access(&spec.volumes) {
        UpdateStrategy::Recreate
    } else {
        UpdateStrategy::RollingUpdate {
            max_surge: "25%".to_string(),
            max_unavailable: "25%".to_string(),
        }
    };

    let volumes = spec
        .volumes
        .iter()
        .map(|v| PodVolume {
            name: v.name.clone(),
            claim_name: claim_name(&spec.name, &v.name),
        })
        .collect();
    let volume_mounts = spec
        .volumes
        .iter()
        .map(|v| VolumeMount {
            name: v.name.clone(),
            mount_path: v.mount_path.clone(),
        })
        .collect();

    let (liveness, readiness) = probes(spec);

    Resource::new(
        meta,
        ResourceSpec::Workload(WorkloadSpec {
            replicas,
            selector,
            template_labels,
            strategy,
            container: Container {
                name: spec.name.clone(),
                image: release.image.clone(),
                ports: ports(spec)
                    .into_iter()
                    .map(|p| ContainerPort {
                        name: p.name,
                        container_port: port16(p.port),
                        protocol: p.protocol,
                    })
                    .collect(),
                env: env(spec, release),
                resources: resources(spec),
                liveness,
                readiness,
                volume_mounts,
            },
            volumes,
            image_pull_secrets: spec.image_pull_secret.iter().cloned().collect(),
        }),
    )
}

/// Platform variables first, then the declared bindings; sorted by name.
fn env(spec: &ServiceSpec, release: &Release) -> Vec<EnvVar> {
    let mut vars: BTreeMap<String, EnvVar> = BTreeMap::new();
    let mut plain = |name: &str, value: String| {
        vars.insert(
            name.to_string(),
            EnvVar {
                name: name.to_string(),
                value: Some(value),
                secret_ref: None,
            },
        );
    };
    plain("PORT", primary_port(spec).to_string());
    plain("KEEL_SERVICE_NAME", spec.name.clone());
    plain("KEEL_PROJECT", spec.project.clone());
    plain("KEEL_RELEASE_ID", release.id.clone());
    plain("KEEL_RELEASE_VERSION", release.version.to_string());

    for (name, source) in &spec.env {
        let var = match source {
            EnvSource::Value(value) => EnvVar {
                name: name.clone(),
                value: Some(value.clone()),
                secret_ref: None,
            },
            EnvSource::Secret { name: secret, key } => EnvVar {
                name: name.clone(),
                value: None,
                secret_ref: Some(SecretKeyRef {
                    name: secret.clone(),
                    key: key.clone(),
                }),
            },
        };
        vars.insert(name.clone(), var);
    }
    vars.into_values().collect()
}

fn resources(spec: &ServiceSpec) -> ContainerResources {
    let r = &spec.resources;
    let pick = |v: &Option<String>, default: &str| v.clone().unwrap_or_else(|| default.to_string());
    ContainerResources {
        requests: BTreeMap::from([
            ("cpu".to_string(), pick(&r.cpu_request, DEFAULT_CPU_REQUEST)),
            ("memory".to_string(), pick(&r.memory_request, DEFAULT_MEMORY_REQUEST)),
        ]),
        limits: BTreeMap::from([
            ("cpu".to_string(), pick(&r.cpu_limit, DEFAULT_CPU_LIMIT)),
            ("memory".to_string(), pick(&r.memory_limit, DEFAULT_MEMORY_LIMIT)),
        ]),
    }
}

fn probes(spec: &ServiceSpec) -> (Option<Probe>, Option<Probe>) {
    let health = spec.health.clone().unwrap_or_default();
    if health.disabled {
        return (None, None);
    }
    let port = health.port.map(port16).unwrap_or_else(|| primary_port(spec));
    let liveness_path = health
        .liveness_path
        .unwrap_or_else(|| DEFAULT_HEALTH_PATH.to_string());
    let readiness_path = health
        .readiness_path
        .unwrap_or_else(|| liveness_path.clone());

    let liveness = Probe {
        path: liveness_path,
        port,
        initial_delay_secs: 30,
        timeout_secs: 5,
        period_secs: 10,
        failure_threshold: 3,
    };
    let readiness = Probe {
        path: readiness_path,
        port,
        initial_delay_secs: 5,
        timeout_secs: 3,
        period_secs: 5,
        failure_threshold: 2,
    };
    (Some(liveness), Some(readiness))
}

fn exposure(spec: &ServiceSpec, track: Track) -> Resource {
    let mut meta = ObjectMeta::new(&labels::track_name(&spec.name, track), &spec.namespace);
    meta.labels = labels::managed(&spec.project, &spec.name);
    meta.labels
        .insert(labels::TRACK.to_string(), track.as_str().to_string());

    Resource::new(
        meta,
        ResourceSpec::Exposure(ExposureSpec {
            selector: labels::track_selector(&spec.name, track),
            ports: ports(spec)
                .into_iter()
                .map(|p| ExposurePort {
                    name: p.name,
                    port: port16(p.port),
                    target_port: port16(p.port),
                    protocol: p.protocol,
                })
                .collect(),
        }),
    )
}

/// Emitted only when the bounds leave the autoscaler room to act.
fn autoscaler(spec: &ServiceSpec) -> Option<Resource> {
    let target = spec.autoscaling.as_ref()?;
    if spec.replicas.max <= spec.replicas.min {
        return None;
    }
    let mut meta = ObjectMeta::new(&spec.name, &spec.namespace);
    meta.labels = labels::managed(&spec.project, &spec.name);
    Some(Resource::new(
        meta,
        ResourceSpec::Autoscaler(AutoscalerSpec {
            target: labels::track_name(&spec.name, Track::Stable),
            min_replicas: spec.replicas.min.max(1),
            max_replicas: spec.replicas.max,
            metric: target.metric,
            target_value: target.target,
        }),
    ))
}

/// Default-deny policies for the service's pods: ingress from the ingress
/// controller and the service's own namespace on its ports; egress to
/// cluster DNS, its own namespace, the configured namespaces and HTTPS.
fn network_policies(spec: &ServiceSpec, opts: &ComposeOptions) -> Vec<Resource> {
    let namespace = |name: &str| PolicyPeer::Namespace {
        name: name.to_string(),
    };
    let policy = |suffix: &str, direction, rules| {
        let mut meta = ObjectMeta::new(&format!("{}-{suffix}", spec.name), &spec.namespace);
        meta.labels = labels::managed(&spec.project, &spec.name);
        Resource::new(
            meta,
            ResourceSpec::NetworkPolicy(NetworkPolicySpec {
                pod_selector: labels::pod_selector(&spec.name),
                direction,
                rules,
            }),
        )
    };

    let mut sources: Vec<PolicyPeer> = opts
        .ingress_namespaces
        .iter()
        .map(|ns| namespace(ns))
        .collect();
    sources.push(namespace(&spec.namespace));
    let ingress = vec![PolicyRule {
        peers: sources,
        ports: ports(spec)
            .into_iter()
            .map(|p| PolicyPort {
                port: port16(p.port),
                protocol: p.protocol,
            })
            .collect(),
    }];

    let dns = |protocol| PolicyPort {
        port: 53,
        protocol,
    };
    let mut egress = vec![
        PolicyRule {
            peers: vec![PolicyPeer::NamespacePods {
                name: DNS_NAMESPACE.to_string(),
                pods: LabelSelector::from([("k8s-app".to_string(), "kube-dns".to_string())]),
            }],
            ports: vec![dns(Protocol::Udp), dns(Protocol::Tcp)],
        },
        PolicyRule {
            peers: vec![namespace(&spec.namespace)],
            ports: Vec::new(),
        },
    ];
    if !opts.egress_namespaces.is_empty() {
        egress.push(PolicyRule {
            peers: opts.egress_namespaces.iter().map(|ns| namespace(ns)).collect(),
            ports: Vec::new(),
        });
    }
    egress.push(PolicyRule {
        peers: Vec::new(),
        ports: vec![PolicyPort {
            port: HTTPS_PORT,
            protocol: Protocol::Tcp,
        }],
    });

    vec![
        policy("ingress", PolicyDirection::Ingress, ingress),
        policy("egress", PolicyDirection::Egress, egress),
    ]
}

fn claims(spec: &ServiceSpec, opts: &ComposeOptions) -> Vec<Resource> {
    spec.volumes
        .iter()
        .map(|volume| {
            let mut meta = ObjectMeta::new(&claim_name(&spec.name, &volume.name), &spec.namespace);
            meta.labels = labels::managed(&spec.project, &spec.name);
            meta.labels
                .insert("keel.dev/volume".to_string(), volume.name.clone());
            Resource::new(
                meta,
                ResourceSpec::VolumeClaim(ClaimSpec {
                    storage_class: volume
                        .storage_class
                        .clone()
                        .unwrap_or_else(|| opts.default_storage_class.clone()),
                    access_modes: vec![volume.access_mode],
                    size: volume.size.clone(),
                }),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{test_release, test_spec, verified_domain};
    use keel_state::{AccessMode, AutoscalingTarget, HealthCheck, ScalingMetric, Volume};

    fn compose_single(spec: &ServiceSpec) -> DesiredResourceSet {
        compose(
            spec,
            &TrafficPlan::Single(test_release("r1", 1)),
            &ComposeOptions::default(),
        )
        .unwrap()
    }

    fn workload_of<'a>(set: &'a DesiredResourceSet, name: &str) -> &'a WorkloadSpec {
        set.get(ResourceKind::Workload, name)
            .and_then(Resource::as_workload)
            .unwrap()
    }

    #[test]
    fn composition_is_deterministic() {
        let mut spec = test_spec();
        spec.domains.push(verified_domain("api.example.com"));
        spec.env.insert("B".into(), EnvSource::Value("2".into()));
        spec.env.insert("A".into(), EnvSource::Value("1".into()));

        let a = serde_json::to_vec(&compose_single(&spec).resources).unwrap();
        let b = serde_json::to_vec(&compose_single(&spec).resources).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn single_plan_produces_workload_exposure_and_defaults() {
        let set = compose_single(&test_spec());
        let kinds: Vec<_> = set.resources.iter().map(|r| r.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                ResourceKind::NetworkPolicy,
                ResourceKind::NetworkPolicy,
                ResourceKind::Workload,
                ResourceKind::Exposure
            ]
        );

        let w = workload_of(&set, "api");
        assert_eq!(w.replicas, 2);
        assert_eq!(w.container.image, "registry.local/api:r1");
        assert_eq!(w.selector.get(labels::TRACK).map(String::as_str), Some("stable"));
        assert_eq!(w.container.resources.requests["cpu"], "100m");
        assert_eq!(w.container.resources.limits["memory"], "512Mi");
        assert_eq!(w.container.liveness.as_ref().unwrap().path, "/health");
        assert_eq!(w.container.readiness.as_ref().unwrap().failure_threshold, 2);
        assert!(matches!(w.strategy, UpdateStrategy::RollingUpdate { .. }));

        let env: Vec<_> = w.container.env.iter().map(|e| e.name.as_str()).collect();
        assert!(env.contains(&"PORT"));
        assert!(env.contains(&"KEEL_RELEASE_ID"));
        assert!(set.pending_hosts.is_empty());
        assert!(set.routing().is_none());
    }

    #[test]
    fn secrets_are_references() {
        let mut spec = test_spec();
        spec.env.insert(
            "DATABASE_URL".into(),
            EnvSource::Secret {
                name: "db".into(),
                key: "url".into(),
            },
        );
        let set = compose_single(&spec);
        let var = workload_of(&set, "api")
            .container
            .env
            .iter()
            .find(|e| e.name == "DATABASE_URL")
            .unwrap()
            .clone();
        assert!(var.value.is_none());
        assert_eq!(var.secret_ref.unwrap().key, "url");
    }

    #[test]
    fn exclusive_volumes_force_recreate_and_produce_claims() {
        let mut spec = test_spec();
        spec.volumes.push(Volume {
            name: "data".into(),
            mount_path: "/var/data".into(),
            size: "1Gi".into(),
            storage_class: None,
            access_mode: AccessMode::ReadWriteOnce,
        });
        let set = compose_single(&spec);
        let w = workload_of(&set, "api");
        assert_eq!(w.strategy, UpdateStrategy::Recreate);
        assert_eq!(w.volumes[0].claim_name, "api-data");
        assert_eq!(w.container.volume_mounts[0].mount_path, "/var/data");

        assert_eq!(set.claims.len(), 1);
        let claim = set.claims[0].as_claim().unwrap();
        assert_eq!(claim.storage_class, "standard");
        assert_eq!(claim.access_modes, vec![AccessMode::ReadWriteOnce]);
    }

    #[test]
    fn autoscaler_only_when_bounds_allow() {
        let mut spec = test_spec();
        spec.autoscaling = Some(AutoscalingTarget {
            metric: ScalingMetric::Cpu,
            target: 70,
        });
        let set = compose_single(&spec);
        assert!(set.get(ResourceKind::Autoscaler, "api").is_some());
        let meta = &set.get(ResourceKind::Workload, "api").unwrap().meta;
        assert_eq!(
            meta.annotations.get(labels::REPLICAS_OWNER).map(String::as_str),
            Some("autoscaler")
        );

        spec.replicas.max = spec.replicas.min;
        let set = compose_single(&spec);
        assert!(set.get(ResourceKind::Autoscaler, "api").is_none());
    }

    #[test]
    fn split_plan_runs_both_tracks() {
        let mut spec = test_spec();
        spec.domains.push(verified_domain("api.example.com"));
        let set = compose(
            &spec,
            &TrafficPlan::Split {
                stable: test_release("r1", 1),
                canary: test_release("r2", 2),
                canary_weight: 10,
            },
            &ComposeOptions::default(),
        )
        .unwrap();

        assert_eq!(workload_of(&set, "api").container.image, "registry.local/api:r1");
        let canary = workload_of(&set, "api-canary");
        assert_eq!(canary.container.image, "registry.local/api:r2");
        assert_eq!(canary.replicas, 1);
        assert!(set.get(ResourceKind::Exposure, "api-canary").is_some());
        let routing = set.routing().unwrap().as_routing().unwrap();
        assert_eq!(routing.rules[0].paths[0].backends[1].weight, 10);
    }

    #[test]
    fn split_plan_refuses_exclusive_volumes() {
        let mut spec = test_spec();
        spec.volumes.push(Volume {
            name: "data".into(),
            mount_path: "/var/data".into(),
            size: "1Gi".into(),
            storage_class: None,
            access_mode: AccessMode::ReadWriteOnce,
        });
        let err = compose(
            &spec,
            &TrafficPlan::Split {
                stable: test_release("r1", 1),
                canary: test_release("r2", 2),
                canary_weight: 10,
            },
            &ComposeOptions::default(),
        )
        .unwrap_err();
        assert_eq!(err.problems().len(), 1);
        assert!(err.problems()[0].contains("ReadWriteOnce"));

        spec.volumes[0].access_mode = AccessMode::ReadWriteMany;
        assert!(
            compose(
                &spec,
                &TrafficPlan::Split {
                    stable: test_release("r1", 1),
                    canary: test_release("r2", 2),
                    canary_weight: 10,
                },
                &ComposeOptions::default(),
            )
            .is_ok()
        );
    }

    #[test]
    fn network_policies_cover_both_tracks() {
        let opts = ComposeOptions {
            egress_namespaces: vec!["data".into()],
            ..ComposeOptions::default()
        };
        let set = compose(
            &test_spec(),
            &TrafficPlan::Split {
                stable: test_release("r1", 1),
                canary: test_release("r2", 2),
                canary_weight: 10,
            },
            &opts,
        )
        .unwrap();

        let policy = |name: &str| match &set.get(ResourceKind::NetworkPolicy, name).unwrap().spec {
            ResourceSpec::NetworkPolicy(p) => p.clone(),
            _ => unreachable!(),
        };
        let ingress = policy("api-ingress");
        assert_eq!(ingress.direction, PolicyDirection::Ingress);
        assert!(!ingress.pod_selector.contains_key(labels::TRACK));
        let canary = workload_of(&set, "api-canary");
        assert!(
            ingress
                .pod_selector
                .iter()
                .all(|(k, v)| canary.template_labels.get(k) == Some(v))
        );
        assert_eq!(ingress.rules[0].ports[0].port, 8080);
        assert!(ingress.rules[0].peers.contains(&PolicyPeer::Namespace {
            name: "ingress-nginx".into()
        }));
        assert!(ingress.rules[0].peers.contains(&PolicyPeer::Namespace {
            name: "shop".into()
        }));

        let egress = policy("api-egress");
        assert_eq!(egress.direction, PolicyDirection::Egress);
        assert_eq!(egress.rules[0].ports.len(), 2);
        assert!(egress.rules.iter().any(|r| r.peers
            == vec![PolicyPeer::Namespace {
                name: "data".into()
            }]));
        assert!(egress.rules.iter().any(|r| r.peers.is_empty() && r.ports[0].port == 443));

        let off = ComposeOptions {
            network_policies: false,
            ..ComposeOptions::default()
        };
        let set = compose(&test_spec(), &TrafficPlan::Single(test_release("r1", 1)), &off).unwrap();
        assert!(set.get(ResourceKind::NetworkPolicy, "api-ingress").is_none());
    }

    #[test]
    fn disabled_probes() {
        let mut spec = test_spec();
        spec.health = Some(HealthCheck {
            disabled: true,
            ..Default::default()
        });
        let set = compose_single(&spec);
        let w = workload_of(&set, "api");
        assert!(w.container.liveness.is_none());
        assert!(w.container.readiness.is_none());
    }

    #[test]
    fn invalid_spec_never_composes() {
        let mut spec = test_spec();
        spec.replicas.min = 9;
        spec.replicas.max = 1;
        let mut release = test_release("r1", 1);
        release.image.clear();

        let err = compose(&spec, &TrafficPlan::Single(release), &ComposeOptions::default())
            .unwrap_err();
        assert_eq!(err.problems().len(), 2);
    }

    #[test]
    fn default_port_when_none_declared() {
        let mut spec = test_spec();
        spec.ports.clear();
        let set = compose_single(&spec);
        let w = workload_of(&set, "api");
        assert_eq!(w.container.ports[0].container_port, DEFAULT_PORT);
        let port_env = w.container.env.iter().find(|e| e.name == "PORT").unwrap();
        assert_eq!(port_env.value.as_deref(), Some("4200"));
    }
}

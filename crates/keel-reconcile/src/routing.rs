//! Route/domain composer.
//!
//! Merges every route and custom domain of a service into one routing
//! resource: one rule per host, one path entry per distinct path, TLS only
//! for hosts whose certificate is issued. Hosts that cannot be served yet
//! (unverified, or TLS required but missing) are reported as pending and
//! left out, so the rest of the service still converges.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use keel_cluster::{
    Backend, ObjectMeta, Resource, ResourceSpec, RoutingPath, RoutingRule, RoutingSpec, TlsEntry,
};
use keel_rollout::Track;
use keel_state::{CustomDomain, PathType, PendingHost, ServiceSpec, TlsState, VerificationState};

use crate::labels;
use crate::manifest::{ComposeOptions, primary_port};

pub const ANNOTATION_INGRESS_CLASS: &str = "kubernetes.io/ingress.class";
pub const ANNOTATION_CLUSTER_ISSUER: &str = "cert-manager.io/cluster-issuer";
pub const ANNOTATION_SSL_REDIRECT: &str = "nginx.ingress.kubernetes.io/ssl-redirect";

/// How traffic for each path is spread across the service's tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendPlan {
    Single,
    Split { canary_weight: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComposedRouting {
    /// `None` when no host is routable.
    pub resource: Option<Resource>,
    pub pending_hosts: Vec<PendingHost>,
}

/// Secret holding the certificate for `host`.
pub fn tls_secret_name(service: &str, host: &str) -> String {
    let host = host.replace("*.", "wildcard.").replace('.', "-");
    format!("{service}-{host}-tls")
}

/// Exact paths first, then prefixes longest-first, then
/// implementation-specific; ties broken lexicographically.
pub fn path_order(a: (&str, PathType), b: (&str, PathType)) -> Ordering {
    fn rank(t: PathType) -> u8 {
        match t {
            PathType::Exact => 0,
            PathType::Prefix => 1,
            PathType::ImplementationSpecific => 2,
        }
    }
    rank(a.1)
        .cmp(&rank(b.1))
        .then_with(|| match a.1 {
            PathType::Prefix => b.0.len().cmp(&a.0.len()),
            _ => Ordering::Equal,
        })
        .then_with(|| a.0.cmp(b.0))
}

/// Why a custom domain cannot be routed yet.
fn pending_reason(domain: &CustomDomain) -> Option<&'static str> {
    if domain.verification != VerificationState::Verified {
        return Some("domain ownership not verified");
    }
    if domain.require_tls && domain.tls != TlsState::Issued {
        return Some("waiting for TLS certificate");
    }
    None
}

fn backends(service: &str, port: u16, plan: BackendPlan) -> Vec<Backend> {
    match plan {
        BackendPlan::Single => vec![Backend {
            service: labels::track_name(service, Track::Stable),
            port,
            weight: 100,
        }],
        BackendPlan::Split { canary_weight } => vec![
            Backend {
                service: labels::track_name(service, Track::Stable),
                port,
                weight: 100 - canary_weight.min(100),
            },
            Backend {
                service: labels::track_name(service, Track::Canary),
                port,
                weight: canary_weight.min(100),
            },
        ],
    }
}

/// Build the service's routing resource.
///
/// Returns every conflicting route (same host, path and type pointing at
/// different ports) as an error instead. Domains that resolve to different
/// certificate issuers also conflict: the routing resource names one.
pub fn compose_routing(
    spec: &ServiceSpec,
    plan: BackendPlan,
    opts: &ComposeOptions,
) -> Result<ComposedRouting, Vec<String>> {
    // host -> (path, type) -> port
    let mut hosts: BTreeMap<String, BTreeMap<(String, PathType), u32>> = BTreeMap::new();
    let mut problems = Vec::new();

    let domains: BTreeMap<String, &CustomDomain> = spec
        .domains
        .iter()
        .map(|d| (d.domain.to_ascii_lowercase(), d))
        .collect();
    for host in domains.keys() {
        hosts.entry(host.clone()).or_default();
    }

    let issuers: BTreeSet<&str> = domains
        .values()
        .map(|d| d.issuer.as_deref().unwrap_or(&opts.default_issuer))
        .collect();
    if issuers.len() > 1 {
        let names: Vec<&str> = issuers.into_iter().collect();
        problems.push(format!(
            "domains use mixed TLS issuers ({}); one routing resource carries a single issuer",
            names.join(", ")
        ));
    }

    for route in &spec.routes {
        let targets: Vec<String> = match &route.host {
            Some(host) => vec![host.to_ascii_lowercase()],
            None => domains.keys().cloned().collect(),
        };
        for host in targets {
            let paths = hosts.entry(host.clone()).or_default();
            let key = (route.path.clone(), route.path_type);
            match paths.get(&key) {
                Some(&port) if port != route.target_port => problems.push(format!(
                    "route {} ({:?}) on {host} targets both port {port} and port {}",
                    route.path, route.path_type, route.target_port
                )),
                Some(_) => {}
                None => {
                    paths.insert(key, route.target_port);
                }
            }
        }
    }
    if !problems.is_empty() {
        return Err(problems);
    }

    let default_port = primary_port(spec);
    let mut rules = Vec::new();
    let mut tls = Vec::new();
    let mut pending_hosts = Vec::new();
    let mut issuer: Option<String> = None;

    for (host, paths) in hosts {
        let domain = domains.get(&host);
        if let Some(reason) = domain.and_then(|d| pending_reason(d)) {
            debug!(service = %spec.id, %host, reason, "host held pending");
            pending_hosts.push(PendingHost {
                host,
                reason: reason.to_string(),
            });
            continue;
        }

        let mut entries: Vec<(String, PathType, u32)> = paths
            .into_iter()
            .map(|((path, path_type), port)| (path, path_type, port))
            .collect();
        if entries.is_empty() {
            entries.push(("/".to_string(), PathType::Prefix, u32::from(default_port)));
        }
        entries.sort_by(|a, b| path_order((&a.0, a.1), (&b.0, b.1)));

        let paths = entries
            .into_iter()
            .map(|(path, path_type, port)| RoutingPath {
                path,
                path_type,
                backends: backends(
                    &spec.name,
                    u16::try_from(port).unwrap_or(default_port),
                    plan,
                ),
            })
            .collect();

        if let Some(domain) = domain.filter(|d| d.tls == TlsState::Issued) {
            tls.push(TlsEntry {
                hosts: vec![host.clone()],
                secret_name: tls_secret_name(&spec.name, &host),
            });
            if issuer.is_none() {
                issuer = Some(
                    domain
                        .issuer
                        .clone()
                        .unwrap_or_else(|| opts.default_issuer.clone()),
                );
            }
        }

        rules.push(RoutingRule { host, paths });
    }

    if rules.is_empty() {
        return Ok(ComposedRouting {
            resource: None,
            pending_hosts,
        });
    }

    let mut meta = ObjectMeta::new(&spec.name, &spec.namespace);
    meta.labels = labels::managed(&spec.project, &spec.name);
    meta.annotations
        .insert(ANNOTATION_INGRESS_CLASS.to_string(), opts.ingress_class.clone());
    if let Some(issuer) = issuer {
        meta.annotations
            .insert(ANNOTATION_CLUSTER_ISSUER.to_string(), issuer);
        meta.annotations
            .insert(ANNOTATION_SSL_REDIRECT.to_string(), "true".to_string());
    }

    let resource = Resource::new(
        meta,
        ResourceSpec::Routing(RoutingSpec {
            ingress_class: opts.ingress_class.clone(),
            rules,
            tls,
        }),
    );
    Ok(ComposedRouting {
        resource: Some(resource),
        pending_hosts,
    })
}

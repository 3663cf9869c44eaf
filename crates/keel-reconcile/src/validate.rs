//! Spec validation. Every problem is collected so the user sees them all at once.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

use keel_state::{EnvSource, Release, ServiceSpec};

static DNS_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("static regex"));

static HOSTNAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\*\.)?([a-z0-9]([-a-z0-9]*[a-z0-9])?\.)+[a-z]{2,63}$").expect("static regex")
});

static QUANTITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9]+(\.[0-9]+)?(m|k|M|G|T|P|Ki|Mi|Gi|Ti|Pi)?$").expect("static regex")
});

static ENV_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static regex"));

/// Environment variables the platform injects itself.
pub const RESERVED_ENV: [&str; 5] = [
    "PORT",
    "KEEL_PROJECT",
    "KEEL_RELEASE_ID",
    "KEEL_RELEASE_VERSION",
    "KEEL_SERVICE_NAME",
];

/// Longest service name that still leaves room for the `-canary` suffix.
const MAX_SERVICE_NAME: usize = 56;

pub fn is_dns_label(s: &str) -> bool {
    s.len() <= 63 && DNS_LABEL.is_match(s)
}

pub fn is_hostname(s: &str) -> bool {
    s.len() <= 253 && HOSTNAME.is_match(s)
}

pub fn is_quantity(s: &str) -> bool {
    QUANTITY.is_match(s)
}

/// Validate a spec on its own.
pub fn validate_spec(spec: &ServiceSpec) -> Vec<String> {
    let mut problems = Vec::new();

    if !is_dns_label(&spec.name) || spec.name.len() > MAX_SERVICE_NAME {
        problems.push(format!(
            "name '{}' must be a lowercase DNS label of at most {MAX_SERVICE_NAME} characters",
            spec.name
        ));
    }
    if !is_dns_label(&spec.namespace) {
        problems.push(format!("namespace '{}' is not a DNS label", spec.namespace));
    }
    if !is_dns_label(&spec.project) {
        problems.push(format!("project '{}' is not a DNS label", spec.project));
    }
    if spec.id.is_empty() || spec.id.contains(':') {
        problems.push(format!("service id '{}' must be non-empty and contain no ':'", spec.id));
    }

    // ── Ports ──────────────────────────────────────────────────────
    let mut port_numbers = BTreeSet::new();
    let mut port_names = BTreeSet::new();
    for port in &spec.ports {
        if port.port == 0 || port.port > 65535 {
            problems.push(format!("port {} is outside 1-65535", port.port));
        }
        if !port_numbers.insert(port.port) {
            problems.push(format!("port {} declared more than once", port.port));
        }
        if !is_dns_label(&port.name) || port.name.len() > 15 {
            problems.push(format!("port name '{}' is not a valid port name", port.name));
        }
        if !port_names.insert(port.name.as_str()) {
            problems.push(format!("port name '{}' declared more than once", port.name));
        }
    }

    // ── Replicas & resources ───────────────────────────────────────
    if spec.replicas.max < 1 {
        problems.push("replicas.max must be at least 1".to_string());
    }
    if spec.replicas.min > spec.replicas.max {
        problems.push(format!(
            "replicas.min ({}) exceeds replicas.max ({})",
            spec.replicas.min, spec.replicas.max
        ));
    }
    for (field, value) in [
        ("resources.cpu_request", &spec.resources.cpu_request),
        ("resources.cpu_limit", &spec.resources.cpu_limit),
        ("resources.memory_request", &spec.resources.memory_request),
        ("resources.memory_limit", &spec.resources.memory_limit),
    ] {
        if let Some(v) = value {
            if !is_quantity(v) {
                problems.push(format!("{field} '{v}' is not a quantity"));
            }
        }
    }
    if spec.autoscaling.as_ref().is_some_and(|a| a.target == 0) {
        problems.push("autoscaling.target must be greater than 0".to_string());
    }

    // ── Env ────────────────────────────────────────────────────────
    for (name, source) in &spec.env {
        if !ENV_NAME.is_match(name) {
            problems.push(format!("env name '{name}' is not a valid identifier"));
        }
        if RESERVED_ENV.contains(&name.as_str()) {
            problems.push(format!("env name '{name}' is set by the platform"));
        }
        if let EnvSource::Secret { name: secret, key } = source {
            if !is_dns_label(secret) || key.is_empty() {
                problems.push(format!(
                    "env '{name}' references an invalid secret '{secret}/{key}'"
                ));
            }
        }
    }

    // ── Volumes ────────────────────────────────────────────────────
    let mut volume_names = BTreeSet::new();
    let mut mount_paths = BTreeSet::new();
    for volume in &spec.volumes {
        if !is_dns_label(&volume.name) {
            problems.push(format!("volume name '{}' is not a DNS label", volume.name));
        }
        if !volume_names.insert(volume.name.as_str()) {
            problems.push(format!("volume '{}' declared more than once", volume.name));
        }
        if !volume.mount_path.starts_with('/') {
            problems.push(format!(
                "volume '{}' mount path '{}' must be absolute",
                volume.name, volume.mount_path
            ));
        }
        if !mount_paths.insert(volume.mount_path.as_str()) {
            problems.push(format!("mount path '{}' used more than once", volume.mount_path));
        }
        if !is_quantity(&volume.size) {
            problems.push(format!("volume '{}' size '{}' is not a quantity", volume.name, volume.size));
        }
    }

    // ── Routes & domains ───────────────────────────────────────────
    let declared_ports: BTreeSet<u32> = effective_ports(spec).into_iter().collect();
    for route in &spec.routes {
        if !route.path.starts_with('/') {
            problems.push(format!("route path '{}' must start with '/'", route.path));
        }
        if !declared_ports.contains(&route.target_port) {
            problems.push(format!(
                "route '{}' targets undeclared port {}",
                route.path, route.target_port
            ));
        }
        if let Some(host) = &route.host {
            if !is_hostname(&host.to_ascii_lowercase()) {
                problems.push(format!("route host '{host}' is not a valid hostname"));
            }
        }
    }
    let mut domains = BTreeSet::new();
    for domain in &spec.domains {
        let lower = domain.domain.to_ascii_lowercase();
        if !is_hostname(&lower) {
            problems.push(format!("domain '{}' is not a valid hostname", domain.domain));
        }
        if !domains.insert(lower) {
            problems.push(format!("domain '{}' declared more than once", domain.domain));
        }
    }
    let issuers: BTreeSet<&str> = spec
        .domains
        .iter()
        .filter_map(|d| d.issuer.as_deref())
        .collect();
    if issuers.len() > 1 {
        let names: Vec<&str> = issuers.into_iter().collect();
        problems.push(format!("domains name more than one TLS issuer: {}", names.join(", ")));
    }

    if let Some(health) = &spec.health {
        for path in [&health.liveness_path, &health.readiness_path]
            .into_iter()
            .flatten()
        {
            if !path.starts_with('/') {
                problems.push(format!("health probe path '{path}' must start with '/'"));
            }
        }
        if let Some(port) = health.port {
            if !declared_ports.contains(&port) {
                problems.push(format!("health probe targets undeclared port {port}"));
            }
        }
    }

    if let Some(secret) = &spec.image_pull_secret {
        if !is_dns_label(secret) {
            problems.push(format!("image pull secret '{secret}' is not a DNS label"));
        }
    }

    problems
}

/// Validate a release against the spec it is deployed for.
pub fn validate_release(spec: &ServiceSpec, release: &Release) -> Vec<String> {
    let mut problems = Vec::new();
    if release.service_id != spec.id {
        problems.push(format!(
            "release {} belongs to service {}, not {}",
            release.id, release.service_id, spec.id
        ));
    }
    if release.image.trim().is_empty() {
        problems.push(format!("release {} has no image", release.id));
    }
    if !release.is_ready() {
        problems.push(format!(
            "release {} is {:?}, not ready",
            release.id, release.status
        ));
    }
    problems
}

/// Declared port numbers, or the platform default when none are declared.
pub fn effective_ports(spec: &ServiceSpec) -> Vec<u32> {
    if spec.ports.is_empty() {
        vec![crate::manifest::DEFAULT_PORT as u32]
    } else {
        spec.ports.iter().map(|p| p.port).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{test_release, test_spec, verified_domain};
    use keel_state::{
        AccessMode, CustomDomain, PathType, ReleaseStatus, Route, ServicePort, Volume,
    };

    #[test]
    fn valid_spec_has_no_problems() {
        assert!(validate_spec(&test_spec()).is_empty());
    }

    #[test]
    fn collects_every_problem() {
        let mut spec = test_spec();
        spec.name = "Bad_Name".to_string();
        spec.replicas.min = 5;
        spec.replicas.max = 2;
        spec.ports.push(ServicePort {
            name: "http".to_string(),
            port: 70000,
            protocol: Default::default(),
        });
        spec.routes.push(Route {
            host: None,
            path: "api".to_string(),
            path_type: PathType::Prefix,
            target_port: 9999,
        });
        spec.volumes.push(Volume {
            name: "data".to_string(),
            mount_path: "relative".to_string(),
            size: "lots".to_string(),
            storage_class: None,
            access_mode: AccessMode::ReadWriteOnce,
        });
        spec.env.insert("PORT".to_string(), EnvSource::Value("1".to_string()));

        let problems = validate_spec(&spec);
        let joined = problems.join("\n");
        assert!(joined.contains("name 'Bad_Name'"));
        assert!(joined.contains("replicas.min"));
        assert!(joined.contains("outside 1-65535"));
        assert!(joined.contains("port name 'http' declared more than once"));
        assert!(joined.contains("must start with '/'"));
        assert!(joined.contains("undeclared port 9999"));
        assert!(joined.contains("must be absolute"));
        assert!(joined.contains("size 'lots'"));
        assert!(joined.contains("set by the platform"));
        assert!(problems.len() >= 9);
    }

    #[test]
    fn one_explicit_issuer_per_service() {
        let mut spec = test_spec();
        let domain = |host: &str, issuer: Option<&str>| CustomDomain {
            issuer: issuer.map(str::to_string),
            ..verified_domain(host)
        };
        spec.domains = vec![
            domain("a.example.com", Some("internal-ca")),
            domain("b.example.com", Some("internal-ca")),
            domain("c.example.com", None),
        ];
        assert!(validate_spec(&spec).is_empty());

        spec.domains.push(domain("d.example.com", Some("letsencrypt-prod")));
        let problems = validate_spec(&spec);
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("internal-ca, letsencrypt-prod"));
    }

    #[test]
    fn quantities() {
        for ok in ["100m", "0.5", "1Gi", "512Mi", "2"] {
            assert!(is_quantity(ok), "{ok}");
        }
        for bad in ["", "1 Gi", "-1", "1GB", "lots"] {
            assert!(!is_quantity(bad), "{bad}");
        }
    }

    #[test]
    fn hostnames() {
        assert!(is_hostname("app.example.com"));
        assert!(is_hostname("*.example.com"));
        assert!(!is_hostname("localhost"));
        assert!(!is_hostname("bad_host.example.com"));
    }

    #[test]
    fn release_must_be_ready_and_match() {
        let spec = test_spec();
        let mut release = test_release("r1", 1);
        assert!(validate_release(&spec, &release).is_empty());
        release.status = ReleaseStatus::Building;
        release.service_id = "other/svc".to_string();
        assert_eq!(validate_release(&spec, &release).len(), 2);
    }
}

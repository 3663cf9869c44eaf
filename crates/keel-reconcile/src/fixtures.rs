//! Shared builders for unit tests.

use std::collections::BTreeMap;

use keel_state::{
    CustomDomain, Protocol, Release, ReleaseStatus, ReplicaBounds, ResourceRequests, ServicePort,
    ServiceSpec, TlsState, VerificationState,
};

pub fn test_spec() -> ServiceSpec {
    ServiceSpec {
        id: "shop/api".to_string(),
        name: "api".to_string(),
        namespace: "shop".to_string(),
        project: "shop".to_string(),
        version: 1,
        ports: vec![ServicePort {
            name: "http".to_string(),
            port: 8080,
            protocol: Protocol::Tcp,
        }],
        resources: ResourceRequests::default(),
        replicas: ReplicaBounds { min: 2, max: 4 },
        env: BTreeMap::new(),
        routes: Vec::new(),
        domains: Vec::new(),
        volumes: Vec::new(),
        autoscaling: None,
        health: None,
        image_pull_secret: None,
        created_at: 1000,
        updated_at: 1000,
    }
}

pub fn test_release(id: &str, version: u64) -> Release {
    Release {
        id: id.to_string(),
        service_id: "shop/api".to_string(),
        version,
        image: format!("registry.local/api:{id}"),
        source_revision: Some(format!("rev-{version}")),
        provenance: None,
        status: ReleaseStatus::Ready,
        created_at: 1000 + version,
    }
}

pub fn verified_domain(host: &str) -> CustomDomain {
    CustomDomain {
        domain: host.to_string(),
        verification: VerificationState::Verified,
        tls: TlsState::None,
        issuer: None,
        require_tls: false,
    }
}

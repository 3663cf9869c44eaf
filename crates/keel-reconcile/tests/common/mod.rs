//! Shared harness for the engine integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use keel_cluster::{MemoryCluster, Resource, ResourceKind};
use keel_reconcile::dispatcher::Backoff;
use keel_reconcile::{Clock, Engine, EngineSettings, ManualClock, MemoryDomains, StoreSignals};
use keel_state::*;

pub const NOW: u64 = 1_000;

pub struct Harness {
    pub engine: Engine,
    pub cluster: Arc<MemoryCluster>,
    pub domains: Arc<MemoryDomains>,
    pub clock: Arc<ManualClock>,
    pub store: StateStore,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_cluster(MemoryCluster::new())
    }

    pub fn with_cluster(cluster: MemoryCluster) -> Self {
        let store = StateStore::open_in_memory().unwrap();
        let cluster = Arc::new(cluster);
        let domains = Arc::new(MemoryDomains::new());
        let clock = Arc::new(ManualClock::new(NOW));
        let engine = Engine::new(
            store.clone(),
            cluster.clone(),
            Arc::new(StoreSignals::new(store.clone())),
            domains.clone(),
            clock.clone(),
            settings(),
        );
        Self {
            engine,
            cluster,
            domains,
            clock,
            store,
        }
    }

    pub fn add_service(&self, spec: &ServiceSpec) {
        self.store.put_service(spec).unwrap();
    }

    pub fn add_release(&self, release: &Release) {
        self.store.put_release(release).unwrap();
    }

    /// Record an SLO snapshot for a release at the current clock time.
    pub fn signal(&self, service_id: &str, release_id: &str, error_rate: f64, p99_latency_ms: u64) {
        self.signal_with(service_id, release_id, error_rate, p99_latency_ms, 500);
    }

    pub fn signal_with(
        &self,
        service_id: &str,
        release_id: &str,
        error_rate: f64,
        p99_latency_ms: u64,
        request_count: u64,
    ) {
        self.store
            .put_signal(&SignalSnapshot {
                service_id: service_id.to_string(),
                release_id: release_id.to_string(),
                error_rate,
                p99_latency_ms,
                request_count,
                epoch: self.clock.now(),
            })
            .unwrap();
    }

    pub async fn object(&self, kind: ResourceKind, name: &str) -> Option<Resource> {
        self.cluster.object(kind, "shop", name).await
    }

    pub async fn workload_image(&self, name: &str) -> Option<String> {
        self.object(ResourceKind::Workload, name)
            .await
            .and_then(|w| w.as_workload().map(|w| w.container.image.clone()))
    }
}

pub fn settings() -> EngineSettings {
    EngineSettings {
        workers: 2,
        backoff: Backoff {
            base: Duration::from_millis(5),
            max: Duration::from_millis(50),
            jitter: Duration::ZERO,
        },
        max_attempts: 3,
        readiness_recheck: Duration::from_millis(20),
        domain_recheck: Duration::from_secs(60),
        shutdown_timeout: Duration::from_secs(2),
        ..EngineSettings::default()
    }
}

pub fn spec(name: &str) -> ServiceSpec {
    ServiceSpec {
        id: format!("shop/{name}"),
        name: name.to_string(),
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
        created_at: NOW,
        updated_at: NOW,
    }
}

pub fn release(service: &str, id: &str, version: u64) -> Release {
    Release {
        id: id.to_string(),
        service_id: format!("shop/{service}"),
        version,
        image: format!("registry.local/{service}:{id}"),
        source_revision: Some(format!("rev-{version}")),
        provenance: None,
        status: ReleaseStatus::Ready,
        created_at: NOW + version,
    }
}

pub fn domain(host: &str, verification: VerificationState) -> CustomDomain {
    CustomDomain {
        domain: host.to_string(),
        verification,
        tls: TlsState::None,
        issuer: None,
        require_tls: false,
    }
}

pub fn route(host: Option<&str>, path: &str, port: u32) -> Route {
    Route {
        host: host.map(str::to_string),
        path: path.to_string(),
        path_type: PathType::Prefix,
        target_port: port,
    }
}

pub fn volume(name: &str, access_mode: AccessMode) -> Volume {
    Volume {
        name: name.to_string(),
        mount_path: format!("/var/lib/{name}"),
        size: "1Gi".to_string(),
        storage_class: None,
        access_mode,
    }
}

/// Poll until `check` holds, failing after two seconds.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

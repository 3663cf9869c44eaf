//! MemoryCluster — in-process orchestration backend.
//!
//! Behaves like the real platform where the engine can observe it:
//! resource versions bump on every write, updates with a stale version
//! are rejected, claims are bound to a volume handle on create, and
//! workloads report ready replicas. Namespaces are recorded when ensured
//! but not enforced. Tests drive everything else through
//! the simulation helpers (pod replacement, external edits, injected
//! faults) and count the engine's mutations.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::client::{ClusterError, ClusterResult, ResourceClient};
use crate::resource::{LabelSelector, Resource, ResourceKey, ResourceKind, ResourceSpec};

/// Operation a fault is injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOp {
    Create,
    Get,
    Update,
    Delete,
    List,
    EnsureNamespace,
}

#[derive(Debug)]
struct Fault {
    op: FaultOp,
    kind: Option<ResourceKind>,
    name: Option<String>,
    error: ClusterError,
    remaining: u32,
}

impl Fault {
    fn matches(&self, op: FaultOp, kind: Option<ResourceKind>, name: Option<&str>) -> bool {
        self.op == op
            && self.kind.is_none_or(|k| Some(k) == kind)
            && match (&self.name, name) {
                (None, _) => true,
                (Some(want), Some(have)) => want == have,
                (Some(_), None) => false,
            }
    }
}

#[derive(Debug, Default)]
struct Inner {
    objects: BTreeMap<ResourceKey, Resource>,
    namespaces: BTreeSet<String>,
    next_version: u64,
    next_uid: u64,
    mutations: u64,
    faults: Vec<Fault>,
}

impl Inner {
    fn bump(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }

    fn take_fault(
        &mut self,
        op: FaultOp,
        kind: Option<ResourceKind>,
        name: Option<&str>,
    ) -> Option<ClusterError> {
        let idx = self
            .faults
            .iter()
            .position(|f| f.matches(op, kind, name))?;
        let fault = &mut self.faults[idx];
        let error = fault.error.clone();
        fault.remaining = fault.remaining.saturating_sub(1);
        if fault.remaining == 0 {
            self.faults.remove(idx);
        }
        Some(error)
    }
}

/// Thread-safe in-memory platform.
#[derive(Debug)]
pub struct MemoryCluster {
    inner: RwLock<Inner>,
    /// Workloads report every replica ready as soon as they are written.
    auto_ready: bool,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            auto_ready: true,
        }
    }

    /// Workloads start with zero ready replicas until
    /// [`set_ready_replicas`](Self::set_ready_replicas) is called.
    pub fn manual_readiness() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            auto_ready: false,
        }
    }

    // ── Simulation helpers ─────────────────────────────────────────

    /// Fail the next `times` matching calls with `error`.
    pub async fn inject_fault(
        &self,
        op: FaultOp,
        kind: Option<ResourceKind>,
        name: Option<&str>,
        error: ClusterError,
        times: u32,
    ) {
        self.inner.write().await.faults.push(Fault {
            op,
            kind,
            name: name.map(str::to_string),
            error,
            remaining: times.max(1),
        });
    }

    pub async fn clear_faults(&self) {
        self.inner.write().await.faults.clear();
    }

    /// Number of successful create/update/delete calls made through the client.
    pub async fn mutation_count(&self) -> u64 {
        self.inner.read().await.mutations
    }

    /// Every object of a kind in a namespace, bypassing faults.
    pub async fn objects(&self, kind: ResourceKind, namespace: &str) -> Vec<Resource> {
        self.inner
            .read()
            .await
            .objects
            .values()
            .filter(|r| r.kind() == kind && r.meta.namespace == namespace)
            .cloned()
            .collect()
    }

    pub async fn object(&self, kind: ResourceKind, namespace: &str, name: &str) -> Option<Resource> {
        self.inner
            .read()
            .await
            .objects
            .get(&key(kind, namespace, name))
            .cloned()
    }

    /// Namespaces created through [`ResourceClient::ensure_namespace`].
    pub async fn namespaces(&self) -> Vec<String> {
        self.inner.read().await.namespaces.iter().cloned().collect()
    }

    /// Report a workload's pods as stuck (`Some`) or recovered (`None`).
    pub async fn set_workload_failure(
        &self,
        namespace: &str,
        name: &str,
        failure: Option<&str>,
    ) -> bool {
        self.mutate_externally(ResourceKind::Workload, namespace, name, |r| {
            r.status.failure = failure.map(str::to_string);
            if r.status.failure.is_some() {
                r.status.ready_replicas = 0;
            }
        })
        .await
    }

    pub async fn set_ready_replicas(&self, namespace: &str, name: &str, ready: u32) -> bool {
        self.mutate_externally(ResourceKind::Workload, namespace, name, |r| {
            r.status.ready_replicas = ready;
        })
        .await
    }

    /// Replace every pod of a workload. Claims are left alone.
    pub async fn replace_pods(&self, namespace: &str, name: &str) -> bool {
        let auto_ready = self.auto_ready;
        self.mutate_externally(ResourceKind::Workload, namespace, name, |r| {
            let desired = r.as_workload().map(|w| w.replicas).unwrap_or_default();
            r.status.ready_replicas = if auto_ready { desired } else { 0 };
        })
        .await
    }

    /// Edit an object as another writer would. Bumps its version but does
    /// not count as an engine mutation.
    pub async fn mutate_externally(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        edit: impl FnOnce(&mut Resource),
    ) -> bool {
        let mut inner = self.inner.write().await;
        let version = inner.bump();
        match inner.objects.get_mut(&key(kind, namespace, name)) {
            Some(obj) => {
                edit(obj);
                obj.meta.resource_version = version;
                true
            }
            None => false,
        }
    }

    /// Create an object as another writer would.
    pub async fn insert_externally(&self, mut resource: Resource) {
        let mut inner = self.inner.write().await;
        stamp_new(&mut inner, &mut resource, self.auto_ready);
        inner.objects.insert(resource.key(), resource);
    }
}

fn key(kind: ResourceKind, namespace: &str, name: &str) -> ResourceKey {
    ResourceKey {
        kind,
        namespace: namespace.to_string(),
        name: name.to_string(),
    }
}

/// Assign platform-owned fields to a newly created object.
fn stamp_new(inner: &mut Inner, resource: &mut Resource, auto_ready: bool) {
    inner.next_uid += 1;
    let uid = format!("uid-{:06}", inner.next_uid);
    resource.meta.resource_version = inner.bump();
    resource.status = Default::default();
    match &resource.spec {
        ResourceSpec::VolumeClaim(_) => {
            resource.status.volume_handle = Some(format!("pv-{uid}"));
            resource.status.bound = true;
        }
        ResourceSpec::Workload(w) if auto_ready => {
            resource.status.ready_replicas = w.replicas;
        }
        _ => {}
    }
    resource.meta.uid = Some(uid);
}

#[async_trait]
impl ResourceClient for MemoryCluster {
    async fn create(&self, mut resource: Resource) -> ClusterResult<Resource> {
        let mut inner = self.inner.write().await;
        let kind = resource.kind();
        let name = resource.meta.name.clone();
        if let Some(err) = inner.take_fault(FaultOp::Create, Some(kind), Some(&name)) {
            return Err(err);
        }
        let k = resource.key();
        if inner.objects.contains_key(&k) {
            return Err(ClusterError::AlreadyExists {
                kind,
                namespace: k.namespace,
                name: k.name,
            });
        }
        stamp_new(&mut inner, &mut resource, self.auto_ready);
        inner.mutations += 1;
        debug!(key = %k, version = resource.meta.resource_version, "created");
        inner.objects.insert(k, resource.clone());
        Ok(resource)
    }

    async fn get(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> ClusterResult<Option<Resource>> {
        let mut inner = self.inner.write().await;
        if let Some(err) = inner.take_fault(FaultOp::Get, Some(kind), Some(name)) {
            return Err(err);
        }
        Ok(inner.objects.get(&key(kind, namespace, name)).cloned())
    }

    async fn update(&self, mut resource: Resource) -> ClusterResult<Resource> {
        let mut inner = self.inner.write().await;
        let kind = resource.kind();
        let name = resource.meta.name.clone();
        if let Some(err) = inner.take_fault(FaultOp::Update, Some(kind), Some(&name)) {
            return Err(err);
        }
        let k = resource.key();
        let Some(current) = inner.objects.get(&k).cloned() else {
            return Err(ClusterError::NotFound {
                kind,
                namespace: k.namespace,
                name: k.name,
            });
        };
        if current.meta.resource_version != resource.meta.resource_version {
            return Err(ClusterError::Conflict {
                kind,
                namespace: k.namespace,
                name: k.name,
                expected: resource.meta.resource_version,
                actual: current.meta.resource_version,
            });
        }

        resource.meta.uid = current.meta.uid.clone();
        resource.status = current.status.clone();
        if let (ResourceSpec::Workload(new), ResourceSpec::Workload(old)) =
            (&resource.spec, &current.spec)
        {
            let template_changed = new.container != old.container || new.volumes != old.volumes;
            if template_changed {
                resource.status.failure = None;
            }
            if self.auto_ready && resource.status.failure.is_none() {
                resource.status.ready_replicas = new.replicas;
            } else if template_changed {
                resource.status.ready_replicas = 0;
            }
        }
        resource.meta.resource_version = inner.bump();
        inner.mutations += 1;
        debug!(key = %k, version = resource.meta.resource_version, "updated");
        inner.objects.insert(k, resource.clone());
        Ok(resource)
    }

    async fn delete(&self, kind: ResourceKind, namespace: &str, name: &str) -> ClusterResult<()> {
        let mut inner = self.inner.write().await;
        if let Some(err) = inner.take_fault(FaultOp::Delete, Some(kind), Some(name)) {
            return Err(err);
        }
        let k = key(kind, namespace, name);
        if inner.objects.remove(&k).is_none() {
            return Err(ClusterError::NotFound {
                kind,
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        }
        inner.mutations += 1;
        debug!(key = %k, "deleted");
        Ok(())
    }

    async fn list(
        &self,
        kind: ResourceKind,
        namespace: &str,
        selector: &LabelSelector,
    ) -> ClusterResult<Vec<Resource>> {
        let mut inner = self.inner.write().await;
        if let Some(err) = inner.take_fault(FaultOp::List, Some(kind), None) {
            return Err(err);
        }
        Ok(inner
            .objects
            .values()
            .filter(|r| {
                r.kind() == kind && r.meta.namespace == namespace && r.meta.matches(selector)
            })
            .cloned()
            .collect())
    }

    async fn ensure_namespace(&self, namespace: &str) -> ClusterResult<bool> {
        let mut inner = self.inner.write().await;
        if let Some(err) = inner.take_fault(FaultOp::EnsureNamespace, None, Some(namespace)) {
            return Err(err);
        }
        let created = inner.namespaces.insert(namespace.to_string());
        if created {
            inner.mutations += 1;
            debug!(%namespace, "namespace created");
        }
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::*;
    use keel_state::{AccessMode, Protocol};

    fn claim(name: &str) -> Resource {
        let mut meta = ObjectMeta::new(name, "shop");
        meta.labels.insert("keel.dev/service".into(), "api".into());
        Resource::new(
            meta,
            ResourceSpec::VolumeClaim(ClaimSpec {
                storage_class: "standard".into(),
                access_modes: vec![AccessMode::ReadWriteOnce],
                size: "1Gi".into(),
            }),
        )
    }

    fn workload(name: &str, image: &str) -> Resource {
        Resource::new(
            ObjectMeta::new(name, "shop"),
            ResourceSpec::Workload(WorkloadSpec {
                replicas: 2,
                selector: LabelSelector::new(),
                template_labels: Default::default(),
                strategy: UpdateStrategy::Recreate,
                container: Container {
                    name: "app".into(),
                    image: image.into(),
                    ports: vec![ContainerPort {
                        name: "http".into(),
                        container_port: 8080,
                        protocol: Protocol::Tcp,
                    }],
                    env: Vec::new(),
                    resources: ContainerResources::default(),
                    liveness: None,
                    readiness: None,
                    volume_mounts: Vec::new(),
                },
                volumes: Vec::new(),
                image_pull_secrets: Vec::new(),
            }),
        )
    }

    #[tokio::test]
    async fn create_assigns_uid_version_and_binds_claims() {
        let cluster = MemoryCluster::new();
        let created = cluster.create(claim("api-data")).await.unwrap();
        assert!(created.meta.uid.is_some());
        assert!(created.meta.resource_version > 0);
        assert!(created.status.bound);
        assert!(created.status.volume_handle.is_some());
        assert_eq!(cluster.mutation_count().await, 1);

        let err = cluster.create(claim("api-data")).await.unwrap_err();
        assert!(matches!(err, ClusterError::AlreadyExists { .. }));
        assert_eq!(cluster.mutation_count().await, 1);
    }

    #[tokio::test]
    async fn stale_update_conflicts() {
        let cluster = MemoryCluster::new();
        let created = cluster.create(workload("api", "img:1")).await.unwrap();

        assert!(
            cluster
                .mutate_externally(ResourceKind::Workload, "shop", "api", |r| {
                    r.meta.annotations.insert("edited".into(), "yes".into());
                })
                .await
        );

        let err = cluster.update(created.clone()).await.unwrap_err();
        assert!(matches!(err, ClusterError::Conflict { .. }));
        assert!(err.is_transient());

        let latest = cluster
            .get(ResourceKind::Workload, "shop", "api")
            .await
            .unwrap()
            .unwrap();
        let updated = cluster.update(latest.clone()).await.unwrap();
        assert!(updated.meta.resource_version > latest.meta.resource_version);
        assert_eq!(updated.meta.uid, created.meta.uid);
    }

    #[tokio::test]
    async fn manual_readiness_resets_on_template_change() {
        let cluster = MemoryCluster::manual_readiness();
        let created = cluster.create(workload("api", "img:1")).await.unwrap();
        assert!(!created.is_ready());

        cluster.set_ready_replicas("shop", "api", 2).await;
        let current = cluster
            .object(ResourceKind::Workload, "shop", "api")
            .await
            .unwrap();
        assert!(current.is_ready());

        let mut next = current.clone();
        if let ResourceSpec::Workload(w) = &mut next.spec {
            w.container.image = "img:2".into();
        }
        let updated = cluster.update(next).await.unwrap();
        assert_eq!(updated.status.ready_replicas, 0);
    }

    #[tokio::test]
    async fn list_filters_by_kind_namespace_and_labels() {
        let cluster = MemoryCluster::new();
        cluster.create(claim("api-data")).await.unwrap();
        cluster.create(claim("api-cache")).await.unwrap();
        cluster.create(workload("api", "img:1")).await.unwrap();

        let mut selector = LabelSelector::new();
        selector.insert("keel.dev/service".into(), "api".into());
        let claims = cluster
            .list(ResourceKind::VolumeClaim, "shop", &selector)
            .await
            .unwrap();
        assert_eq!(claims.len(), 2);

        let other_ns = cluster
            .list(ResourceKind::VolumeClaim, "other", &selector)
            .await
            .unwrap();
        assert!(other_ns.is_empty());
    }

    #[tokio::test]
    async fn injected_faults_are_consumed() {
        let cluster = MemoryCluster::new();
        cluster
            .inject_fault(
                FaultOp::Create,
                Some(ResourceKind::VolumeClaim),
                Some("api-data"),
                ClusterError::Unavailable("boom".into()),
                1,
            )
            .await;

        assert!(cluster.create(claim("api-cache")).await.is_ok());
        let err = cluster.create(claim("api-data")).await.unwrap_err();
        assert_eq!(err, ClusterError::Unavailable("boom".into()));
        assert!(cluster.create(claim("api-data")).await.is_ok());
    }

    #[tokio::test]
    async fn delete_missing_is_not_found() {
        let cluster = MemoryCluster::new();
        let err = cluster
            .delete(ResourceKind::Routing, "shop", "api")
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::NotFound { .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn namespaces_are_created_once() {
        let cluster = MemoryCluster::new();
        assert!(cluster.ensure_namespace("shop").await.unwrap());
        assert!(!cluster.ensure_namespace("shop").await.unwrap());
        assert_eq!(cluster.namespaces().await, vec!["shop".to_string()]);
        assert_eq!(cluster.mutation_count().await, 1);

        cluster
            .inject_fault(
                FaultOp::EnsureNamespace,
                None,
                Some("blog"),
                ClusterError::Unavailable("apiserver down".into()),
                1,
            )
            .await;
        assert!(cluster.ensure_namespace("blog").await.is_err());
        assert!(cluster.ensure_namespace("blog").await.unwrap());
    }

    #[tokio::test]
    async fn new_template_clears_a_stuck_workload() {
        let cluster = MemoryCluster::new();
        cluster.create(workload("api", "img:bad")).await.unwrap();
        assert!(cluster.set_workload_failure("shop", "api", Some("ImagePullBackOff")).await);

        let stuck = cluster
            .object(ResourceKind::Workload, "shop", "api")
            .await
            .unwrap();
        assert_eq!(stuck.status.failure.as_deref(), Some("ImagePullBackOff"));
        assert!(!stuck.is_ready());

        // Re-applying the same template keeps the failure.
        let same = cluster.update(stuck.clone()).await.unwrap();
        assert!(same.status.failure.is_some());
        assert!(!same.is_ready());

        let mut fixed = same.clone();
        if let ResourceSpec::Workload(w) = &mut fixed.spec {
            w.container.image = "img:good".into();
        }
        let updated = cluster.update(fixed).await.unwrap();
        assert!(updated.status.failure.is_none());
        assert!(updated.is_ready());
    }
}

//! Diff & apply — plan the minimal operations that turn observed state into
//! desired state, then apply them one sub-resource at a time.
//!
//! Updates always carry the resource version they were diffed against. On
//! a conflict the latest object is re-read and re-diffed; if the diff is
//! now empty somebody else already converged it and the operation
//! succeeds without writing.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use keel_cluster::{ClusterError, Resource, ResourceClient, ResourceKey, ResourceKind, ResourceSpec};

use crate::error::ApplyError;
use crate::labels;

#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Create(Resource),
    /// `desired` already carries the platform-owned fields of `current`.
    Patch {
        current: Resource,
        desired: Resource,
        changes: Vec<String>,
    },
    Delete(Resource),
    NoOp(Resource),
}

impl Operation {
    pub fn key(&self) -> ResourceKey {
        match self {
            Self::Create(r) | Self::Delete(r) | Self::NoOp(r) => r.key(),
            Self::Patch { desired, .. } => desired.key(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Create(_) => "create",
            Self::Patch { .. } => "patch",
            Self::Delete(_) => "delete",
            Self::NoOp(_) => "noop",
        }
    }

    pub fn is_mutation(&self) -> bool {
        !matches!(self, Self::NoOp(_))
    }

    /// Fingerprint of the object this operation converges to.
    pub fn fingerprint(&self) -> Option<String> {
        match self {
            Self::Create(r) | Self::NoOp(r) => Some(r.fingerprint()),
            Self::Patch { desired, .. } => Some(desired.fingerprint()),
            Self::Delete(_) => None,
        }
    }
}

/// Copy the fields the platform owns from `current` onto `desired`.
pub fn carry_over(desired: &Resource, current: &Resource) -> Resource {
    let mut next = desired.clone();
    next.meta.uid = current.meta.uid.clone();
    next.meta.resource_version = current.meta.resource_version;
    next.status = current.status.clone();

    if let (ResourceSpec::Workload(want), ResourceSpec::Workload(have)) =
        (&mut next.spec, &current.spec)
    {
        want.selector = have.selector.clone();
        if desired.meta.annotations.contains_key(labels::REPLICAS_OWNER) {
            want.replicas = have.replicas;
        }
    }
    next
}

#[derive(Serialize)]
struct Owned<'a> {
    labels: &'a BTreeMap<String, String>,
    annotations: &'a BTreeMap<String, String>,
    spec: &'a ResourceSpec,
}

fn owned_value(resource: &Resource) -> Value {
    let owned = Owned {
        labels: &resource.meta.labels,
        annotations: &resource.meta.annotations,
        spec: &resource.spec,
    };
    serde_json::to_value(owned).unwrap_or(Value::Null)
}

/// Field paths (`spec.container.image`, `labels.app`, ...) whose values
/// differ between the two objects' engine-owned parts.
pub fn changed_paths(current: &Resource, desired: &Resource) -> Vec<String> {
    let mut paths = Vec::new();
    diff_values("", &owned_value(current), &owned_value(desired), &mut paths);
    paths
}

fn join(prefix: &str, field: &str) -> String {
    if prefix.is_empty() {
        field.to_string()
    } else {
        format!("{prefix}.{field}")
    }
}

fn diff_values(path: &str, a: &Value, b: &Value, out: &mut Vec<String>) {
    match (a, b) {
        (Value::Object(a), Value::Object(b)) => {
            let mut keys: Vec<&String> = a.keys().chain(b.keys()).collect();
            keys.sort();
            keys.dedup();
            for key in keys {
                let child = join(path, key);
                match (a.get(key), b.get(key)) {
                    (Some(x), Some(y)) => diff_values(&child, x, y, out),
                    _ => out.push(child),
                }
            }
        }
        (Value::Array(x), Value::Array(y)) if x.len() == y.len() => {
            for (i, (x, y)) in x.iter().zip(y).enumerate() {
                diff_values(&format!("{path}[{i}]"), x, y, out);
            }
        }
        _ if a != b => out.push(path.to_string()),
        _ => {}
    }
}

fn delete_rank(kind: ResourceKind) -> u8 {
    match kind {
        ResourceKind::Routing => 0,
        ResourceKind::Autoscaler => 1,
        ResourceKind::Exposure => 2,
        ResourceKind::Workload => 3,
        ResourceKind::NetworkPolicy => 4,
        ResourceKind::VolumeClaim => 5,
    }
}

/// Plan operations for `desired` against the managed objects currently on
/// the platform. Creates and patches keep the order of `desired`; deletes
/// come last so traffic moves off a resource before it disappears. Claims
/// are never deleted here.
pub fn plan(desired: &[Resource], observed: &[Resource]) -> Vec<Operation> {
    let mut observed: BTreeMap<ResourceKey, &Resource> =
        observed.iter().map(|r| (r.key(), r)).collect();
    let mut ops = Vec::with_capacity(desired.len());

    for want in desired {
        match observed.remove(&want.key()) {
            None => ops.push(Operation::Create(want.clone())),
            Some(current) => {
                let next = carry_over(want, current);
                let changes = changed_paths(current, &next);
                if changes.is_empty() {
                    ops.push(Operation::NoOp(current.clone()));
                } else {
                    ops.push(Operation::Patch {
                        current: current.clone(),
                        desired: next,
                        changes,
                    });
                }
            }
        }
    }

    let mut stale: Vec<&Resource> = observed
        .into_values()
        .filter(|r| r.kind() != ResourceKind::VolumeClaim)
        .collect();
    stale.sort_by_key(|r| (delete_rank(r.kind()), r.meta.name.clone()));
    ops.extend(stale.into_iter().map(|r| Operation::Delete(r.clone())));
    ops
}

/// Outcome of one operation.
#[derive(Debug, Clone)]
pub struct ApplyReport {
    pub key: ResourceKey,
    pub operation: &'static str,
    pub fingerprint: Option<String>,
    /// The platform's copy after the operation; `None` after a delete.
    pub result: Result<Option<Resource>, ApplyError>,
}

pub struct Applier {
    client: Arc<dyn ResourceClient>,
    conflict_retries: u32,
}

impl Applier {
    pub fn new(client: Arc<dyn ResourceClient>, conflict_retries: u32) -> Self {
        Self {
            client,
            conflict_retries,
        }
    }

    /// Apply every operation independently. A failure is recorded and the
    /// next operation still runs. Once `cancel` fires, the remaining
    /// operations are reported as cancelled without touching the platform.
    pub async fn apply_all(
        &self,
        ops: &[Operation],
        cancel: &watch::Receiver<bool>,
    ) -> Vec<ApplyReport> {
        let mut reports = Vec::with_capacity(ops.len());
        for op in ops {
            let key = op.key();
            let result = if *cancel.borrow() {
                Err(ApplyError::Cancelled(key.clone()))
            } else {
                self.apply(op).await
            };
            if let Err(error) = &result {
                warn!(resource = %key, op = op.name(), %error, "apply failed");
            }
            reports.push(ApplyReport {
                key,
                operation: op.name(),
                fingerprint: op.fingerprint(),
                result,
            });
        }
        reports
    }

    pub async fn apply(&self, op: &Operation) -> Result<Option<Resource>, ApplyError> {
        match op {
            Operation::NoOp(current) => Ok(Some(current.clone())),

            Operation::Create(desired) => match self.client.create(desired.clone()).await {
                Ok(created) => {
                    info!(resource = %created.key(), "created");
                    Ok(Some(created))
                }
                Err(ClusterError::AlreadyExists { .. }) => {
                    debug!(resource = %desired.key(), "already exists, patching instead");
                    self.converge_latest(desired).await.map(Some)
                }
                Err(e) => Err(e.into()),
            },

            Operation::Patch {
                desired, changes, ..
            } => {
                debug!(resource = %desired.key(), ?changes, "patching");
                self.update(desired).await.map(Some)
            }

            Operation::Delete(current) => {
                let key = current.key();
                match self.client.delete(key.kind, &key.namespace, &key.name).await {
                    Ok(()) => {
                        info!(resource = %key, "deleted");
                        Ok(None)
                    }
                    Err(ClusterError::NotFound { .. }) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    /// Update with the version carried by `desired`, re-reading on conflict.
    async fn update(&self, desired: &Resource) -> Result<Resource, ApplyError> {
        let key = desired.key();
        let mut next = desired.clone();
        let mut attempts = 0;
        loop {
            match self.client.update(next).await {
                Ok(updated) => {
                    info!(resource = %key, version = updated.meta.resource_version, "patched");
                    return Ok(updated);
                }
                Err(ClusterError::Conflict { .. }) if attempts < self.conflict_retries => {
                    attempts += 1;
                    debug!(resource = %key, attempt = attempts, "version conflict, re-reading");
                    let latest = self.read(&key).await?;
                    let prepared = carry_over(desired, &latest);
                    if changed_paths(&latest, &prepared).is_empty() {
                        return Ok(latest);
                    }
                    next = prepared;
                }
                Err(ClusterError::Conflict { .. }) => {
                    return Err(ApplyError::ConflictRetriesExhausted { key, attempts });
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Converge an object that exists but was not observed when planning.
    async fn converge_latest(&self, desired: &Resource) -> Result<Resource, ApplyError> {
        let latest = self.read(&desired.key()).await?;
        let next = carry_over(desired, &latest);
        if changed_paths(&latest, &next).is_empty() {
            return Ok(latest);
        }
        self.update(&next).await
    }

    async fn read(&self, key: &ResourceKey) -> Result<Resource, ApplyError> {
        self.client
            .get(key.kind, &key.namespace, &key.name)
            .await?
            .ok_or_else(|| {
                ApplyError::Cluster(ClusterError::NotFound {
                    kind: key.kind,
                    namespace: key.namespace.clone(),
                    name: key.name.clone(),
                })
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{test_release, test_spec, verified_domain};
    use crate::manifest::{ComposeOptions, TrafficPlan, compose};
    use keel_cluster::{FaultOp, MemoryCluster};

    fn desired() -> Vec<Resource> {
        let mut spec = test_spec();
        spec.domains.push(verified_domain("api.example.com"));
        compose(
            &spec,
            &TrafficPlan::Single(test_release("r1", 1)),
            &ComposeOptions {
                network_policies: false,
                ..ComposeOptions::default()
            },
        )
        .unwrap()
        .resources
    }

    fn no_cancel() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    async fn converge(cluster: &Arc<MemoryCluster>, desired: &[Resource]) -> Vec<ApplyReport> {
        let mut observed = Vec::new();
        for kind in [ResourceKind::Workload, ResourceKind::Exposure, ResourceKind::Routing] {
            observed.extend(cluster.objects(kind, "shop").await);
        }
        let ops = plan(desired, &observed);
        Applier::new(cluster.clone(), 3).apply_all(&ops, &no_cancel()).await
    }

    #[test]
    fn plan_creates_everything_when_nothing_exists() {
        let ops = plan(&desired(), &[]);
        assert_eq!(ops.len(), 3);
        assert!(ops.iter().all(|op| op.name() == "create"));
    }

    #[tokio::test]
    async fn second_plan_is_all_noops() {
        let cluster = Arc::new(MemoryCluster::new());
        converge(&cluster, &desired()).await;
        let before = cluster.mutation_count().await;

        let reports = converge(&cluster, &desired()).await;
        assert!(reports.iter().all(|r| r.operation == "noop"));
        assert_eq!(cluster.mutation_count().await, before);
    }

    #[test]
    fn patch_lists_changed_paths() {
        let current = desired();
        let mut want = desired();
        if let ResourceSpec::Workload(w) = &mut want[0].spec {
            w.container.image = "registry.local/api:r2".into();
        }
        let ops = plan(&want, &current);
        match &ops[0] {
            Operation::Patch { changes, .. } => {
                assert_eq!(changes, &vec!["spec.container.image".to_string()]);
            }
            other => panic!("expected patch, got {}", other.name()),
        }
        assert!(ops[1..].iter().all(|op| op.name() == "noop"));
    }

    #[test]
    fn selector_and_autoscaled_replicas_are_carried_over() {
        let mut current = desired()[0].clone();
        if let ResourceSpec::Workload(w) = &mut current.spec {
            w.selector.insert("legacy".into(), "yes".into());
            w.replicas = 7;
        }
        let mut want = desired()[0].clone();
        want.meta
            .annotations
            .insert(labels::REPLICAS_OWNER.into(), "autoscaler".into());
        current.meta.annotations = want.meta.annotations.clone();

        let next = carry_over(&want, &current);
        let w = next.as_workload().unwrap();
        assert_eq!(w.replicas, 7);
        assert!(w.selector.contains_key("legacy"));
        assert!(changed_paths(&current, &next).is_empty());
    }

    #[test]
    fn stale_resources_are_deleted_last_but_claims_are_kept() {
        let mut observed = desired();
        let mut stale = observed[0].clone();
        stale.meta.name = "api-canary".into();
        observed.push(stale);
        let claim = Resource::new(
            keel_cluster::ObjectMeta::new("api-data", "shop"),
            ResourceSpec::VolumeClaim(keel_cluster::ClaimSpec {
                storage_class: "standard".into(),
                access_modes: vec![],
                size: "1Gi".into(),
            }),
        );
        observed.push(claim);

        let ops = plan(&desired(), &observed);
        let last = ops.last().unwrap();
        assert_eq!(last.name(), "delete");
        assert_eq!(last.key().name, "api-canary");
        assert_eq!(ops.iter().filter(|op| op.name() == "delete").count(), 1);
    }

    #[test]
    fn network_policies_outlive_the_workloads_they_guard() {
        let observed = compose(
            &test_spec(),
            &TrafficPlan::Single(test_release("r1", 1)),
            &ComposeOptions::default(),
        )
        .unwrap()
        .resources;
        let deleted: Vec<String> = plan(&[], &observed)
            .iter()
            .map(|op| op.key().to_string())
            .collect();
        assert_eq!(
            deleted,
            vec![
                "exposure/shop/api",
                "workload/shop/api",
                "network_policy/shop/api-egress",
                "network_policy/shop/api-ingress",
            ]
        );
    }

    #[tokio::test]
    async fn conflict_rereads_and_retries() {
        let cluster = Arc::new(MemoryCluster::new());
        converge(&cluster, &desired()).await;

        let mut want = desired();
        if let ResourceSpec::Workload(w) = &mut want[0].spec {
            w.container.image = "registry.local/api:r2".into();
        }
        let observed = cluster.objects(ResourceKind::Workload, "shop").await;
        let ops = plan(&want[..1], &observed);

        // Another writer touches the workload between plan and apply.
        cluster
            .mutate_externally(ResourceKind::Workload, "shop", "api", |r| {
                r.meta.annotations.insert("other".into(), "x".into());
            })
            .await;

        let applied = Applier::new(cluster.clone(), 3)
            .apply(&ops[0])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(applied.as_workload().unwrap().container.image, "registry.local/api:r2");
    }

    #[tokio::test]
    async fn conflict_retries_are_bounded() {
        let cluster = Arc::new(MemoryCluster::new());
        converge(&cluster, &desired()).await;
        let mut want = desired();
        if let ResourceSpec::Workload(w) = &mut want[0].spec {
            w.replicas = 3;
        }
        let observed = cluster.objects(ResourceKind::Workload, "shop").await;
        let ops = plan(&want[..1], &observed);

        cluster
            .inject_fault(
                FaultOp::Update,
                Some(ResourceKind::Workload),
                None,
                ClusterError::Conflict {
                    kind: ResourceKind::Workload,
                    namespace: "shop".into(),
                    name: "api".into(),
                    expected: 1,
                    actual: 2,
                },
                10,
            )
            .await;

        let err = Applier::new(cluster.clone(), 2).apply(&ops[0]).await.unwrap_err();
        assert!(matches!(err, ApplyError::ConflictRetriesExhausted { attempts: 2, .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn already_exists_becomes_patch() {
        let cluster = Arc::new(MemoryCluster::new());
        let want = desired();
        let mut foreign = want[0].clone();
        if let ResourceSpec::Workload(w) = &mut foreign.spec {
            w.container.image = "someone/else".into();
        }
        cluster.insert_externally(foreign).await;

        let applied = Applier::new(cluster.clone(), 3)
            .apply(&Operation::Create(want[0].clone()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(applied.as_workload().unwrap().container.image, "registry.local/api:r1");
    }

    #[tokio::test]
    async fn one_failure_does_not_block_the_rest() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster
            .inject_fault(
                FaultOp::Create,
                Some(ResourceKind::Exposure),
                None,
                ClusterError::Unavailable("down".into()),
                1,
            )
            .await;

        let reports = converge(&cluster, &desired()).await;
        let failed: Vec<_> = reports.iter().filter(|r| r.result.is_err()).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].key.kind, ResourceKind::Exposure);
        assert!(cluster.object(ResourceKind::Routing, "shop", "api").await.is_some());
    }

    #[tokio::test]
    async fn cancelled_operations_are_not_applied() {
        let cluster = Arc::new(MemoryCluster::new());
        let (tx, rx) = watch::channel(false);
        tx.send_replace(true);

        let ops = plan(&desired(), &[]);
        let reports = Applier::new(cluster.clone(), 3).apply_all(&ops, &rx).await;
        assert!(reports
            .iter()
            .all(|r| matches!(r.result, Err(ApplyError::Cancelled(_)))));
        assert_eq!(cluster.mutation_count().await, 0);
    }
}

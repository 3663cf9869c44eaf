//! One reconciliation pass for one service.
//!
//! A pass loads the spec and the release(s) that should be serving,
//! refreshes domain state, composes the desired resources, ensures volume
//! claims, applies the diff, and drives the active rollout. The namespace
//! is created on first use. Rollout steps
//! that change the traffic plan (shift, promote, restore) are applied in
//! the same pass; waiting steps end the pass with a scheduled re-check.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard, watch};
use tracing::{debug, info, warn};

use keel_cluster::{ClusterError, Resource, ResourceClient, ResourceKind};
use keel_rollout::{
    Observation, Rollout, RolloutAction, RolloutKind, RolloutPhase, RolloutStrategy, SloSample,
    Track, TrafficShare,
};
use keel_state::{
    DeploymentRecord, ReconcileState, ReconciliationRecord, Release, ReleaseStatus, ServiceSpec,
    StateError, StateStore, SubResourceStatus,
};

use crate::apply::{ApplyReport, Applier, plan};
use crate::clock::Clock;
use crate::dispatcher::{PassOutcome, ReconcileHandler};
use crate::engine::running_canary;
use crate::error::{ApplyError, EngineResult};
use crate::labels;
use crate::manifest::{TrafficPlan, compose};
use crate::settings::EngineSettings;
use crate::signals::{DomainVerifier, SloSignals, refresh_domains};
use crate::status::{StatusReporter, aggregate_phase};
use crate::validate::validate_spec;
use crate::volumes::{ClaimOutcome, ClaimReport, VolumeManager, requires_exclusive_access};

/// Kinds the engine lists and prunes. Claims are handled by the volume
/// manager and never pruned.
const PRUNABLE: [ResourceKind; 5] = [
    ResourceKind::NetworkPolicy,
    ResourceKind::Workload,
    ResourceKind::Exposure,
    ResourceKind::Autoscaler,
    ResourceKind::Routing,
];

pub struct Reconciler {
    store: StateStore,
    client: Arc<dyn ResourceClient>,
    signals: Arc<dyn SloSignals>,
    domains: Arc<dyn DomainVerifier>,
    clock: Arc<dyn Clock>,
    status: Arc<StatusReporter>,
    volumes: VolumeManager,
    applier: Applier,
    settings: EngineSettings,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// How a pass ended, before it is turned into a [`PassOutcome`].
enum Stop {
    Settled,
    Recheck(Duration),
    Cancelled,
    /// A workload reported a state no retry can clear.
    Stuck(String),
}

impl Reconciler {
    pub fn new(
        store: StateStore,
        client: Arc<dyn ResourceClient>,
        signals: Arc<dyn SloSignals>,
        domains: Arc<dyn DomainVerifier>,
        clock: Arc<dyn Clock>,
        status: Arc<StatusReporter>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            volumes: VolumeManager::new(client.clone()),
            applier: Applier::new(client.clone(), settings.conflict_retries),
            store,
            client,
            signals,
            domains,
            clock,
            status,
            settings,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Serialize everything that reads and rewrites one service's record.
    pub async fn lock(&self, service_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .lock()
            .await
            .entry(service_id.to_string())
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    /// Run one pass for `service_id`.
    pub async fn run_pass(&self, service_id: &str, cancel: watch::Receiver<bool>) -> PassOutcome {
        let _guard = self.lock(service_id).await;
        match self.pass(service_id, cancel).await {
            Ok(outcome) => outcome,
            Err(e) => PassOutcome::Transient(e.to_string()),
        }
    }

    async fn pass(
        &self,
        service_id: &str,
        cancel: watch::Receiver<bool>,
    ) -> Result<PassOutcome, StateError> {
        let now = self.clock.now();
        let Some(mut spec) = self.store.get_service(service_id)? else {
            return Ok(match self.teardown(service_id).await {
                Ok(()) => PassOutcome::Converged,
                Err(e) => PassOutcome::Transient(e.to_string()),
            });
        };

        let mut record = self
            .status
            .get(service_id)
            .await?
            .unwrap_or_else(|| ReconciliationRecord::new(service_id));
        record.namespace = spec.namespace.clone();
        record.name = spec.name.clone();
        record.project = spec.project.clone();
        record.observed_spec_version = spec.version;
        record.updated_at = now;

        let problems = validate_spec(&spec);
        if !problems.is_empty() {
            return self.reject(record, problems.join("; ")).await;
        }
        // The oldest spec claiming a platform name keeps it.
        if let Some(owner) = self
            .store
            .services_named(&spec.namespace, &spec.name, &spec.id)?
            .into_iter()
            .find(|o| (o.created_at, &o.id) < (spec.created_at, &spec.id))
        {
            let reason = format!(
                "name {}/{} already owned by service {}",
                spec.namespace, spec.name, owner.id
            );
            return self.reject(record, reason).await;
        }

        if record.rollout.is_none() && record.deployment.is_none() {
            match self.store.latest_ready_release(service_id)? {
                Some(release) => {
                    info!(service = %service_id, release = %release.id, "first deploy");
                    record.rollout = Some(Rollout::promotion(
                        service_id,
                        RolloutStrategy::Direct,
                        None,
                        &release.id,
                        now,
                    ));
                }
                None => {
                    record.phase = ReconcileState::Pending;
                    record.message = Some("waiting for a ready release".to_string());
                    self.status.put(&record).await?;
                    return Ok(PassOutcome::Converged);
                }
            }
        }

        match self.client.ensure_namespace(&spec.namespace).await {
            Ok(true) => info!(service = %service_id, namespace = %spec.namespace, "namespace created"),
            Ok(false) => {}
            Err(e) => {
                let error = format!("namespace {}: {e}", spec.namespace);
                warn!(service = %service_id, %error, "namespace unavailable");
                record.attempts += 1;
                record.last_error = Some(error.clone());
                self.status.put(&record).await?;
                return Ok(PassOutcome::Transient(error));
            }
        }
        if let Some(rollout) = record.rollout.as_mut() {
            rollout.start(now);
        }
        // Volumes that became exclusive mid-canary cannot be mounted by both
        // tracks; drop the canary and keep serving the stable release.
        if requires_exclusive_access(&spec.volumes) {
            if let Some(mut rollout) = record.rollout.take_if(|r| running_canary(r)) {
                let reason = "exclusive volumes cannot be shared with a canary";
                warn!(
                    service = %service_id,
                    release = %rollout.target_release,
                    reason,
                    "canary abandoned"
                );
                rollout.abandon(reason, now);
                record.message = Some(format!(
                    "canary of {} abandoned: {reason}",
                    rollout.target_release
                ));
                record.last_rollout = Some(rollout);
            }
        }

        spec.domains = refresh_domains(
            self.domains.as_ref(),
            &spec.domains,
            &self.settings.compose.default_issuer,
        )
        .await;

        let mut failure: Option<String> = None;
        let mut steps = 0u32;
        let stop = loop {
            steps += 1;

            let traffic = match self.traffic_plan(&spec, &record)? {
                Ok(traffic) => traffic,
                Err(reason) => return self.reject(record, reason).await,
            };
            let desired = match compose(&spec, &traffic, &self.settings.compose) {
                Ok(desired) => desired,
                Err(e) => return self.reject(record, e.to_string()).await,
            };

            let claims = self.volumes.ensure(&desired.claims).await;
            let observed = match self.observe(&spec).await {
                Ok(observed) => observed,
                Err(e) => {
                    failure = Some(e.to_string());
                    break Stop::Settled;
                }
            };
            let ops = plan(&desired.resources, &observed);
            let reports = self.applier.apply_all(&ops, &cancel).await;

            record.resources = sub_resources(&record.resources, &claims, &reports, now);
            record.pending_hosts = desired.pending_hosts.clone();
            if let Some(error) = first_failure(&claims, &reports) {
                failure = Some(error);
            }
            if reports
                .iter()
                .any(|r| matches!(r.result, Err(ApplyError::Cancelled(_))))
            {
                break Stop::Cancelled;
            }

            let Some(mut rollout) = record.rollout.take() else {
                match workload_failure(&reports) {
                    Some(reason) => break Stop::Stuck(reason),
                    None => break Stop::Settled,
                }
            };
            let observation = self.observe_rollout(&spec, &rollout, &reports, now).await;
            let action = rollout.advance(&observation, now);
            debug!(
                service = %service_id,
                phase = rollout.phase.name(),
                ?action,
                "rollout advanced"
            );

            match action {
                RolloutAction::ShiftTraffic { .. }
                | RolloutAction::Promote
                | RolloutAction::RestoreStable { .. } => {
                    record.rollout = Some(rollout);
                    if steps >= self.settings.max_steps_per_pass {
                        break Stop::Recheck(Duration::ZERO);
                    }
                }
                RolloutAction::AwaitReady => {
                    record.rollout = Some(rollout);
                    break Stop::Recheck(self.settings.readiness_recheck);
                }
                RolloutAction::Wait { recheck_after_secs } => {
                    record.rollout = Some(rollout);
                    break Stop::Recheck(Duration::from_secs(recheck_after_secs));
                }
                RolloutAction::Finalize => {
                    record.deployment =
                        Some(deployment(&spec, &rollout, &rollout.target_release, now));
                    record.message = Some(format!("serving release {}", rollout.target_release));
                    record.last_rollout = Some(rollout);
                    break Stop::Settled;
                }
                RolloutAction::Abort { reason } => {
                    self.abort(&spec, &mut record, rollout, &reason, now)?;
                    break Stop::Settled;
                }
                RolloutAction::None => {
                    record.last_rollout = Some(rollout);
                    break Stop::Settled;
                }
            }
        };

        record.phase = aggregate_phase(&record.resources, &record.pending_hosts);
        let outcome = match (stop, failure) {
            (Stop::Cancelled, _) => PassOutcome::Cancelled,
            (Stop::Stuck(reason), _) => {
                warn!(service = %service_id, %reason, "workload cannot start");
                record.phase = ReconcileState::Failed;
                record.attempts = 0;
                record.message = Some(reason.clone());
                record.last_error = Some(reason.clone());
                PassOutcome::Failed(reason)
            }
            (_, Some(error)) => {
                record.attempts += 1;
                record.last_error = Some(error.clone());
                PassOutcome::Transient(error)
            }
            (Stop::Recheck(delay), None) => {
                record.attempts = 0;
                record.last_error = None;
                PassOutcome::RecheckAfter(delay)
            }
            (Stop::Settled, None) => {
                record.attempts = 0;
                record.last_error = None;
                if !record.pending_hosts.is_empty() {
                    PassOutcome::RecheckAfter(self.settings.domain_recheck)
                } else if record.phase != ReconcileState::Healthy {
                    PassOutcome::RecheckAfter(self.settings.readiness_recheck)
                } else {
                    PassOutcome::Converged
                }
            }
        };
        self.status.put(&record).await?;

        info!(
            service = %service_id,
            phase = ?record.phase,
            steps,
            ?outcome,
            "reconciled"
        );
        Ok(outcome)
    }

    /// Record a validation failure. Nothing reaches the platform.
    ///
    /// A rollout still in flight is abandoned so a corrected spec, or the
    /// next promote, starts from the release that was serving before it.
    async fn reject(
        &self,
        mut record: ReconciliationRecord,
        reason: String,
    ) -> Result<PassOutcome, StateError> {
        warn!(service = %record.service_id, %reason, "spec rejected");
        if let Some(mut rollout) = record.rollout.take() {
            if rollout.phase.is_terminal() {
                record.rollout = Some(rollout);
            } else {
                rollout.abandon(format!("abandoned: {reason}"), record.updated_at);
                record.last_rollout = Some(rollout);
            }
        }
        record.phase = ReconcileState::Failed;
        record.message = Some(reason.clone());
        record.last_error = Some(reason.clone());
        record.attempts = 0;
        self.status.put(&record).await?;
        Ok(PassOutcome::Invalid(reason))
    }

    fn release(&self, service_id: &str, release_id: &str) -> Result<Result<Release, String>, StateError> {
        Ok(self
            .store
            .get_release(service_id, release_id)?
            .ok_or_else(|| format!("release {release_id} not found")))
    }

    /// Which release(s) run now, from the rollout phase or the deployment.
    fn traffic_plan(
        &self,
        spec: &ServiceSpec,
        record: &ReconciliationRecord,
    ) -> Result<Result<TrafficPlan, String>, StateError> {
        let Some(rollout) = &record.rollout else {
            let Some(deployment) = &record.deployment else {
                return Ok(Err("nothing deployed".to_string()));
            };
            return Ok(self
                .release(&spec.id, &deployment.release_id)?
                .map(TrafficPlan::Single));
        };

        let target = match self.release(&spec.id, &rollout.target_release)? {
            Ok(release) => release,
            Err(e) => return Ok(Err(e)),
        };
        let previous = match &rollout.previous_release {
            Some(id) => match self.release(&spec.id, id)? {
                Ok(release) => Some(release),
                Err(e) => return Ok(Err(e)),
            },
            None => None,
        };

        Ok(Ok(match (rollout.traffic(), previous) {
            (TrafficShare::Split { canary_weight }, Some(stable)) => TrafficPlan::Split {
                stable,
                canary: target,
                canary_weight,
            },
            (TrafficShare::Previous, Some(previous)) => TrafficPlan::Single(previous),
            _ => TrafficPlan::Single(target),
        }))
    }

    /// Every managed, prunable resource of the service currently on the platform.
    async fn observe(&self, spec: &ServiceSpec) -> Result<Vec<Resource>, ClusterError> {
        let selector = labels::service_selector(&spec.project, &spec.name);
        let mut observed = Vec::new();
        for kind in PRUNABLE {
            observed.extend(self.client.list(kind, &spec.namespace, &selector).await?);
        }
        Ok(observed)
    }

    async fn observe_rollout(
        &self,
        spec: &ServiceSpec,
        rollout: &Rollout,
        reports: &[ApplyReport],
        now: u64,
    ) -> Observation {
        let running = |track, release: &str| {
            let name = labels::track_name(&spec.name, track);
            reports
                .iter()
                .filter(|r| r.key.kind == ResourceKind::Workload && r.key.name == name)
                .filter_map(|r| r.result.as_ref().ok().and_then(Option::as_ref))
                .find(|w| w.meta.labels.get(labels::RELEASE).map(String::as_str) == Some(release))
                .cloned()
        };

        let target = running(rollout.target_track(), &rollout.target_release);
        let target_ready = target.as_ref().is_some_and(Resource::is_ready);
        let target_failure = target.and_then(|w| w.status.failure);
        let previous_ready = rollout
            .previous_release
            .as_deref()
            .and_then(|p| running(Track::Stable, p))
            .is_some_and(|w| w.is_ready());

        let since = match rollout.phase {
            RolloutPhase::Analyzing { since, .. } => Some(since),
            RolloutPhase::Monitoring { .. } => Some(rollout.started_at.unwrap_or(now)),
            _ => None,
        };
        let sample = match since {
            Some(since) => self.sample(&spec.id, &rollout.target_release, since).await,
            None => None,
        };

        Observation {
            target_ready,
            previous_ready,
            sample,
            target_failure,
        }
    }

    async fn sample(&self, service_id: &str, release_id: &str, since: u64) -> Option<SloSample> {
        match self.signals.sample(service_id, release_id, since).await {
            Ok(sample) => sample,
            Err(e) => {
                warn!(service = %service_id, release = %release_id, error = %e, "SLO signals unavailable");
                None
            }
        }
    }

    /// The rollout ended in a rollback; the previous release serves again.
    fn abort(
        &self,
        spec: &ServiceSpec,
        record: &mut ReconciliationRecord,
        rollout: Rollout,
        reason: &str,
        now: u64,
    ) -> Result<(), StateError> {
        if let RolloutKind::Promotion { .. } = rollout.kind {
            self.store
                .set_release_status(&spec.id, &rollout.target_release, ReleaseStatus::Failed)?;
            warn!(
                service = %spec.id,
                release = %rollout.target_release,
                reason,
                "release marked failed"
            );
        }
        if let Some(previous) = &rollout.previous_release {
            record.deployment = Some(deployment(spec, &rollout, previous, now));
        }
        record.message = Some(format!(
            "rollout of {} rolled back: {reason}",
            rollout.target_release
        ));
        record.last_rollout = Some(rollout);
        Ok(())
    }

    /// Remove everything the engine created for a service, claims included,
    /// and forget it.
    pub async fn teardown(&self, service_id: &str) -> EngineResult<()> {
        let Some(record) = self.status.get(service_id).await? else {
            return Ok(());
        };
        if !record.name.is_empty() {
            let selector = labels::service_selector(&record.project, &record.name);
            for kind in PRUNABLE.iter().rev() {
                for resource in self.client.list(*kind, &record.namespace, &selector).await? {
                    match self
                        .client
                        .delete(*kind, &record.namespace, &resource.meta.name)
                        .await
                    {
                        Ok(()) | Err(ClusterError::NotFound { .. }) => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }
            let claims = self.volumes.delete_all(&record.namespace, &selector).await?;
            info!(service = %service_id, claims, "service resources removed");
        }

        self.store.delete_releases_for_service(service_id)?;
        self.store.delete_signals_for_service(service_id)?;
        self.status.remove(service_id).await?;
        self.locks.lock().await.remove(service_id);
        info!(service = %service_id, "service forgotten");
        Ok(())
    }
}

#[async_trait]
impl ReconcileHandler for Reconciler {
    async fn reconcile(
        &self,
        key: &str,
        attempt: u32,
        cancel: watch::Receiver<bool>,
    ) -> PassOutcome {
        debug!(service = %key, attempt, "pass starting");
        self.run_pass(key, cancel).await
    }

    async fn exhausted(&self, key: &str, attempts: u32, error: &str) {
        let _guard = self.lock(key).await;
        let mut record = match self.status.get(key).await {
            Ok(Some(record)) => record,
            Ok(None) => ReconciliationRecord::new(key),
            Err(e) => {
                warn!(service = %key, error = %e, "could not load record");
                return;
            }
        };
        record.phase = ReconcileState::Failed;
        record.attempts = attempts;
        record.last_error = Some(format!("retries exhausted after {attempts} attempts: {error}"));
        record.updated_at = self.clock.now();
        if let Err(e) = self.status.put(&record).await {
            warn!(service = %key, error = %e, "could not record exhaustion");
        }
    }
}

fn deployment(spec: &ServiceSpec, rollout: &Rollout, release_id: &str, now: u64) -> DeploymentRecord {
    let strategy = match &rollout.kind {
        RolloutKind::Promotion { strategy } => strategy.clone(),
        RolloutKind::Rollback { .. } => RolloutStrategy::Direct,
    };
    DeploymentRecord {
        release_id: release_id.to_string(),
        environment: spec.namespace.clone(),
        replicas: spec.replicas.min,
        strategy,
        deployed_at: now,
    }
}

fn sub_status(
    kind: ResourceKind,
    name: &str,
    state: ReconcileState,
    resource: Option<&Resource>,
    fingerprint: Option<String>,
    message: Option<String>,
    now: u64,
) -> SubResourceStatus {
    SubResourceStatus {
        kind: kind.as_str().to_string(),
        name: name.to_string(),
        state,
        fingerprint,
        resource_version: resource.map(|r| r.meta.resource_version),
        message,
        updated_at: now,
    }
}

/// Rebuild per-resource status from this step's claim and apply reports.
/// Deleted resources drop out; cancelled ones keep their last status.
fn sub_resources(
    previous: &BTreeMap<String, SubResourceStatus>,
    claims: &[ClaimReport],
    reports: &[ApplyReport],
    now: u64,
) -> BTreeMap<String, SubResourceStatus> {
    let mut next = BTreeMap::new();

    for claim in claims {
        let status = match (&claim.outcome, &claim.resource) {
            (ClaimOutcome::Failed { error }, _) => sub_status(
                ResourceKind::VolumeClaim,
                &claim.name,
                ReconcileState::Failed,
                None,
                None,
                Some(error.to_string()),
                now,
            ),
            (_, Some(resource)) => sub_status(
                ResourceKind::VolumeClaim,
                &claim.name,
                if resource.is_ready() {
                    ReconcileState::Healthy
                } else {
                    ReconcileState::Applying
                },
                Some(resource),
                Some(resource.fingerprint()),
                resource.status.volume_handle.clone(),
                now,
            ),
            (_, None) => sub_status(
                ResourceKind::VolumeClaim,
                &claim.name,
                ReconcileState::Applying,
                None,
                None,
                None,
                now,
            ),
        };
        next.insert(status.key(), status);
    }

    for report in reports {
        let status = match &report.result {
            Ok(None) => continue,
            Ok(Some(resource)) => sub_status(
                report.key.kind,
                &report.key.name,
                if resource.status.failure.is_some() {
                    ReconcileState::Failed
                } else if resource.is_ready() {
                    ReconcileState::Healthy
                } else {
                    ReconcileState::Applying
                },
                Some(resource),
                report.fingerprint.clone(),
                resource.status.failure.clone(),
                now,
            ),
            Err(ApplyError::Cancelled(_)) => {
                let key = format!("{}/{}", report.key.kind.as_str(), report.key.name);
                match previous.get(&key) {
                    Some(status) => status.clone(),
                    None => continue,
                }
            }
            Err(e) => {
                let key = format!("{}/{}", report.key.kind.as_str(), report.key.name);
                let mut status = previous.get(&key).cloned().unwrap_or_else(|| {
                    sub_status(
                        report.key.kind,
                        &report.key.name,
                        ReconcileState::Failed,
                        None,
                        None,
                        None,
                        now,
                    )
                });
                status.state = ReconcileState::Failed;
                status.message = Some(e.to_string());
                status.updated_at = now;
                status
            }
        };
        next.insert(status.key(), status);
    }
    next
}

/// First workload stuck in a state only a new release or spec can clear.
fn workload_failure(reports: &[ApplyReport]) -> Option<String> {
    reports
        .iter()
        .filter(|r| r.key.kind == ResourceKind::Workload)
        .filter_map(|r| r.result.as_ref().ok().and_then(Option::as_ref))
        .find_map(|w| {
            w.status
                .failure
                .as_ref()
                .map(|failure| format!("workload {} cannot start: {failure}", w.meta.name))
        })
}

fn first_failure(claims: &[ClaimReport], reports: &[ApplyReport]) -> Option<String> {
    let claim_error = claims.iter().find_map(|c| match &c.outcome {
        ClaimOutcome::Failed { error } => Some(format!("claim {}: {error}", c.name)),
        _ => None,
    });
    claim_error.or_else(|| {
        reports.iter().find_map(|r| match &r.result {
            Err(ApplyError::Cancelled(_)) | Ok(_) => None,
            Err(e) => Some(format!("{}: {e}", r.key)),
        })
    })
}

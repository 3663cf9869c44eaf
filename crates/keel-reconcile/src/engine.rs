//! Engine — the inbound surface: reconcile requests, status queries,
//! promotion, rollback and service deletion.
//!
//! Operations that change what should be serving only validate and record
//! intent; the dispatcher's next pass does the platform work.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use keel_cluster::ResourceClient;
use keel_rollout::{Rollout, RolloutKind, RolloutStrategy};
use keel_state::{ReconcileState, ReconciliationRecord, Release, ServiceSpec, StateStore};

use crate::clock::Clock;
use crate::dispatcher::{DispatchSettings, Dispatcher, PassOutcome, ReconcileHandler};
use crate::error::{ComposeError, EngineError, EngineResult};
use crate::reconciler::Reconciler;
use crate::settings::EngineSettings;
use crate::signals::{DomainVerifier, SloSignals};
use crate::status::StatusReporter;
use crate::validate::{validate_release, validate_spec};
use crate::volumes::requires_exclusive_access;

pub struct Engine {
    store: StateStore,
    status: Arc<StatusReporter>,
    reconciler: Arc<Reconciler>,
    dispatcher: Dispatcher,
    clock: Arc<dyn Clock>,
    settings: EngineSettings,
}

impl Engine {
    pub fn new(
        store: StateStore,
        client: Arc<dyn ResourceClient>,
        signals: Arc<dyn SloSignals>,
        domains: Arc<dyn DomainVerifier>,
        clock: Arc<dyn Clock>,
        settings: EngineSettings,
    ) -> Self {
        let status = Arc::new(StatusReporter::new(
            store.clone(),
            settings.status_cache_capacity,
        ));
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            client,
            signals,
            domains,
            clock.clone(),
            status.clone(),
            settings.clone(),
        ));
        Self {
            store,
            status,
            reconciler,
            dispatcher: Dispatcher::new(),
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Start the worker pool.
    pub async fn start(&self) {
        let handler: Arc<dyn ReconcileHandler> = self.reconciler.clone();
        self.dispatcher
            .start(
                handler,
                DispatchSettings {
                    workers: self.settings.workers,
                    backoff: self.settings.backoff.clone(),
                    max_attempts: self.settings.max_attempts,
                    shutdown_timeout: self.settings.shutdown_timeout,
                },
            )
            .await;
    }

    /// Stop accepting work, cancel in-flight passes between sub-resource
    /// operations, and wait for the workers.
    pub async fn shutdown(&self) {
        self.dispatcher.shutdown().await;
    }

    // ── Reconcile ──────────────────────────────────────────────────

    /// Queue a pass for the service.
    pub async fn reconcile(&self, service_id: &str) {
        self.dispatcher.enqueue(service_id).await;
    }

    /// Run one pass inline, bypassing the queue.
    pub async fn reconcile_now(&self, service_id: &str) -> PassOutcome {
        self.reconciler
            .run_pass(service_id, self.dispatcher.cancel_signal())
            .await
    }

    /// Store a spec (bumping its version) and queue a pass.
    ///
    /// Refused when another service already owns the platform name in the
    /// namespace, or when the spec adds exclusive volumes while a canary of
    /// this service is still running alongside the stable workload.
    pub async fn apply_spec(&self, mut spec: ServiceSpec) -> EngineResult<u64> {
        let problems = validate_spec(&spec);
        if !problems.is_empty() {
            return Err(ComposeError::InvalidSpec(problems).into());
        }

        let guard = self.reconciler.lock(&spec.id).await;
        if let Some(owner) = self
            .store
            .services_named(&spec.namespace, &spec.name, &spec.id)?
            .into_iter()
            .next()
        {
            return Err(EngineError::NameTaken {
                service: spec.id.clone(),
                namespace: spec.namespace.clone(),
                name: spec.name.clone(),
                owner: owner.id,
            });
        }
        if requires_exclusive_access(&spec.volumes) {
            if let Some(record) = self.status.get(&spec.id).await? {
                if record.rollout.as_ref().is_some_and(running_canary) {
                    return Err(EngineError::ExclusiveVolumes(spec.id.clone()));
                }
            }
        }

        let current = self.store.get_service(&spec.id)?.map(|s| s.version);
        spec.version = current.map_or(1, |v| v.max(spec.version) + 1);
        self.store.put_service(&spec)?;
        drop(guard);

        info!(service = %spec.id, version = spec.version, "spec stored");
        self.reconcile(&spec.id).await;
        Ok(spec.version)
    }

    /// Enqueue every known service, plus any record whose spec is gone so
    /// its resources get torn down.
    pub async fn resync(&self) -> EngineResult<usize> {
        let mut ids: Vec<String> = self
            .store
            .list_services()?
            .into_iter()
            .map(|s| s.id)
            .collect();
        for record in self.store.list_records()? {
            if !ids.contains(&record.service_id) {
                ids.push(record.service_id);
            }
        }
        for id in &ids {
            self.dispatcher.enqueue(id).await;
        }
        Ok(ids.len())
    }

    /// Periodic resync until `shutdown` flips.
    pub async fn run_resync(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.settings.resync_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = self.settings.resync_interval.as_secs(), "resync loop started");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.resync().await {
                        Ok(count) => info!(services = count, "resync queued"),
                        Err(e) => warn!(error = %e, "resync failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("resync loop stopping");
                        return;
                    }
                }
            }
        }
    }

    // ── Status ─────────────────────────────────────────────────────

    /// Current reconciliation record. A known service that has not been
    /// reconciled yet reports `Pending`.
    pub async fn get_status(&self, service_id: &str) -> EngineResult<ReconciliationRecord> {
        if let Some(record) = self.status.get(service_id).await? {
            return Ok(record);
        }
        let spec = self
            .store
            .get_service(service_id)?
            .ok_or_else(|| EngineError::ServiceNotFound(service_id.to_string()))?;
        let mut record = ReconciliationRecord::new(service_id);
        record.namespace = spec.namespace;
        record.name = spec.name;
        record.project = spec.project;
        record.phase = ReconcileState::Pending;
        Ok(record)
    }

    // ── Rollouts ───────────────────────────────────────────────────

    /// Start rolling `release_id` out with `strategy`.
    pub async fn promote(
        &self,
        service_id: &str,
        release_id: &str,
        strategy: RolloutStrategy,
    ) -> EngineResult<Rollout> {
        let guard = self.reconciler.lock(service_id).await;
        let (spec, release, mut record) = self.prepare(service_id, release_id).await?;

        if record.serving_release() == Some(release_id) {
            return Err(EngineError::AlreadyServing {
                service: service_id.to_string(),
                release: release_id.to_string(),
            });
        }
        if let RolloutStrategy::Canary(cfg) = &strategy {
            if requires_exclusive_access(&spec.volumes) {
                return Err(EngineError::ExclusiveVolumes(service_id.to_string()));
            }
            let problems = cfg.validate();
            if !problems.is_empty() {
                return Err(ComposeError::InvalidSpec(problems).into());
            }
        }
        let problems = validate_release(&spec, &release);
        if !problems.is_empty() {
            return Err(ComposeError::InvalidSpec(problems).into());
        }

        let canary = strategy.is_canary();
        let rollout = Rollout::promotion(
            service_id,
            strategy,
            record.serving_release(),
            release_id,
            self.clock.now(),
        );
        info!(
            service = %service_id,
            release = %release_id,
            previous = ?record.serving_release(),
            canary,
            "promotion requested"
        );
        record.rollout = Some(rollout.clone());
        self.status.put(&record).await?;
        drop(guard);

        self.reconcile(service_id).await;
        Ok(rollout)
    }

    /// Redeploy an earlier release, then watch it for the monitoring window.
    pub async fn rollback(&self, service_id: &str, target_release: &str) -> EngineResult<Rollout> {
        let guard = self.reconciler.lock(service_id).await;
        let (_, _, mut record) = self.prepare(service_id, target_release).await?;

        let Some(serving) = record.serving_release().map(str::to_string) else {
            return Err(EngineError::NothingDeployed(service_id.to_string()));
        };
        if serving == target_release {
            return Err(EngineError::AlreadyServing {
                service: service_id.to_string(),
                release: target_release.to_string(),
            });
        }

        let rollout = Rollout::rollback(
            service_id,
            self.settings.rollback.clone(),
            &serving,
            target_release,
            self.clock.now(),
        );
        info!(
            service = %service_id,
            from = %serving,
            to = %target_release,
            "rollback requested"
        );
        record.rollout = Some(rollout.clone());
        self.status.put(&record).await?;
        drop(guard);

        self.reconcile(service_id).await;
        Ok(rollout)
    }

    /// Checks shared by promote and rollback: the service and a ready
    /// release exist, and no rollout is running.
    async fn prepare(
        &self,
        service_id: &str,
        release_id: &str,
    ) -> EngineResult<(ServiceSpec, Release, ReconciliationRecord)> {
        let spec = self
            .store
            .get_service(service_id)?
            .ok_or_else(|| EngineError::ServiceNotFound(service_id.to_string()))?;
        let release = self
            .store
            .get_release(service_id, release_id)?
            .ok_or_else(|| EngineError::ReleaseNotFound {
                service: service_id.to_string(),
                release: release_id.to_string(),
            })?;
        if !release.is_ready() {
            return Err(EngineError::ReleaseNotReady {
                service: service_id.to_string(),
                release: release_id.to_string(),
            });
        }

        let mut record = self
            .status
            .get(service_id)
            .await?
            .unwrap_or_else(|| ReconciliationRecord::new(service_id));
        if let Some(active) = &record.rollout {
            if !active.phase.is_terminal() {
                return Err(EngineError::RolloutInProgress {
                    service: service_id.to_string(),
                    release: active.target_release.clone(),
                });
            }
        }
        record.namespace = spec.namespace.clone();
        record.name = spec.name.clone();
        record.project = spec.project.clone();
        Ok((spec, release, record))
    }

    // ── Deletion ───────────────────────────────────────────────────

    /// Remove the service and everything the engine created for it,
    /// claims included.
    pub async fn delete_service(&self, service_id: &str) -> EngineResult<()> {
        let guard = self.reconciler.lock(service_id).await;
        let spec = self.store.get_service(service_id)?;
        let known = self.status.get(service_id).await?.is_some();
        if spec.is_none() && !known {
            return Err(EngineError::ServiceNotFound(service_id.to_string()));
        }

        // A service that was never reconciled still needs its identity
        // recorded so teardown can find what it may have created.
        if let Some(spec) = &spec {
            if !known {
                let mut record = ReconciliationRecord::new(service_id);
                record.namespace = spec.namespace.clone();
                record.name = spec.name.clone();
                record.project = spec.project.clone();
                self.status.put(&record).await?;
            }
        }
        self.store.delete_service(service_id)?;
        self.reconciler.teardown(service_id).await?;
        drop(guard);
        info!(service = %service_id, "service deleted");
        Ok(())
    }
}

/// A canary promotion that has not settled; its two workloads may both be
/// running.
pub(crate) fn running_canary(rollout: &Rollout) -> bool {
    !rollout.phase.is_terminal()
        && matches!(
            &rollout.kind,
            RolloutKind::Promotion {
                strategy: RolloutStrategy::Canary(_)
            }
        )
}

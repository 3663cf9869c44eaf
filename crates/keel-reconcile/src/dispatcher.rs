//! Reconciliation dispatcher — keyed work queue and a fixed worker pool.
//!
//! A key is never handed to two workers at once. Requests for a key that
//! is already queued coalesce; requests for a key that is in flight mark
//! it dirty and it is queued once more when the pass ends. Retries and
//! scheduled re-checks are delayed entries in the same queue, so workers
//! never sleep on behalf of a service.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Exponential backoff with additive jitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    pub jitter: Duration,
}

impl Backoff {
    /// Delay before retry `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at `max`, plus up to `jitter`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let delay = self.base.saturating_mul(1u32 << exp).min(self.max);
        let jitter_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        if jitter_ms == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

/// Result of one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// Nothing left to do until something changes.
    Converged,
    /// Converging; look again after the delay.
    RecheckAfter(Duration),
    /// Retry with backoff.
    Transient(String),
    /// Never retried; the record already says why.
    Invalid(String),
    /// A workload cannot start (bad image, crash loop). Never retried; the
    /// next spec or release change queues a new pass.
    Failed(String),
    /// Interrupted by shutdown.
    Cancelled,
}

/// Runs passes for the dispatcher.
#[async_trait]
pub trait ReconcileHandler: Send + Sync {
    async fn reconcile(&self, key: &str, attempt: u32, cancel: watch::Receiver<bool>)
    -> PassOutcome;

    /// Called once a key has failed `attempts` times in a row.
    async fn exhausted(&self, key: &str, attempts: u32, error: &str);
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub workers: usize,
    pub backoff: Backoff,
    pub max_attempts: u32,
    pub shutdown_timeout: Duration,
}

// ── Work queue ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Next {
    Done,
    After(Duration),
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<String>,
    queued: HashSet<String>,
    delayed: HashMap<String, Instant>,
    in_flight: HashSet<String>,
    dirty: HashSet<String>,
    attempts: HashMap<String, u32>,
}

impl QueueState {
    fn push_ready(&mut self, key: &str) -> bool {
        if self.queued.insert(key.to_string()) {
            self.ready.push_back(key.to_string());
            true
        } else {
            false
        }
    }

    fn schedule(&mut self, key: &str, at: Instant) {
        if self.queued.contains(key) {
            return;
        }
        self.delayed
            .entry(key.to_string())
            .and_modify(|t| *t = (*t).min(at))
            .or_insert(at);
    }

    fn promote_due(&mut self, now: Instant) {
        let due: Vec<String> = self
            .delayed
            .iter()
            .filter(|(key, at)| **at <= now && !self.in_flight.contains(*key))
            .map(|(key, _)| key.clone())
            .collect();
        for key in due {
            self.delayed.remove(&key);
            self.push_ready(&key);
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.delayed
            .iter()
            .filter(|(key, _)| !self.in_flight.contains(*key))
            .map(|(_, at)| *at)
            .min()
    }
}

#[derive(Debug, Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `key` now. Supersedes any pending delay for it.
    pub async fn add(&self, key: &str) {
        let mut state = self.state.lock().await;
        state.delayed.remove(key);
        if state.in_flight.contains(key) {
            state.dirty.insert(key.to_string());
            return;
        }
        if state.push_ready(key) {
            self.notify.notify_one();
        }
    }

    /// Queue `key` after `delay`, unless it is already due sooner.
    pub async fn add_after(&self, key: &str, delay: Duration) {
        let mut state = self.state.lock().await;
        state.schedule(key, Instant::now() + delay);
        self.notify.notify_one();
    }

    /// Wait for the next key. `None` once `shutdown` fires.
    pub async fn next(&self, shutdown: &mut watch::Receiver<bool>) -> Option<String> {
        loop {
            if *shutdown.borrow() {
                return None;
            }
            let deadline = {
                let mut state = self.state.lock().await;
                state.promote_due(Instant::now());
                if let Some(key) = state.ready.pop_front() {
                    state.queued.remove(&key);
                    state.in_flight.insert(key.clone());
                    return Some(key);
                }
                state.next_deadline()
            };

            let sleep = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = sleep => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    async fn attempts(&self, key: &str) -> u32 {
        self.state
            .lock()
            .await
            .attempts
            .get(key)
            .copied()
            .unwrap_or_default()
    }

    async fn set_attempts(&self, key: &str, attempts: u32) {
        let mut state = self.state.lock().await;
        if attempts == 0 {
            state.attempts.remove(key);
        } else {
            state.attempts.insert(key.to_string(), attempts);
        }
    }

    /// Release `key` after a pass. A request that arrived mid-pass wins
    /// over any scheduled delay.
    async fn done(&self, key: &str, next: Next) {
        let mut state = self.state.lock().await;
        state.in_flight.remove(key);
        if state.dirty.remove(key) {
            state.delayed.remove(key);
            state.push_ready(key);
        } else if let Next::After(delay) = next {
            state.schedule(key, Instant::now() + delay);
        }
        drop(state);
        self.notify.notify_one();
    }

    /// Keys queued, delayed or in flight.
    pub async fn len(&self) -> usize {
        let state = self.state.lock().await;
        let mut keys: HashSet<&String> = state.queued.iter().collect();
        keys.extend(state.delayed.keys());
        keys.extend(state.in_flight.iter());
        keys.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

// ── Dispatcher ─────────────────────────────────────────────────────

pub struct Dispatcher {
    queue: Arc<WorkQueue>,
    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown_timeout: Mutex<Duration>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            queue: Arc::new(WorkQueue::new()),
            shutdown_tx,
            workers: Mutex::new(Vec::new()),
            shutdown_timeout: Mutex::new(Duration::from_secs(30)),
        }
    }

    /// Spawn the worker pool. Calling it again while running does nothing.
    pub async fn start(&self, handler: Arc<dyn ReconcileHandler>, settings: DispatchSettings) {
        let mut workers = self.workers.lock().await;
        if !workers.is_empty() {
            return;
        }
        *self.shutdown_timeout.lock().await = settings.shutdown_timeout;
        let settings = Arc::new(settings);
        for id in 0..settings.workers.max(1) {
            let queue = self.queue.clone();
            let handler = handler.clone();
            let settings = settings.clone();
            let shutdown = self.shutdown_tx.subscribe();
            workers.push(tokio::spawn(async move {
                run_worker(id, queue, handler, settings, shutdown).await;
            }));
        }
        info!(workers = workers.len(), "dispatcher started");
    }

    pub async fn enqueue(&self, key: &str) {
        self.queue.add(key).await;
    }

    pub async fn enqueue_after(&self, key: &str, delay: Duration) {
        self.queue.add_after(key, delay).await;
    }

    /// Shutdown signal shared with the workers. Also the cancellation
    /// token checked between sub-resource operations.
    pub fn cancel_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    /// Signal every worker and wait for them to finish their current pass.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let timeout = *self.shutdown_timeout.lock().await;
        let handles: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        for mut handle in handles {
            if tokio::time::timeout(timeout, &mut handle).await.is_err() {
                warn!("worker did not stop in time, aborting");
                handle.abort();
            }
        }
        info!("dispatcher stopped");
    }
}

async fn run_worker(
    id: usize,
    queue: Arc<WorkQueue>,
    handler: Arc<dyn ReconcileHandler>,
    settings: Arc<DispatchSettings>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(worker = id, "worker starting");
    while let Some(key) = queue.next(&mut shutdown).await {
        let attempt = queue.attempts(&key).await + 1;
        let outcome = handler.reconcile(&key, attempt, shutdown.clone()).await;
        debug!(worker = id, service = %key, attempt, ?outcome, "pass finished");

        let next = match outcome {
            PassOutcome::Converged => {
                queue.set_attempts(&key, 0).await;
                Next::Done
            }
            PassOutcome::RecheckAfter(delay) => {
                queue.set_attempts(&key, 0).await;
                Next::After(delay)
            }
            PassOutcome::Invalid(reason) => {
                queue.set_attempts(&key, 0).await;
                warn!(service = %key, %reason, "invalid spec, not retrying");
                Next::Done
            }
            PassOutcome::Failed(reason) => {
                queue.set_attempts(&key, 0).await;
                warn!(service = %key, %reason, "workload cannot start, not retrying");
                Next::Done
            }
            PassOutcome::Cancelled => Next::Done,
            PassOutcome::Transient(error) => {
                if attempt >= settings.max_attempts {
                    queue.set_attempts(&key, 0).await;
                    warn!(service = %key, attempt, %error, "retries exhausted");
                    handler.exhausted(&key, attempt, &error).await;
                    Next::Done
                } else {
                    queue.set_attempts(&key, attempt).await;
                    let delay = settings.backoff.delay(attempt);
                    debug!(service = %key, attempt, ?delay, %error, "retrying after backoff");
                    Next::After(delay)
                }
            }
        };
        queue.done(&key, next).await;
    }
    debug!(worker = id, "worker stopped");
}

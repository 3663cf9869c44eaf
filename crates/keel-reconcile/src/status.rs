//! Status reporter — reconciliation records, persisted in the state store
//! and fronted by a bounded cache.

use std::collections::{BTreeMap, HashMap};

use tokio::sync::Mutex;
use tracing::debug;

use keel_state::{
    PendingHost, ReconcileState, ReconciliationRecord, StateResult, StateStore, SubResourceStatus,
};

struct Cache {
    capacity: usize,
    tick: u64,
    entries: HashMap<String, (ReconciliationRecord, u64)>,
}

impl Cache {
    fn touch(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn get(&mut self, id: &str) -> Option<ReconciliationRecord> {
        let tick = self.touch();
        let (record, used) = self.entries.get_mut(id)?;
        *used = tick;
        Some(record.clone())
    }

    fn insert(&mut self, record: ReconciliationRecord) {
        if self.capacity == 0 {
            return;
        }
        let tick = self.touch();
        self.entries.insert(record.service_id.clone(), (record, tick));
        while self.entries.len() > self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, (_, used))| *used)
                .map(|(id, _)| id.clone());
            match oldest {
                Some(id) => {
                    self.entries.remove(&id);
                }
                None => break,
            }
        }
    }
}

pub struct StatusReporter {
    store: StateStore,
    cache: Mutex<Cache>,
}

impl StatusReporter {
    pub fn new(store: StateStore, capacity: usize) -> Self {
        Self {
            store,
            cache: Mutex::new(Cache {
                capacity,
                tick: 0,
                entries: HashMap::new(),
            }),
        }
    }

    pub async fn get(&self, service_id: &str) -> StateResult<Option<ReconciliationRecord>> {
        let mut cache = self.cache.lock().await;
        if let Some(record) = cache.get(service_id) {
            return Ok(Some(record));
        }
        let record = self.store.get_record(service_id)?;
        if let Some(record) = &record {
            cache.insert(record.clone());
        }
        Ok(record)
    }

    /// Persist first, then cache, so the cache never holds unsaved state.
    pub async fn put(&self, record: &ReconciliationRecord) -> StateResult<()> {
        let mut cache = self.cache.lock().await;
        self.store.put_record(record)?;
        cache.insert(record.clone());
        debug!(
            service = %record.service_id,
            phase = ?record.phase,
            resources = record.resources.len(),
            "status recorded"
        );
        Ok(())
    }

    pub async fn remove(&self, service_id: &str) -> StateResult<bool> {
        let mut cache = self.cache.lock().await;
        cache.entries.remove(service_id);
        self.store.delete_record(service_id)
    }

    #[cfg(test)]
    async fn cached(&self) -> usize {
        self.cache.lock().await.entries.len()
    }
}

/// Service phase from its sub-resources and held hosts.
pub fn aggregate_phase(
    resources: &BTreeMap<String, SubResourceStatus>,
    pending_hosts: &[PendingHost],
) -> ReconcileState {
    let mut healthy = false;
    let mut broken = !pending_hosts.is_empty();
    let mut in_progress = false;
    for status in resources.values() {
        match status.state {
            ReconcileState::Healthy => healthy = true,
            ReconcileState::Failed | ReconcileState::Degraded => broken = true,
            ReconcileState::Applying | ReconcileState::Pending => in_progress = true,
        }
    }

    if broken {
        if healthy {
            ReconcileState::Degraded
        } else {
            ReconcileState::Failed
        }
    } else if in_progress {
        ReconcileState::Applying
    } else if healthy {
        ReconcileState::Healthy
    } else {
        ReconcileState::Pending
    }
}

//! StateStore — redb-backed state persistence for Keel.
//!
//! Provides typed CRUD operations over service specs, releases,
//! reconciliation records and SLO signal snapshots. All values are
//! JSON-serialized into redb's `&[u8]` value columns. The store supports
//! both on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, TableHandle};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path)?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder().create_with_backend(backend)?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write()?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(SERVICES)?;
        txn.open_table(RELEASES)?;
        txn.open_table(RECORDS)?;
        txn.open_table(SIGNALS)?;
        txn.commit()?;
        Ok(())
    }

    // ── Generic JSON helpers ───────────────────────────────────────

    fn put<T: Serialize>(&self, table: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let value = serde_json::to_vec(value).map_err(|source| codec(table, key, source))?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(table)?;
            table.insert(key, value.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, table: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read()?;
        let rows = txn.open_table(table)?;
        match rows.get(key)? {
            Some(guard) => {
                let value: T = serde_json::from_slice(guard.value())
                    .map_err(|source| codec(table, key, source))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// All values whose key starts with `prefix`, in key order.
    fn scan<T: DeserializeOwned>(&self, table: JsonTable, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read()?;
        let rows = txn.open_table(table)?;
        let mut results = Vec::new();
        for entry in rows.iter()? {
            let (key, value) = entry?;
            if key.value().starts_with(prefix) {
                let item: T = serde_json::from_slice(value.value())
                    .map_err(|source| codec(table, key.value(), source))?;
                results.push(item);
            }
        }
        Ok(results)
    }

    fn remove(&self, table: JsonTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write()?;
        let existed;
        {
            let mut table = txn.open_table(table)?;
            existed = table.remove(key)?.is_some();
        }
        txn.commit()?;
        Ok(existed)
    }

    /// Remove every key starting with `prefix`. Returns number deleted.
    fn remove_prefix(&self, table: JsonTable, prefix: &str) -> StateResult<u32> {
        // Collect keys in a read transaction first.
        let keys: Vec<String> = {
            let txn = self.db.begin_read()?;
            let table = txn.open_table(table)?;
            let mut keys = Vec::new();
            for entry in table.iter()? {
                let (key, _) = entry?;
                if key.value().starts_with(prefix) {
                    keys.push(key.value().to_string());
                }
            }
            keys
        };

        let txn = self.db.begin_write()?;
        let mut count = 0u32;
        {
            let mut table = txn.open_table(table)?;
            for key in &keys {
                if table.remove(key.as_str())?.is_some() {
                    count += 1;
                }
            }
        }
        txn.commit()?;
        Ok(count)
    }

    // ── Services ───────────────────────────────────────────────────

    /// Insert or update a service spec.
    pub fn put_service(&self, spec: &ServiceSpec) -> StateResult<()> {
        let key = spec.table_key();
        self.put(SERVICES, &key, spec)?;
        debug!(%key, version = spec.version, "service spec stored");
        Ok(())
    }

    pub fn get_service(&self, id: &str) -> StateResult<Option<ServiceSpec>> {
        self.get(SERVICES, id)
    }

    pub fn list_services(&self) -> StateResult<Vec<ServiceSpec>> {
        self.scan(SERVICES, "")
    }

    /// Services other than `except_id` whose workloads would carry the same
    /// platform name, oldest first.
    pub fn services_named(
        &self,
        namespace: &str,
        name: &str,
        except_id: &str,
    ) -> StateResult<Vec<ServiceSpec>> {
        let mut named: Vec<ServiceSpec> = self
            .list_services()?
            .into_iter()
            .filter(|s| s.id != except_id && s.namespace == namespace && s.name == name)
            .collect();
        named.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(named)
    }

    /// Delete a service spec. Returns true if it existed.
    pub fn delete_service(&self, id: &str) -> StateResult<bool> {
        let existed = self.remove(SERVICES, id)?;
        debug!(%id, existed, "service spec deleted");
        Ok(existed)
    }

    // ── Releases ───────────────────────────────────────────────────

    pub fn put_release(&self, release: &Release) -> StateResult<()> {
        let key = release.table_key();
        self.put(RELEASES, &key, release)?;
        debug!(%key, status = ?release.status, "release stored");
        Ok(())
    }

    pub fn get_release(&self, service_id: &str, release_id: &str) -> StateResult<Option<Release>> {
        self.get(RELEASES, &release_key(service_id, release_id))
    }

    /// All releases of a service, oldest version first.
    pub fn list_releases(&self, service_id: &str) -> StateResult<Vec<Release>> {
        let mut releases: Vec<Release> = self.scan(RELEASES, &format!("{service_id}:"))?;
        releases.sort_by(|a, b| a.version.cmp(&b.version).then_with(|| a.id.cmp(&b.id)));
        Ok(releases)
    }

    /// Highest-version release of a service that finished building.
    pub fn latest_ready_release(&self, service_id: &str) -> StateResult<Option<Release>> {
        Ok(self
            .list_releases(service_id)?
            .into_iter()
            .filter(Release::is_ready)
            .next_back())
    }

    /// Change a release's status, returning the updated release.
    pub fn set_release_status(
        &self,
        service_id: &str,
        release_id: &str,
        status: ReleaseStatus,
    ) -> StateResult<Release> {
        let mut release = self
            .get_release(service_id, release_id)?
            .ok_or_else(|| StateError::ReleaseNotFound {
                service_id: service_id.to_string(),
                release_id: release_id.to_string(),
            })?;
        release.status = status;
        self.put_release(&release)?;
        Ok(release)
    }

    pub fn delete_releases_for_service(&self, service_id: &str) -> StateResult<u32> {
        self.remove_prefix(RELEASES, &format!("{service_id}:"))
    }

    // ── Reconciliation records ─────────────────────────────────────

    pub fn put_record(&self, record: &ReconciliationRecord) -> StateResult<()> {
        let key = record.table_key();
        self.put(RECORDS, &key, record)?;
        debug!(%key, phase = ?record.phase, "reconciliation record stored");
        Ok(())
    }

    pub fn get_record(&self, service_id: &str) -> StateResult<Option<ReconciliationRecord>> {
        self.get(RECORDS, service_id)
    }

    pub fn list_records(&self) -> StateResult<Vec<ReconciliationRecord>> {
        self.scan(RECORDS, "")
    }

    pub fn delete_record(&self, service_id: &str) -> StateResult<bool> {
        self.remove(RECORDS, service_id)
    }

    // ── SLO signals ────────────────────────────────────────────────

    pub fn put_signal(&self, snapshot: &SignalSnapshot) -> StateResult<()> {
        self.put(SIGNALS, &snapshot.table_key(), snapshot)
    }

    /// Most recent snapshot for a release.
    pub fn latest_signal(
        &self,
        service_id: &str,
        release_id: &str,
    ) -> StateResult<Option<SignalSnapshot>> {
        let prefix = format!("{}:", release_key(service_id, release_id));
        Ok(self.scan::<SignalSnapshot>(SIGNALS, &prefix)?.pop())
    }

    /// Snapshots for a release taken at or after `since`, oldest first.
    pub fn signals_since(
        &self,
        service_id: &str,
        release_id: &str,
        since: u64,
    ) -> StateResult<Vec<SignalSnapshot>> {
        let prefix = format!("{}:", release_key(service_id, release_id));
        let mut snapshots: Vec<SignalSnapshot> = self.scan(SIGNALS, &prefix)?;
        snapshots.retain(|s| s.epoch >= since);
        Ok(snapshots)
    }

    pub fn delete_signals_for_service(&self, service_id: &str) -> StateResult<u32> {
        self.remove_prefix(SIGNALS, &format!("{service_id}:"))
    }
}

fn codec(table: JsonTable, key: &str, source: serde_json::Error) -> StateError {
    StateError::Codec {
        table: table.name().to_string(),
        key: key.to_string(),
        source,
    }
}

//! StateStore — redb-backed persistence for rollgate.
//!
//! Provides typed operations over strategies, runs and workloads. All
//! values are JSON-serialized into redb's `&[u8]` value columns. The store
//! supports both on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use rollgate_core::{Run, RunControl, RolloutStrategy};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(STRATEGIES).map_err(map_err!(Table))?;
        txn.open_table(RUNS).map_err(map_err!(Table))?;
        txn.open_table(WORKLOADS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic helpers ────────────────────────────────────────────

    fn put<T: Serialize>(&self, table: Table, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            t.insert(key, bytes.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, table: Table, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        match t.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn list<T: DeserializeOwned>(&self, table: Table, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in t.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                let item: T =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(item);
            }
        }
        Ok(results)
    }

    fn delete(&self, table: Table, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            existed = t.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Read-modify-write a single record inside one write transaction.
    fn modify<T, F>(&self, table: Table, key: &str, f: F) -> StateResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T) -> StateResult<()>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let value = {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            let current: Option<Vec<u8>> = t
                .get(key)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec());
            let bytes = current.ok_or_else(|| StateError::NotFound(key.to_string()))?;
            let mut value: T = serde_json::from_slice(&bytes).map_err(map_err!(Deserialize))?;
            f(&mut value)?;
            let bytes = serde_json::to_vec(&value).map_err(map_err!(Serialize))?;
            t.insert(key, bytes.as_slice()).map_err(map_err!(Write))?;
            value
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(value)
    }

    // ── Strategies ─────────────────────────────────────────────────

    /// Insert or update a strategy.
    pub fn put_strategy(&self, strategy: &RolloutStrategy) -> StateResult<()> {
        let key = strategy.table_key();
        self.put(STRATEGIES, &key, strategy)?;
        debug!(%key, "strategy stored");
        Ok(())
    }

    /// Get a strategy by `{namespace}/{name}` key.
    pub fn get_strategy(&self, key: &str) -> StateResult<Option<RolloutStrategy>> {
        self.get(STRATEGIES, key)
    }

    /// List all strategies.
    pub fn list_strategies(&self) -> StateResult<Vec<RolloutStrategy>> {
        self.list(STRATEGIES, "")
    }

    /// Delete a strategy by key. Returns true if it existed.
    pub fn delete_strategy(&self, key: &str) -> StateResult<bool> {
        let existed = self.delete(STRATEGIES, key)?;
        debug!(%key, existed, "strategy deleted");
        Ok(existed)
    }

    // ── Runs ───────────────────────────────────────────────────────

    /// Store a new run. Fails if a run with the same key exists.
    ///
    /// On success the run's `resource_version` is set to 1.
    pub fn create_run(&self, run: &mut Run) -> StateResult<()> {
        let key = run.table_key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(RUNS).map_err(map_err!(Table))?;
            if t.get(key.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::AlreadyExists(key));
            }
            run.metadata.resource_version = 1;
            let bytes = serde_json::to_vec(&*run).map_err(map_err!(Serialize))?;
            t.insert(key.as_str(), bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, "run created");
        Ok(())
    }

    /// Write back a run read earlier.
    ///
    /// Fails with [`StateError::Conflict`] if the stored run has moved past
    /// the `resource_version` carried by `run`. On success the version is
    /// bumped in place.
    pub fn update_run(&self, run: &mut Run) -> StateResult<()> {
        let key = run.table_key();
        let expected = run.metadata.resource_version;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(RUNS).map_err(map_err!(Table))?;
            let stored: Option<Vec<u8>> = t
                .get(key.as_str())
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec());
            let stored = stored.ok_or_else(|| StateError::NotFound(key.clone()))?;
            let stored: Run = serde_json::from_slice(&stored).map_err(map_err!(Deserialize))?;
            let found = stored.metadata.resource_version;
            if found != expected {
                return Err(StateError::Conflict {
                    key,
                    expected,
                    found,
                });
            }
            run.metadata.resource_version = expected + 1;
            let bytes = serde_json::to_vec(&*run).map_err(map_err!(Serialize))?;
            t.insert(key.as_str(), bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Atomically change a run's control requests.
    ///
    /// Bumps `generation` and `resource_version` so a concurrent status
    /// writer holding the old version gets a conflict and re-reads.
    pub fn update_run_control<F>(&self, key: &str, f: F) -> StateResult<Run>
    where
        F: FnOnce(&mut RunControl),
    {
        let run = self.modify(RUNS, key, |run: &mut Run| {
            f(&mut run.control);
            run.metadata.generation += 1;
            run.metadata.resource_version += 1;
            Ok(())
        })?;
        debug!(%key, control = ?run.control, "run control updated");
        Ok(run)
    }

    /// Get a run by `{namespace}/{name}` key.
    pub fn get_run(&self, key: &str) -> StateResult<Option<Run>> {
        self.get(RUNS, key)
    }

    /// List all runs.
    pub fn list_runs(&self) -> StateResult<Vec<Run>> {
        self.list(RUNS, "")
    }

    /// List runs that have not reached a terminal phase.
    pub fn list_active_runs(&self) -> StateResult<Vec<Run>> {
        Ok(self
            .list_runs()?
            .into_iter()
            .filter(|run| !run.is_terminal())
            .collect())
    }

    /// Delete a run by key. Returns true if it existed.
    pub fn delete_run(&self, key: &str) -> StateResult<bool> {
        let existed = self.delete(RUNS, key)?;
        debug!(%key, existed, "run deleted");
        Ok(existed)
    }

    // ── Workloads ──────────────────────────────────────────────────

    /// Insert or update a workload record.
    pub fn put_workload(&self, workload: &WorkloadRecord) -> StateResult<()> {
        self.put(WORKLOADS, &workload.table_key(), workload)
    }

    /// Get a workload by cluster, namespace and name.
    pub fn get_workload(
        &self,
        cluster: &str,
        namespace: &str,
        name: &str,
    ) -> StateResult<Option<WorkloadRecord>> {
        self.get(WORKLOADS, &workload_key(cluster, namespace, name))
    }

    /// Atomically modify a workload record.
    pub fn update_workload<F>(
        &self,
        cluster: &str,
        namespace: &str,
        name: &str,
        f: F,
    ) -> StateResult<WorkloadRecord>
    where
        F: FnOnce(&mut WorkloadRecord),
    {
        self.modify(WORKLOADS, &workload_key(cluster, namespace, name), |w| {
            f(w);
            Ok(())
        })
    }

    /// List all workloads.
    pub fn list_workloads(&self) -> StateResult<Vec<WorkloadRecord>> {
        self.list(WORKLOADS, "")
    }

    /// List workloads in a namespace across all clusters.
    pub fn list_workloads_in_namespace(&self, namespace: &str) -> StateResult<Vec<WorkloadRecord>> {
        Ok(self
            .list_workloads()?
            .into_iter()
            .filter(|w| w.namespace == namespace)
            .collect())
    }

    /// Delete a workload. Returns true if it existed.
    pub fn delete_workload(&self, cluster: &str, namespace: &str, name: &str) -> StateResult<bool> {
        self.delete(WORKLOADS, &workload_key(cluster, namespace, name))
    }
}

//! StateStore: redb-backed state persistence for volgrid.
//!
//! Provides typed CRUD operations over volumes, nodes, drivers, plugin
//! facts, and tasks. All values are JSON-serialized into redb's `&[u8]`
//! value columns. The store supports both on-disk and in-memory backends
//! (the latter for testing).
//!
//! Updates to existing records go through [`StateStore::update_volume`]
//! and friends: the record is read, handed to a closure, and written back
//! inside one write transaction. A closure error aborts the transaction.

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Outcome of a read-modify-write.
#[derive(Debug, Clone)]
pub struct Updated<T, R> {
    /// The record as committed.
    pub record: T,
    /// Whatever the closure returned.
    pub output: R,
    /// False when the closure left the record untouched (nothing was written).
    pub changed: bool,
}

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
        for def in [VOLUMES, VOLUME_NAMES, NODES, DRIVERS, PLUGINS, TASKS] {
            txn.open_table(def).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic helpers ────────────────────────────────────────────

    fn put_json<T: Serialize>(&self, def: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, def: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn list_json<T: DeserializeOwned>(&self, def: JsonTable) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let item: T = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(item);
        }
        Ok(results)
    }

    fn delete_key(&self, def: JsonTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Read-modify-write a single record inside one write transaction.
    ///
    /// `touch` runs only when the closure actually changed the record.
    fn update_json<T, R, E>(
        &self,
        def: JsonTable,
        key: &str,
        f: impl FnOnce(&mut T) -> Result<R, E>,
        touch: impl FnOnce(&mut T),
    ) -> Result<Updated<T, R>, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<StateError>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let updated = {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            let before: Vec<u8> = match table.get(key).map_err(map_err!(Read))? {
                Some(guard) => guard.value().to_vec(),
                None => return Err(StateError::NotFound(key.to_string()).into()),
            };
            let mut record: T = serde_json::from_slice(&before).map_err(map_err!(Deserialize))?;
            let output = f(&mut record)?;

            let after = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
            let changed = after != before;
            if changed {
                touch(&mut record);
                let bytes = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
                table
                    .insert(key, bytes.as_slice())
                    .map_err(map_err!(Write))?;
            }
            Updated {
                record,
                output,
                changed,
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(updated)
    }

    // ── Volumes ────────────────────────────────────────────────────

    /// Insert a new volume, enforcing unique id and name.
    pub fn insert_volume(&self, volume: &Volume) -> StateResult<()> {
        let value = serde_json::to_vec(volume).map_err(map_err!(Serialize))?;
        let id_value = serde_json::to_vec(&volume.id).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut names = txn.open_table(VOLUME_NAMES).map_err(map_err!(Table))?;
            if names.get(volume.name()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::Conflict(format!("volume name {}", volume.name())));
            }
            let mut table = txn.open_table(VOLUMES).map_err(map_err!(Table))?;
            if table.get(volume.id.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::Conflict(format!("volume id {}", volume.id)));
            }
            table
                .insert(volume.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            names
                .insert(volume.name(), id_value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(volume_id = %volume.id, name = %volume.name(), "volume stored");
        Ok(())
    }

    /// Get a volume by ID.
    pub fn get_volume(&self, volume_id: &str) -> StateResult<Option<Volume>> {
        self.get_json(VOLUMES, volume_id)
    }

    /// Get a volume by its unique name.
    pub fn get_volume_by_name(&self, name: &str) -> StateResult<Option<Volume>> {
        let id: Option<String> = self.get_json(VOLUME_NAMES, name)?;
        match id {
            Some(id) => self.get_volume(&id),
            None => Ok(None),
        }
    }

    /// List all volumes.
    pub fn list_volumes(&self) -> StateResult<Vec<Volume>> {
        self.list_json(VOLUMES)
    }

    /// Read-modify-write a volume. Bumps `version` and `updated_at` on change.
    pub fn update_volume<R, E>(
        &self,
        volume_id: &str,
        f: impl FnOnce(&mut Volume) -> Result<R, E>,
    ) -> Result<Updated<Volume, R>, E>
    where
        E: From<StateError>,
    {
        self.update_json(VOLUMES, volume_id, f, |v: &mut Volume| {
            v.version += 1;
            v.updated_at = epoch_secs();
        })
    }

    /// Delete a volume after `check` approves it, in the same transaction.
    pub fn delete_volume_checked<E>(
        &self,
        volume_id: &str,
        check: impl FnOnce(&Volume) -> Result<(), E>,
    ) -> Result<Volume, E>
    where
        E: From<StateError>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let volume = {
            let mut table = txn.open_table(VOLUMES).map_err(map_err!(Table))?;
            let volume: Volume = match table.get(volume_id).map_err(map_err!(Read))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => return Err(StateError::NotFound(volume_id.to_string()).into()),
            };
            check(&volume)?;
            table.remove(volume_id).map_err(map_err!(Write))?;
            let mut names = txn.open_table(VOLUME_NAMES).map_err(map_err!(Table))?;
            names.remove(volume.name()).map_err(map_err!(Write))?;
            volume
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%volume_id, "volume deleted");
        Ok(volume)
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Insert or update a node.
    pub fn put_node(&self, node: &NodeInfo) -> StateResult<()> {
        self.put_json(NODES, &node.id, node)
    }

    /// Get a node by ID.
    pub fn get_node(&self, node_id: &str) -> StateResult<Option<NodeInfo>> {
        self.get_json(NODES, node_id)
    }

    /// List all nodes, ordered by node ID.
    pub fn list_nodes(&self) -> StateResult<Vec<NodeInfo>> {
        self.list_json(NODES)
    }

    pub fn update_node<R, E>(
        &self,
        node_id: &str,
        f: impl FnOnce(&mut NodeInfo) -> Result<R, E>,
    ) -> Result<Updated<NodeInfo, R>, E>
    where
        E: From<StateError>,
    {
        self.update_json(NODES, node_id, f, |_| {})
    }

    /// Delete a node by ID. Returns true if it existed.
    pub fn delete_node(&self, node_id: &str) -> StateResult<bool> {
        self.delete_key(NODES, node_id)
    }

    // ── Drivers ────────────────────────────────────────────────────

    pub fn put_driver(&self, driver: &DriverInfo) -> StateResult<()> {
        self.put_json(DRIVERS, &driver.name, driver)
    }

    pub fn list_drivers(&self) -> StateResult<Vec<DriverInfo>> {
        self.list_json(DRIVERS)
    }

    /// Look up a driver by canonical name or alias.
    pub fn find_driver(&self, name: &str) -> StateResult<Option<DriverInfo>> {
        if let Some(driver) = self.get_json::<DriverInfo>(DRIVERS, name)? {
            return Ok(Some(driver));
        }
        Ok(self
            .list_drivers()?
            .into_iter()
            .find(|d| d.answers_to(name)))
    }

    // ── Plugin facts ───────────────────────────────────────────────

    pub fn put_plugin_fact(&self, fact: &PluginFact) -> StateResult<()> {
        self.put_json(PLUGINS, &fact.table_key(), fact)
    }

    pub fn list_plugin_facts(&self) -> StateResult<Vec<PluginFact>> {
        self.list_json(PLUGINS)
    }

    /// All facts reported for one canonical driver, ordered by node ID.
    pub fn list_plugin_facts_for_driver(&self, driver: &str) -> StateResult<Vec<PluginFact>> {
        Ok(self
            .list_plugin_facts()?
            .into_iter()
            .filter(|f| f.driver == driver)
            .collect())
    }

    pub fn delete_plugin_fact(&self, node_id: &str, driver: &str) -> StateResult<bool> {
        self.delete_key(PLUGINS, &format!("{node_id}:{driver}"))
    }

    /// Delete every fact reported by a node. Returns number deleted.
    pub fn delete_plugin_facts_for_node(&self, node_id: &str) -> StateResult<u32> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let count;
        {
            let mut table = txn.open_table(PLUGINS).map_err(map_err!(Table))?;
            // Node IDs may contain ':', so match on the decoded fact, not the key.
            let keys: Vec<String> = table
                .iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| {
                    let (key, value) = entry.ok()?;
                    let fact: PluginFact = serde_json::from_slice(value.value()).ok()?;
                    (fact.node_id == node_id).then(|| key.value().to_string())
                })
                .collect();
            count = keys.len() as u32;
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(count)
    }

    // ── Tasks ──────────────────────────────────────────────────────

    pub fn put_task(&self, task: &TaskRecord) -> StateResult<()> {
        self.put_json(TASKS, &task.id, task)
    }

    pub fn get_task(&self, task_id: &str) -> StateResult<Option<TaskRecord>> {
        self.get_json(TASKS, task_id)
    }

    pub fn list_tasks(&self) -> StateResult<Vec<TaskRecord>> {
        self.list_json(TASKS)
    }

    /// Read-modify-write a task. Bumps `version` and `updated_at` on change.
    pub fn update_task<R, E>(
        &self,
        task_id: &str,
        f: impl FnOnce(&mut TaskRecord) -> Result<R, E>,
    ) -> Result<Updated<TaskRecord, R>, E>
    where
        E: From<StateError>,
    {
        self.update_json(TASKS, task_id, f, |t: &mut TaskRecord| {
            t.version += 1;
            t.updated_at = epoch_secs();
        })
    }

    pub fn delete_task(&self, task_id: &str) -> StateResult<bool> {
        self.delete_key(TASKS, task_id)
    }
}

/// Current Unix epoch in seconds.
pub(crate) fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

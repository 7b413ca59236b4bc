//! Durable key/value tables
//!
//! The queue persists task records through the `DurableStore` seam. A
//! write becomes durable only after `sync` returns; the queue never
//! publishes an event for a mutation that has not been synced. The sled
//! implementation backs production; the in-memory implementation backs
//! tests.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::RwLock;

use crate::error::{HubError, Result};

/// Active (queued/assigned) task records, keyed by task id.
pub const TASKS_ACTIVE: &str = "tasks_active";
/// Dead-lettered task records, keyed by task id. Kept separate so the
/// active table stays compact.
pub const TASKS_DEAD: &str = "tasks_dead";

/// Per-table atomic single-key writes plus an explicit durability
/// barrier. `fold` visits every record in a table, in key order.
pub trait DurableStore: Send + Sync {
    fn put(&self, table: &str, key: &str, value: &[u8]) -> Result<()>;

    /// Durability barrier: returns only once previous writes to the
    /// table survive a crash.
    fn sync(&self, table: &str) -> Result<()>;

    fn get(&self, table: &str, key: &str) -> Result<Option<Vec<u8>>>;

    fn delete(&self, table: &str, key: &str) -> Result<()>;

    fn fold(&self, table: &str, visit: &mut dyn FnMut(&str, &[u8])) -> Result<()>;

    fn len(&self, table: &str) -> Result<usize>;

    fn is_empty(&self, table: &str) -> Result<bool> {
        Ok(self.len(table)? == 0)
    }
}

/// sled-backed store; one sled tree per logical table
///
/// Opening the database takes a directory lock, so a second hub started
/// against the same data dir fails at startup instead of corrupting
/// state.
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        Ok(Self { db })
    }

    fn tree(&self, table: &str) -> Result<sled::Tree> {
        Ok(self.db.open_tree(table)?)
    }
}

impl DurableStore for SledStore {
    fn put(&self, table: &str, key: &str, value: &[u8]) -> Result<()> {
        self.tree(table)?.insert(key.as_bytes(), value)?;
        Ok(())
    }

    fn sync(&self, table: &str) -> Result<()> {
        self.tree(table)?.flush()?;
        Ok(())
    }

    fn get(&self, table: &str, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.tree(table)?.get(key.as_bytes())?.map(|v| v.to_vec()))
    }

    fn delete(&self, table: &str, key: &str) -> Result<()> {
        self.tree(table)?.remove(key.as_bytes())?;
        Ok(())
    }

    fn fold(&self, table: &str, visit: &mut dyn FnMut(&str, &[u8])) -> Result<()> {
        for entry in self.tree(table)?.iter() {
            let (key, value) = entry?;
            let key = std::str::from_utf8(&key)
                .map_err(|e| HubError::Internal(anyhow::anyhow!("non-utf8 storage key: {e}")))?;
            visit(key, &value);
        }
        Ok(())
    }

    fn len(&self, table: &str) -> Result<usize> {
        Ok(self.tree(table)?.len())
    }
}

/// In-memory store for tests; `sync` is a no-op
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<BTreeMap<String, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DurableStore for MemoryStore {
    fn put(&self, table: &str, key: &str, value: &[u8]) -> Result<()> {
        let mut tables = self.tables.write().expect("store poisoned");
        tables
            .entry(table.to_string())
            .or_default()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn sync(&self, _table: &str) -> Result<()> {
        Ok(())
    }

    fn get(&self, table: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let tables = self.tables.read().expect("store poisoned");
        Ok(tables.get(table).and_then(|t| t.get(key)).cloned())
    }

    fn delete(&self, table: &str, key: &str) -> Result<()> {
        let mut tables = self.tables.write().expect("store poisoned");
        if let Some(t) = tables.get_mut(table) {
            t.remove(key);
        }
        Ok(())
    }

    fn fold(&self, table: &str, visit: &mut dyn FnMut(&str, &[u8])) -> Result<()> {
        let tables = self.tables.read().expect("store poisoned");
        if let Some(t) = tables.get(table) {
            for (key, value) in t.iter() {
                visit(key, value);
            }
        }
        Ok(())
    }

    fn len(&self, table: &str) -> Result<usize> {
        let tables = self.tables.read().expect("store poisoned");
        Ok(tables.get(table).map(|t| t.len()).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise_store(store: &dyn DurableStore) {
        store.put(TASKS_ACTIVE, "t-1", b"one").unwrap();
        store.put(TASKS_ACTIVE, "t-2", b"two").unwrap();
        store.sync(TASKS_ACTIVE).unwrap();

        assert_eq!(store.get(TASKS_ACTIVE, "t-1").unwrap().unwrap(), b"one");
        assert_eq!(store.len(TASKS_ACTIVE).unwrap(), 2);
        assert!(store.get(TASKS_DEAD, "t-1").unwrap().is_none());

        let mut seen = Vec::new();
        store
            .fold(TASKS_ACTIVE, &mut |key, _| seen.push(key.to_string()))
            .unwrap();
        assert_eq!(seen, vec!["t-1", "t-2"]);

        store.delete(TASKS_ACTIVE, "t-1").unwrap();
        assert!(store.get(TASKS_ACTIVE, "t-1").unwrap().is_none());
        assert_eq!(store.len(TASKS_ACTIVE).unwrap(), 1);
    }

    #[test]
    fn test_memory_store() {
        exercise_store(&MemoryStore::new());
    }

    #[test]
    fn test_sled_store() {
        let dir = tempfile::tempdir().unwrap();
        exercise_store(&SledStore::open(dir.path()).unwrap());
    }

    #[test]
    fn test_sled_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SledStore::open(dir.path()).unwrap();
            store.put(TASKS_ACTIVE, "t-1", b"persisted").unwrap();
            store.sync(TASKS_ACTIVE).unwrap();
        }
        let store = SledStore::open(dir.path()).unwrap();
        assert_eq!(
            store.get(TASKS_ACTIVE, "t-1").unwrap().unwrap(),
            b"persisted"
        );
    }
}

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::database_ops::store::{CatalogStore, Fields, StorageError, StoreTx, StoredRecord};
use crate::normalization::entity::EntityKind;

#[derive(Default)]
struct Tables {
    schema_ready: bool,
    rows: HashMap<(EntityKind, i64), StoredRecord>,
    rejected: HashSet<(EntityKind, i64)>,
}

/// In-process store used for `--dry-run` and tests. Writes are staged per
/// transaction and only become visible on commit.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        // A poisoned lock only means another test thread panicked mid-write.
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make every write touching `(kind, id)` fail.
    pub fn reject_writes_for(&self, kind: EntityKind, id: i64) {
        self.lock().rejected.insert((kind, id));
    }

    pub fn get(&self, kind: EntityKind, id: i64) -> Option<StoredRecord> {
        self.lock().rows.get(&(kind, id)).cloned()
    }

    pub fn len(&self, kind: EntityKind) -> usize {
        self.lock().rows.keys().filter(|(k, _)| *k == kind).count()
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    type Tx = MemoryTx;

    async fn ensure_schema(&self) -> Result<(), StorageError> {
        self.lock().schema_ready = true;
        Ok(())
    }

    async fn begin(&self) -> Result<MemoryTx, StorageError> {
        if !self.lock().schema_ready {
            return Err(StorageError::Rejected("schema not initialised".into()));
        }
        Ok(MemoryTx {
            store: self.clone(),
            staged: HashMap::new(),
        })
    }

    async fn count(&self, kind: EntityKind) -> Result<i64, StorageError> {
        Ok(self.len(kind) as i64)
    }
}

pub struct MemoryTx {
    store: MemoryStore,
    staged: HashMap<(EntityKind, i64), StoredRecord>,
}

impl MemoryTx {
    fn check_writable(&self, kind: EntityKind, id: i64) -> Result<(), StorageError> {
        if self.store.lock().rejected.contains(&(kind, id)) {
            return Err(StorageError::Rejected(format!(
                "write refused for {} id={}",
                kind.table(),
                id
            )));
        }
        Ok(())
    }

    fn to_record(id: i64, fields: &Fields) -> StoredRecord {
        StoredRecord {
            id,
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        }
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn get_by_id(
        &mut self,
        kind: EntityKind,
        id: i64,
    ) -> Result<Option<StoredRecord>, StorageError> {
        if let Some(r) = self.staged.get(&(kind, id)) {
            return Ok(Some(r.clone()));
        }
        Ok(self.store.get(kind, id))
    }

    async fn insert(
        &mut self,
        kind: EntityKind,
        id: i64,
        fields: &Fields,
    ) -> Result<(), StorageError> {
        self.check_writable(kind, id)?;
        self.staged.insert((kind, id), Self::to_record(id, fields));
        Ok(())
    }

    async fn update(
        &mut self,
        kind: EntityKind,
        id: i64,
        fields: &Fields,
    ) -> Result<(), StorageError> {
        self.check_writable(kind, id)?;
        let exists = self.staged.contains_key(&(kind, id)) || self.store.get(kind, id).is_some();
        if !exists {
            return Err(StorageError::Rejected(format!(
                "{} id={} vanished before update",
                kind.table(),
                id
            )));
        }
        self.staged.insert((kind, id), Self::to_record(id, fields));
        Ok(())
    }

    async fn commit(self) -> Result<(), StorageError> {
        let mut tables = self.store.lock();
        tables.rows.extend(self.staged);
        Ok(())
    }

    async fn rollback(self) -> Result<(), StorageError> {
        Ok(())
    }
}

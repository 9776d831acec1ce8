use std::error::Error as StdError;

use async_trait::async_trait;
use indexmap::IndexMap;

use crate::normalization::entity::EntityKind;

/// Column → value, in schema order, excluding `id`.
pub type Fields = IndexMap<&'static str, String>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage backend error: {context}")]
    Backend {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },

    #[error("storage rejected operation: {0}")]
    Rejected(String),
}

impl StorageError {
    pub fn backend(
        context: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            context: context.into(),
            source: Box::new(source),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub id: i64,
    pub fields: IndexMap<String, String>,
}

/// Upsert-capable relational store. One table per [`EntityKind`].
#[async_trait]
pub trait CatalogStore: Send + Sync + 'static {
    type Tx: StoreTx;

    /// Idempotent; called once before the first pass.
    async fn ensure_schema(&self) -> Result<(), StorageError>;

    async fn begin(&self) -> Result<Self::Tx, StorageError>;

    async fn count(&self, kind: EntityKind) -> Result<i64, StorageError>;
}

/// An open all-or-nothing unit of work. Dropping without `commit` discards it.
#[async_trait]
pub trait StoreTx: Send {
    async fn get_by_id(
        &mut self,
        kind: EntityKind,
        id: i64,
    ) -> Result<Option<StoredRecord>, StorageError>;

    async fn insert(&mut self, kind: EntityKind, id: i64, fields: &Fields)
        -> Result<(), StorageError>;

    /// Overwrites every given column; `id` itself is never written.
    async fn update(&mut self, kind: EntityKind, id: i64, fields: &Fields)
        -> Result<(), StorageError>;

    async fn commit(self) -> Result<(), StorageError>;

    async fn rollback(self) -> Result<(), StorageError>;
}

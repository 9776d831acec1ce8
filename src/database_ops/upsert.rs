use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::database_ops::store::{CatalogStore, StorageError, StoreTx};
use crate::normalization::entity::NormalizedEntity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Insert-or-replace by identifier, one transaction per entity.
pub struct UpsertSink<S: CatalogStore> {
    store: Arc<S>,
}

impl<S: CatalogStore> Clone for UpsertSink<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: CatalogStore> UpsertSink<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    #[instrument(level = "debug", skip(self, entity), fields(kind = %entity.kind, id = entity.id))]
    pub async fn upsert(&self, entity: &NormalizedEntity) -> Result<UpsertOutcome, StorageError> {
        let mut tx = self.store.begin().await?;
        match write(&mut tx, entity).await {
            Ok(outcome) => {
                tx.commit().await?;
                debug!(target: "upsert", kind = %entity.kind, id = entity.id, ?outcome, "committed");
                Ok(outcome)
            }
            Err(err) => {
                if let Err(rb) = tx.rollback().await {
                    warn!(target: "upsert", kind = %entity.kind, id = entity.id, error = %rb, "rollback failed");
                }
                Err(err)
            }
        }
    }
}

async fn write<T: StoreTx>(tx: &mut T, entity: &NormalizedEntity) -> Result<UpsertOutcome, StorageError> {
    match tx.get_by_id(entity.kind, entity.id).await? {
        Some(_) => {
            tx.update(entity.kind, entity.id, &entity.fields).await?;
            Ok(UpsertOutcome::Updated)
        }
        None => {
            tx.insert(entity.kind, entity.id, &entity.fields).await?;
            Ok(UpsertOutcome::Inserted)
        }
    }
}

use async_trait::async_trait;
use indexmap::IndexMap;
use sqlx::{Postgres, QueryBuilder, Row, Transaction};
use tracing::{info, instrument};

use crate::database_ops::store::{CatalogStore, Fields, StorageError, StoreTx, StoredRecord};
use crate::normalization::entity::EntityKind;
use crate::util::db::Db;

pub(crate) fn create_table_sql(kind: EntityKind) -> String {
    let cols: Vec<String> = kind
        .columns()
        .map(|c| format!("{c} TEXT NOT NULL"))
        .collect();
    format!(
        "CREATE TABLE IF NOT EXISTS {} (id BIGINT PRIMARY KEY, {})",
        kind.table(),
        cols.join(", ")
    )
}

fn backend(context: &str) -> impl FnOnce(sqlx::Error) -> StorageError + '_ {
    move |e| StorageError::backend(context, e)
}

/// PostgreSQL-backed [`CatalogStore`].
#[derive(Clone)]
pub struct PgStore {
    db: Db,
}

impl PgStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CatalogStore for PgStore {
    type Tx = PgTx;

    #[instrument(skip(self))]
    async fn ensure_schema(&self) -> Result<(), StorageError> {
        for kind in EntityKind::PASS_ORDER {
            let ddl = create_table_sql(kind);
            sqlx::raw_sql(&ddl)
                .execute(&self.db.pool)
                .await
                .map_err(backend("ensure_schema"))?;
            info!(table = kind.table(), "table ready");
        }
        Ok(())
    }

    async fn begin(&self) -> Result<PgTx, StorageError> {
        let tx = self.db.pool.begin().await.map_err(backend("begin"))?;
        Ok(PgTx { tx })
    }

    async fn count(&self, kind: EntityKind) -> Result<i64, StorageError> {
        let sql = format!("SELECT COUNT(*) FROM {}", kind.table());
        sqlx::query_scalar::<_, i64>(&sql)
            .persistent(false)
            .fetch_one(&self.db.pool)
            .await
            .map_err(backend("count"))
    }
}

pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTx for PgTx {
    async fn get_by_id(
        &mut self,
        kind: EntityKind,
        id: i64,
    ) -> Result<Option<StoredRecord>, StorageError> {
        let cols: Vec<&str> = kind.columns().collect();
        let sql = format!(
            "SELECT id, {} FROM {} WHERE id = $1 FOR UPDATE",
            cols.join(", "),
            kind.table()
        );
        let row = sqlx::query(&sql)
            .persistent(false)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(backend("get_by_id"))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut fields = IndexMap::with_capacity(cols.len());
        for col in cols {
            let v: String = row.try_get(col).map_err(backend("get_by_id decode"))?;
            fields.insert(col.to_string(), v);
        }
        Ok(Some(StoredRecord { id, fields }))
    }

    async fn insert(
        &mut self,
        kind: EntityKind,
        id: i64,
        fields: &Fields,
    ) -> Result<(), StorageError> {
        let mut qb: QueryBuilder<'_, Postgres> =
            QueryBuilder::new(format!("INSERT INTO {} (id", kind.table()));
        for col in fields.keys() {
            qb.push(", ").push(*col);
        }
        qb.push(") VALUES (").push_bind(id);
        for value in fields.values() {
            qb.push(", ").push_bind(value.as_str());
        }
        qb.push(") ON CONFLICT (id) DO UPDATE SET ");
        // Duplicate IDs racing within one chunk: last writer wins.
        let mut sep = qb.separated(", ");
        for col in fields.keys() {
            sep.push(format!("{col} = EXCLUDED.{col}"));
        }
        qb.build()
            .persistent(false)
            .execute(&mut *self.tx)
            .await
            .map_err(backend("insert"))?;
        Ok(())
    }

    async fn update(
        &mut self,
        kind: EntityKind,
        id: i64,
        fields: &Fields,
    ) -> Result<(), StorageError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut qb: QueryBuilder<'_, Postgres> =
            QueryBuilder::new(format!("UPDATE {} SET ", kind.table()));
        let mut sep = qb.separated(", ");
        for (col, value) in fields {
            sep.push(format!("{col} = "));
            sep.push_bind_unseparated(value.as_str());
        }
        qb.push(" WHERE id = ").push_bind(id);
        let done = qb
            .build()
            .persistent(false)
            .execute(&mut *self.tx)
            .await
            .map_err(backend("update"))?;
        if done.rows_affected() == 0 {
            return Err(StorageError::Rejected(format!(
                "{} id={} vanished before update",
                kind.table(),
                id
            )));
        }
        Ok(())
    }

    async fn commit(self) -> Result<(), StorageError> {
        self.tx.commit().await.map_err(backend("commit"))
    }

    async fn rollback(self) -> Result<(), StorageError> {
        self.tx.rollback().await.map_err(backend("rollback"))
    }
}

//! Postgres-backed item store.
//!
//! ## Error Mapping
//!
//! SQLx errors are mapped to `StoreError` as follows:
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database | `40001` | `Throttled` | Serialization failure |
//! | Database | `40P01` | `Throttled` | Deadlock detected |
//! | Database | `53300` | `Throttled` | Too many connections |
//! | Database | `55P03` | `Throttled` | Lock not available |
//! | Database | `57014` | `Throttled` | Statement timeout / query canceled |
//! | Database (other) | Any other | `Backend` | Other database errors |
//! | PoolTimedOut | N/A | `Throttled` | No connection available in time |
//! | PoolClosed | N/A | `Backend` | Connection pool was closed |
//! | Other | N/A | `Backend` | Network errors, connection failures, etc. |
//!
//! ## Schema
//!
//! ```sql
//! CREATE TABLE delay_queue_items (
//!     id            TEXT PRIMARY KEY,
//!     partition_key INT NOT NULL,
//!     scheduled_at  BIGINT NOT NULL,
//!     job_type      TEXT NOT NULL,
//!     payload       JSONB NOT NULL,
//!     claim_marker  BIGINT NOT NULL DEFAULT 0,
//!     claimed_at    BIGINT,
//!     created_at    TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//! CREATE INDEX delay_queue_items_ready_idx
//!     ON delay_queue_items (partition_key, claim_marker, scheduled_at);
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Row};
use tracing::{Span, instrument};

use deferq_core::{CLAIMED, DelayQueueItem, ItemId, UNCLAIMED, now_unix};

use super::r#trait::{CounterField, ItemStore, StoreError};

const CREATE_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS delay_queue_items (
        id            TEXT PRIMARY KEY,
        partition_key INT NOT NULL,
        scheduled_at  BIGINT NOT NULL,
        job_type      TEXT NOT NULL,
        payload       JSONB NOT NULL,
        claim_marker  BIGINT NOT NULL DEFAULT 0,
        claimed_at    BIGINT,
        created_at    TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
"#;

/// Tables created before claim stamps existed.
const ADD_CLAIMED_AT: &str = r#"
    ALTER TABLE delay_queue_items ADD COLUMN IF NOT EXISTS claimed_at BIGINT
"#;

const CREATE_READY_INDEX: &str = r#"
    CREATE INDEX IF NOT EXISTS delay_queue_items_ready_idx
        ON delay_queue_items (partition_key, claim_marker, scheduled_at)
"#;

const SELECT_COLUMNS: &str =
    "id, partition_key, scheduled_at, job_type, payload, claim_marker, claimed_at, created_at";

/// Postgres-backed delay queue item store.
///
/// Uses the SQLx connection pool, so the store is `Send + Sync` and cheap to
/// clone. The claim is a single conditional `UPDATE`; Postgres row locking
/// makes it atomic across any number of dispatch processes.
#[derive(Debug, Clone)]
pub struct PostgresItemStore {
    pool: Arc<PgPool>,
}

impl PostgresItemStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Connect with a default-sized pool.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Items with the given marker whose `order_column < before`, ascending.
    async fn select_range(
        &self,
        operation: &'static str,
        partition: i32,
        claim_marker: i64,
        order_column: &'static str,
        before: i64,
        limit: usize,
    ) -> Result<Vec<DelayQueueItem>, StoreError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM delay_queue_items \
             WHERE partition_key = $1 AND claim_marker = $2 AND {order_column} < $3 \
             ORDER BY {order_column} ASC, id ASC \
             LIMIT $4"
        );

        let rows = sqlx::query(&sql)
            .bind(partition)
            .bind(claim_marker)
            .bind(before)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            let item = ItemRow::from_row(&row).map_err(|e| {
                StoreError::InvalidRecord(format!("failed to deserialize item row: {e}"))
            })?;
            items.push(item.into());
        }

        Span::current().record("item_count", items.len());
        Ok(items)
    }
}

#[async_trait]
impl ItemStore for PostgresItemStore {
    #[instrument(
        skip(self, item),
        fields(item_id = %item.id(), job_type = item.job_type(), scheduled_at = item.scheduled_at()),
        err
    )]
    async fn put(&self, item: &DelayQueueItem) -> Result<(), StoreError> {
        // Existing ids are left alone so a replayed put cannot reset a claim.
        sqlx::query(
            r#"
            INSERT INTO delay_queue_items (
                id,
                partition_key,
                scheduled_at,
                job_type,
                payload,
                claim_marker,
                claimed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(item.id().as_str())
        .bind(item.partition_key())
        .bind(item.scheduled_at())
        .bind(item.job_type())
        .bind(item.payload())
        .bind(item.claim_marker())
        .bind(item.claimed_at())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("put", e))?;

        Ok(())
    }

    #[instrument(skip(self), fields(item_id = %id, found = tracing::field::Empty), err)]
    async fn get(&self, id: &ItemId) -> Result<Option<DelayQueueItem>, StoreError> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM delay_queue_items WHERE id = $1");

        let row = sqlx::query(&sql)
            .bind(id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        let span = Span::current();
        match row {
            Some(row) => {
                let item = ItemRow::from_row(&row).map_err(|e| {
                    StoreError::InvalidRecord(format!("failed to deserialize item row: {e}"))
                })?;
                span.record("found", true);
                Ok(Some(item.into()))
            }
            None => {
                span.record("found", false);
                Ok(None)
            }
        }
    }

    #[instrument(skip(self), fields(item_id = %id), err)]
    async fn delete(&self, id: &ItemId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM delay_queue_items WHERE id = $1")
            .bind(id.as_str())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete", e))?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(item_count = tracing::field::Empty), err)]
    async fn query_ready(
        &self,
        partition: i32,
        before: i64,
        limit: usize,
    ) -> Result<Vec<DelayQueueItem>, StoreError> {
        self.select_range("query_ready", partition, UNCLAIMED, "scheduled_at", before, limit)
            .await
    }

    #[instrument(skip(self), fields(item_count = tracing::field::Empty), err)]
    async fn query_claimed(
        &self,
        partition: i32,
        before: i64,
        limit: usize,
    ) -> Result<Vec<DelayQueueItem>, StoreError> {
        self.select_range("query_claimed", partition, CLAIMED, "claimed_at", before, limit)
            .await
    }

    #[instrument(skip(self), fields(item_id = %id, won = tracing::field::Empty), err)]
    async fn conditional_increment(
        &self,
        id: &ItemId,
        field: CounterField,
        expected: i64,
        new: i64,
    ) -> Result<bool, StoreError> {
        let sql = format!(
            "UPDATE delay_queue_items SET {col} = $3, {stamp} = $4 WHERE id = $1 AND {col} = $2",
            col = field.column(),
            stamp = field.stamp_column()
        );
        let stamp = (new != UNCLAIMED).then(now_unix);

        let result = sqlx::query(&sql)
            .bind(id.as_str())
            .bind(expected)
            .bind(new)
            .bind(stamp)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("conditional_increment", e))?;

        let won = result.rows_affected() == 1;
        Span::current().record("won", won);
        Ok(won)
    }

    #[instrument(skip(self), err)]
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in [CREATE_TABLE, ADD_CLAIMED_AT, CREATE_READY_INDEX] {
            match sqlx::query(statement).execute(&*self.pool).await {
                Ok(_) => {}
                // Concurrent bootstraps can still race on the catalog.
                Err(e) if is_already_exists(&e) => {
                    tracing::debug!("schema object already exists");
                }
                Err(e) => return Err(map_sqlx_error("ensure_schema", e)),
            }
        }
        Ok(())
    }
}

/// Map SQLx errors to `StoreError`.
fn map_sqlx_error(operation: &'static str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let throttled = db_err
                .code()
                .map(|code| is_throttle_code(code.as_ref()))
                .unwrap_or(false);

            if throttled {
                StoreError::Throttled { operation }
            } else {
                StoreError::backend(operation, format!("database error: {}", db_err.message()))
            }
        }
        sqlx::Error::PoolTimedOut => StoreError::Throttled { operation },
        sqlx::Error::PoolClosed => StoreError::backend(operation, "connection pool closed"),
        _ => StoreError::backend(operation, format!("sqlx error: {err}")),
    }
}

fn is_throttle_code(code: &str) -> bool {
    matches!(code, "40001" | "40P01" | "53300" | "55P03" | "57014")
}

/// `42P07` duplicate_table, `23505` on the pg_type catalog for racing creates.
fn is_already_exists(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return matches!(code.as_ref(), "42P07" | "23505");
        }
    }
    false
}

// SQLx row types

#[derive(Debug)]
struct ItemRow {
    id: String,
    partition_key: i32,
    scheduled_at: i64,
    job_type: String,
    payload: serde_json::Value,
    claim_marker: i64,
    claimed_at: Option<i64>,
    #[allow(dead_code)]
    created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for ItemRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(ItemRow {
            id: row.try_get("id")?,
            partition_key: row.try_get("partition_key")?,
            scheduled_at: row.try_get("scheduled_at")?,
            job_type: row.try_get("job_type")?,
            payload: row.try_get("payload")?,
            claim_marker: row.try_get("claim_marker")?,
            claimed_at: row.try_get("claimed_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl From<ItemRow> for DelayQueueItem {
    fn from(row: ItemRow) -> Self {
        DelayQueueItem::from_parts(
            ItemId::from_stored(row.id),
            row.scheduled_at,
            row.job_type,
            row.payload,
            row.claim_marker,
            row.partition_key,
        )
        .with_claimed_at(row.claimed_at)
    }
}

//! Postgres warehouse over `sqlx`.

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use tracing::{debug, info};
use uaw_core::{StagingRecord, WarehouseCounts};

use crate::{PromotionTx, StorageError, Warehouse};

/// Rows per multi-row INSERT; 6 binds each keeps well under the 65535 limit.
const STAGING_INSERT_CHUNK: usize = 5_000;

#[derive(Debug, Clone)]
pub struct PgWarehouse {
    pool: PgPool,
}

impl PgWarehouse {
    pub async fn connect_with(
        options: PgConnectOptions,
        max_connections: u32,
    ) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `staging` and `marts` schemas if they are missing.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("warehouse migrations applied");
        Ok(())
    }
}

#[async_trait]
impl Warehouse for PgWarehouse {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn append_staging(&self, rows: &[StagingRecord]) -> Result<u64, StorageError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for chunk in rows.chunks(STAGING_INSERT_CHUNK) {
            let mut builder = QueryBuilder::<Postgres>::new(
                r#"INSERT INTO staging.stg_logs (user_id, action_type, "timestamp", device, location, load_ts) "#,
            );
            builder.push_values(chunk, |mut b, row| {
                b.push_bind(&row.user_id)
                    .push_bind(&row.action_type)
                    .push_bind(row.timestamp)
                    .push_bind(&row.device)
                    .push_bind(&row.location)
                    .push_bind(row.load_ts);
            });
            inserted += builder.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;

        debug!(rows = inserted, "appended rows to staging.stg_logs");
        Ok(inserted)
    }

    async fn begin_promotion(&self) -> Result<Box<dyn PromotionTx>, StorageError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgPromotionTx { tx }))
    }

    async fn counts(&self) -> Result<WarehouseCounts, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT (SELECT COUNT(*) FROM staging.stg_logs) AS staging_rows,
                   (SELECT COUNT(*) FROM staging.stg_logs WHERE is_processed = FALSE) AS unprocessed_rows,
                   (SELECT COUNT(*) FROM marts.dim_users) AS dim_users,
                   (SELECT COUNT(*) FROM marts.dim_actions) AS dim_actions,
                   (SELECT COUNT(*) FROM marts.fact_user_actions) AS facts
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(WarehouseCounts {
            staging_rows: row.try_get("staging_rows")?,
            unprocessed_rows: row.try_get("unprocessed_rows")?,
            dim_users: row.try_get("dim_users")?,
            dim_actions: row.try_get("dim_actions")?,
            facts: row.try_get("facts")?,
        })
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

struct PgPromotionTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl PromotionTx for PgPromotionTx {
    async fn claim_unprocessed(&mut self) -> Result<Vec<i64>, StorageError> {
        let ids = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT stg_id
              FROM staging.stg_logs
             WHERE is_processed = FALSE
             ORDER BY stg_id
               FOR UPDATE SKIP LOCKED
            "#,
        )
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(ids)
    }

    // dimension inserts are sorted so overlapping promotions take unique-index
    // locks in the same order
    async fn upsert_dim_users(&mut self, claimed: &[i64]) -> Result<u64, StorageError> {
        let result = sqlx::query(
            r#"
            INSERT INTO marts.dim_users (user_id)
            SELECT DISTINCT s.user_id
              FROM staging.stg_logs s
             WHERE s.stg_id = ANY($1)
             ORDER BY 1
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(claimed)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn upsert_dim_actions(&mut self, claimed: &[i64]) -> Result<u64, StorageError> {
        let result = sqlx::query(
            r#"
            INSERT INTO marts.dim_actions (action_type)
            SELECT DISTINCT s.action_type
              FROM staging.stg_logs s
             WHERE s.stg_id = ANY($1)
             ORDER BY 1
            ON CONFLICT (action_type) DO NOTHING
            "#,
        )
        .bind(claimed)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn insert_facts(&mut self, claimed: &[i64]) -> Result<Vec<i64>, StorageError> {
        let promoted = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO marts.fact_user_actions
                   (stg_id, user_key, action_key, event_timestamp, device, location)
            SELECT s.stg_id, u.user_key, a.action_key, s."timestamp", s.device, s.location
              FROM staging.stg_logs s
              JOIN marts.dim_users u ON s.user_id = u.user_id
              JOIN marts.dim_actions a ON s.action_type = a.action_type
             WHERE s.stg_id = ANY($1)
               AND s."timestamp" IS NOT NULL
            RETURNING stg_id
            "#,
        )
        .bind(claimed)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(promoted)
    }

    async fn count_null_fact_keys(&mut self) -> Result<i64, StorageError> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
              FROM marts.fact_user_actions
             WHERE event_timestamp IS NULL OR user_key IS NULL OR action_key IS NULL
            "#,
        )
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(count)
    }

    async fn mark_processed(&mut self, promoted: &[i64]) -> Result<u64, StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE staging.stg_logs
               SET is_processed = TRUE
             WHERE stg_id = ANY($1)
               AND is_processed = FALSE
            "#,
        )
        .bind(promoted)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

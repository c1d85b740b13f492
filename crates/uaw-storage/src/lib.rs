//! Warehouse storage sessions (Postgres + in-memory) and file-side helpers.

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use uaw_core::{PromotionStep, StagingRecord, WarehouseCounts};

pub mod files;
pub mod memory;
pub mod postgres;

pub use files::{
    archive_file_name, sha256_hex, ArchiveMover, ExtractionCommit, QuarantineMode, QuarantineSink,
};
pub use memory::InMemoryWarehouse;
pub use postgres::PgWarehouse;

pub const CRATE_NAME: &str = "uaw-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("{step} failed: {message}")]
    Step { step: PromotionStep, message: String },
    #[error("staging append failed: {0}")]
    Append(String),
    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json error on {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Explicitly constructed storage session shared by the extraction and
/// promotion runs.
#[async_trait]
pub trait Warehouse: Send + Sync {
    fn backend(&self) -> &'static str;

    /// Append cleaned rows to staging in a single unit of work. Rows always
    /// land with `is_processed = false`. Returns the inserted row count.
    async fn append_staging(&self, rows: &[StagingRecord]) -> Result<u64, StorageError>;

    /// Open the transaction every promotion step runs in. Dropping the
    /// returned value without committing rolls everything back.
    async fn begin_promotion(&self) -> Result<Box<dyn PromotionTx>, StorageError>;

    async fn counts(&self) -> Result<WarehouseCounts, StorageError>;

    async fn close(&self);
}

/// The statements of one promotion, in the order the promoter issues them.
///
/// Every method after `claim_unprocessed` is scoped to the claimed staging ids
/// so rows staged mid-transaction are left for the next run.
#[async_trait]
pub trait PromotionTx: Send {
    /// Lock and return unprocessed staging ids. Rows already locked by a
    /// concurrent promotion are skipped.
    async fn claim_unprocessed(&mut self) -> Result<Vec<i64>, StorageError>;

    /// Insert-if-absent into `dim_users`; returns the number of new rows.
    async fn upsert_dim_users(&mut self, claimed: &[i64]) -> Result<u64, StorageError>;

    /// Insert-if-absent into `dim_actions`; returns the number of new rows.
    async fn upsert_dim_actions(&mut self, claimed: &[i64]) -> Result<u64, StorageError>;

    /// Join claimed rows to their dimension keys and insert facts. Rows with
    /// no dimension match or a null timestamp are skipped. Returns the staging
    /// ids that received a fact row.
    async fn insert_facts(&mut self, claimed: &[i64]) -> Result<Vec<i64>, StorageError>;

    /// Count fact rows with a null timestamp or key, as seen by this transaction.
    async fn count_null_fact_keys(&mut self) -> Result<i64, StorageError>;

    async fn mark_processed(&mut self, promoted: &[i64]) -> Result<u64, StorageError>;

    async fn commit(self: Box<Self>) -> Result<(), StorageError>;

    async fn rollback(self: Box<Self>) -> Result<(), StorageError>;
}

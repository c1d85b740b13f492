//! Staging writer: land a cleaned batch, then release the consumed input.

use std::path::PathBuf;

use serde::Serialize;
use tracing::{debug, error};
use uaw_core::StagingRecord;
use uaw_storage::{ExtractionCommit, Warehouse};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum StagingOutcome {
    /// Nothing to append; the input was left where it is.
    EmptyBatch,
    Staged { rows: u64, archived_to: PathBuf },
}

pub struct StagingWriter<'a> {
    warehouse: &'a dyn Warehouse,
    commit: &'a dyn ExtractionCommit,
}

impl<'a> StagingWriter<'a> {
    pub fn new(warehouse: &'a dyn Warehouse, commit: &'a dyn ExtractionCommit) -> Self {
        Self { warehouse, commit }
    }

    /// Append the batch in one effort and fire the extraction commit exactly
    /// once on success. A failed append is surfaced without retrying and the
    /// input stays uncommitted for the next run.
    pub async fn write(&self, batch: &[StagingRecord]) -> Result<StagingOutcome> {
        if batch.is_empty() {
            debug!("no records to insert into staging table");
            return Ok(StagingOutcome::EmptyBatch);
        }

        let rows = self.warehouse.append_staging(batch).await.map_err(|err| {
            error!(
                error = %err,
                backend = self.warehouse.backend(),
                "failed to insert records into staging table; input left in place for retry"
            );
            err
        })?;
        debug!(rows, "inserted records into staging.stg_logs");

        let archived_to = self.commit.commit().await.map_err(|err| {
            // rows are staged but the input is still present: a rerun re-stages it
            error!(error = %err, rows, "staged batch but failed to archive input");
            err
        })?;

        Ok(StagingOutcome::Staged { rows, archived_to })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::Utc;
    use uaw_storage::{InMemoryWarehouse, StorageError};

    use crate::error::PipelineError;

    #[derive(Default)]
    struct CountingCommit {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ExtractionCommit for CountingCommit {
        async fn commit(&self) -> std::result::Result<PathBuf, StorageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(PathBuf::from("/archive/20260101_000000_raw_logs"))
        }
    }

    fn row(user: &str) -> StagingRecord {
        StagingRecord {
            user_id: user.to_string(),
            action_type: "view".to_string(),
            timestamp: Some(Utc::now()),
            device: None,
            location: None,
            load_ts: Utc::now(),
            is_processed: false,
        }
    }

    #[tokio::test]
    async fn empty_batch_is_a_noop_without_commit() {
        let warehouse = InMemoryWarehouse::new();
        let commit = CountingCommit::default();
        let outcome = StagingWriter::new(&warehouse, &commit).write(&[]).await.unwrap();

        assert_eq!(outcome, StagingOutcome::EmptyBatch);
        assert_eq!(commit.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn successful_append_commits_exactly_once() {
        let warehouse = InMemoryWarehouse::new();
        let commit = CountingCommit::default();
        let outcome = StagingWriter::new(&warehouse, &commit)
            .write(&[row("a"), row("b")])
            .await
            .unwrap();

        assert!(matches!(outcome, StagingOutcome::Staged { rows: 2, .. }));
        assert_eq!(commit.calls.load(Ordering::SeqCst), 1);
        assert_eq!(warehouse.staged_rows().await.len(), 2);
    }

    #[tokio::test]
    async fn failed_append_surfaces_and_skips_commit() {
        let warehouse = InMemoryWarehouse::new();
        warehouse.fail_appends(true).await;
        let commit = CountingCommit::default();
        let err = StagingWriter::new(&warehouse, &commit)
            .write(&[row("a")])
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Storage(StorageError::Append(_))));
        assert_eq!(commit.calls.load(Ordering::SeqCst), 0);
    }
}

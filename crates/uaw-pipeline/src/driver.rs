//! Pipeline driver: sequences extraction and promotion as two independently
//! callable runs, plus the optional cron schedule that chains them.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uaw_core::{RawRecord, WarehouseCounts};
use uaw_storage::{sha256_hex, ArchiveMover, PgWarehouse, QuarantineSink, Warehouse};
use uuid::Uuid;

use crate::clean::RecordCleaner;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::promote::{PromotionOutcome, Promoter};
use crate::staging::{StagingOutcome, StagingWriter};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtractionReport {
    pub run_id: Uuid,
    pub total: usize,
    pub staged: u64,
    pub quarantined: usize,
    pub dropped: usize,
    pub archived_to: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ExtractionOutcome {
    /// No input file at the configured path.
    NoInput,
    /// The input file holds an empty array; it is left in place.
    EmptyInput,
    /// Every record was quarantined or dropped; nothing staged, input kept.
    EmptyBatch(ExtractionReport),
    Completed(ExtractionReport),
}

/// What the top-level extraction entry point reports. Failures are logged
/// and folded into `Deferred`; the input stays put for the next run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ExtractionStatus {
    Finished(ExtractionOutcome),
    Deferred { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub extraction: ExtractionStatus,
    pub promotion: PromotionOutcome,
    pub load_attempts: u32,
}

/// Open the Postgres session described by `config`.
pub async fn connect_warehouse(config: &PipelineConfig) -> Result<PgWarehouse> {
    debug!(database = %config.database.redacted_url(), "connecting to warehouse");
    let warehouse = PgWarehouse::connect_with(
        config.database.connect_options(),
        config.database.max_connections,
    )
    .await?;
    Ok(warehouse)
}

#[derive(Clone)]
pub struct Pipeline {
    config: Arc<PipelineConfig>,
    warehouse: Arc<dyn Warehouse>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, warehouse: Arc<dyn Warehouse>) -> Self {
        Self {
            config: Arc::new(config),
            warehouse,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn warehouse(&self) -> &dyn Warehouse {
        self.warehouse.as_ref()
    }

    /// Read, clean, quarantine, and stage the current input file.
    pub async fn extract_and_stage(&self) -> Result<ExtractionOutcome> {
        let run_id = Uuid::new_v4();
        let span = info_span!("extract", %run_id, input = %self.config.data_path.display());
        self.extract_inner(run_id).instrument(span).await
    }

    async fn extract_inner(&self, run_id: Uuid) -> Result<ExtractionOutcome> {
        debug!("starting extract step");
        let Some(RawInput { records: raw, digest }) = read_raw_records(&self.config.data_path).await?
        else {
            debug!("no source file found; exiting");
            return Ok(ExtractionOutcome::NoInput);
        };
        if raw.is_empty() {
            warn!("input file is empty");
            return Ok(ExtractionOutcome::EmptyInput);
        }
        debug!(records = raw.len(), "raw data loaded");

        let total = raw.len();
        let batch = RecordCleaner::new(self.config.timestamp_policy).clean(raw, Utc::now());

        let sink = QuarantineSink::new(&self.config.quarantine_path, self.config.quarantine_mode);
        sink.write(&batch.quarantined, &digest).await?;

        let archive = ArchiveMover::new(&self.config.data_path, &self.config.archive_dir);
        let outcome = StagingWriter::new(self.warehouse.as_ref(), &archive)
            .write(&batch.staged)
            .await?;

        let mut report = ExtractionReport {
            run_id,
            total,
            staged: 0,
            quarantined: batch.quarantined.len(),
            dropped: batch.dropped.len(),
            archived_to: None,
        };
        match outcome {
            StagingOutcome::EmptyBatch => {
                info!(
                    quarantined = report.quarantined,
                    dropped = report.dropped,
                    "no valid records to stage"
                );
                Ok(ExtractionOutcome::EmptyBatch(report))
            }
            StagingOutcome::Staged { rows, archived_to } => {
                report.staged = rows;
                report.archived_to = Some(archived_to);
                info!(
                    staged = report.staged,
                    quarantined = report.quarantined,
                    dropped = report.dropped,
                    "extract step completed"
                );
                Ok(ExtractionOutcome::Completed(report))
            }
        }
    }

    /// Top-level extraction entry point; never propagates failures.
    pub async fn run_extract(&self) -> ExtractionStatus {
        match self.extract_and_stage().await {
            Ok(outcome) => ExtractionStatus::Finished(outcome),
            Err(err @ PipelineError::Storage(_)) => {
                error!(error = %err, "database error; file remains in source for retry");
                ExtractionStatus::Deferred {
                    error: err.to_string(),
                }
            }
            Err(err) => {
                error!(error = %err, "unexpected error during extraction");
                ExtractionStatus::Deferred {
                    error: err.to_string(),
                }
            }
        }
    }

    /// Promote every unprocessed staging row. Failures propagate.
    pub async fn run_load(&self) -> Result<PromotionOutcome> {
        Promoter::new(self.warehouse.as_ref()).promote().await
    }

    /// Extraction followed by promotion, retrying promotion per the
    /// scheduler settings.
    pub async fn run_cycle(&self) -> Result<CycleSummary> {
        let extraction = self.run_extract().await;

        let retries = self.config.scheduler.load_retries;
        let mut attempts = 0u32;
        let promotion = loop {
            attempts += 1;
            match self.run_load().await {
                Ok(outcome) => break outcome,
                Err(err) if attempts <= retries => {
                    warn!(
                        error = %err,
                        attempt = attempts,
                        retries,
                        "load failed; retrying after delay"
                    );
                    tokio::time::sleep(self.config.scheduler.retry_delay).await;
                }
                Err(err) => return Err(err),
            }
        };

        Ok(CycleSummary {
            extraction,
            promotion,
            load_attempts: attempts,
        })
    }

    pub async fn status(&self) -> Result<WarehouseCounts> {
        Ok(self.warehouse.counts().await?)
    }

    pub async fn close(&self) {
        self.warehouse.close().await;
    }

    pub async fn maybe_build_scheduler(&self) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler.enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new()
            .await
            .map_err(|err| PipelineError::Scheduler(err.to_string()))?;
        let pipeline = self.clone();
        let cron = self.config.scheduler.cron.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let pipeline = pipeline.clone();
            Box::pin(async move {
                match pipeline.run_cycle().await {
                    Ok(summary) => info!(
                        load_attempts = summary.load_attempts,
                        "scheduled pipeline cycle finished"
                    ),
                    Err(err) => error!(error = %err, "scheduled pipeline cycle failed"),
                }
            })
        })
        .map_err(|err| PipelineError::Scheduler(format!("cron `{cron}`: {err}")))?;
        sched
            .add(job)
            .await
            .map_err(|err| PipelineError::Scheduler(err.to_string()))?;
        Ok(Some(sched))
    }
}

/// One read of the input file.
#[derive(Debug, Clone, PartialEq)]
pub struct RawInput {
    pub records: Vec<RawRecord>,
    /// SHA-256 of the file bytes; identifies the input across re-reads.
    pub digest: String,
}

/// `Ok(None)` when the file does not exist.
pub async fn read_raw_records(path: &Path) -> Result<Option<RawInput>> {
    let exists = fs::try_exists(path).await.map_err(|source| PipelineError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if !exists {
        return Ok(None);
    }

    let bytes = fs::read(path).await.map_err(|source| PipelineError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let records: Vec<RawRecord> =
        serde_json::from_slice(&bytes).map_err(|source| PipelineError::InputFormat {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(Some(RawInput {
        records,
        digest: sha256_hex(&bytes),
    }))
}

//! User-activity ETL: extraction into staging and dimensional promotion
//! into the marts star schema.

pub mod clean;
pub mod config;
pub mod driver;
pub mod error;
pub mod logging;
pub mod promote;
pub mod staging;

pub use clean::{parse_timestamp, CleanedBatch, RecordCleaner, TimestampPolicy};
pub use config::{ConfigError, DatabaseConfig, PipelineConfig, SchedulerConfig};
pub use driver::{
    connect_warehouse, read_raw_records, CycleSummary, ExtractionOutcome, ExtractionReport,
    ExtractionStatus, Pipeline, RawInput,
};
pub use error::{PipelineError, Result};
pub use logging::{init_logging, LogGuards};
pub use promote::{PromotionOutcome, PromotionReport, Promoter};
pub use staging::{StagingOutcome, StagingWriter};

pub const CRATE_NAME: &str = "uaw-pipeline";

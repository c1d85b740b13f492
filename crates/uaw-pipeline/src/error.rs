use std::path::PathBuf;

use thiserror::Error;
use uaw_storage::StorageError;

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("input {} is not a JSON array of records: {source}", path.display())]
    InputFormat {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("scheduler error: {0}")]
    Scheduler(String),

    #[error("logging setup failed: {0}")]
    Logging(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

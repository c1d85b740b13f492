//! Console + error-log + debug-log subscriber setup.

use std::fs;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::{PipelineError, Result};

/// Debug-file directives: our crates at debug, dependencies at info.
const DEBUG_FILE_DIRECTIVES: &str = "info,uaw=debug,uaw_core=debug,uaw_storage=debug,uaw_pipeline=debug,uaw_cli=debug";

/// Keeps the file writers alive; drop it only at process exit so buffered
/// lines are flushed.
#[must_use]
pub struct LogGuards {
    _error: WorkerGuard,
    _debug: WorkerGuard,
}

pub fn init_logging(error_log_path: &Path, debug_log_path: &Path) -> Result<LogGuards> {
    let (error_writer, error_guard) = tracing_appender::non_blocking(open_appender(error_log_path)?);
    let (debug_writer, debug_guard) = tracing_appender::non_blocking(open_appender(debug_log_path)?);

    let error_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(error_writer)
        .with_filter(LevelFilter::ERROR);

    let debug_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(debug_writer)
        .with_filter(EnvFilter::new(DEBUG_FILE_DIRECTIVES));

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));

    tracing_subscriber::registry()
        .with(error_layer)
        .with(debug_layer)
        .with(console_layer)
        .try_init()
        .map_err(|err| PipelineError::Logging(err.to_string()))?;

    Ok(LogGuards {
        _error: error_guard,
        _debug: debug_guard,
    })
}

fn open_appender(path: &Path) -> Result<tracing_appender::rolling::RollingFileAppender> {
    let file_name = path.file_name().ok_or_else(|| {
        PipelineError::Logging(format!("log path {} has no file name", path.display()))
    })?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(|source| PipelineError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    Ok(tracing_appender::rolling::never(dir, file_name))
}

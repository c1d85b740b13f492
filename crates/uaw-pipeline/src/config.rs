//! Environment-driven configuration, validated once at startup.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use sqlx::postgres::PgConnectOptions;
use thiserror::Error;
use uaw_storage::QuarantineMode;

use crate::clean::TimestampPolicy;

/// Keys that must be present and non-blank before anything runs.
pub const REQUIRED_ENV_VARS: &[&str] = &[
    "DATA_PATH",
    "PROCESSED_PATH",
    "ERROR_RECORDS",
    "ERROR_LOG_PATH",
    "DEBUG_LOG_PATH",
    "DB_USER",
    "DB_PASSWORD",
    "DB_HOST",
    "DB_PORT",
];

pub const DEFAULT_DB_NAME: &str = "user_activity_analytics";
pub const DEFAULT_SCHEDULE_CRON: &str = "0 2 * * *";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variables: {}", .0.join(", "))]
    Missing(Vec<String>),
    #[error("invalid value for {key}: {message}")]
    Invalid { key: String, message: String },
}

#[derive(Clone)]
pub struct DatabaseConfig {
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub name: String,
    pub max_connections: u32,
}

impl DatabaseConfig {
    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.name)
    }

    /// Connection string with the password masked, for logs and status output.
    pub fn redacted_url(&self) -> String {
        format!(
            "postgresql://{}:***@{}:{}/{}",
            self.user, self.host, self.port, self.name
        )
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &self.redacted_url())
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub cron: String,
    pub load_retries: u32,
    pub retry_delay: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cron: DEFAULT_SCHEDULE_CRON.to_string(),
            load_retries: 1,
            retry_delay: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub data_path: PathBuf,
    pub archive_dir: PathBuf,
    pub quarantine_path: PathBuf,
    pub error_log_path: PathBuf,
    pub debug_log_path: PathBuf,
    pub database: DatabaseConfig,
    pub timestamp_policy: TimestampPolicy,
    pub quarantine_mode: QuarantineMode,
    pub scheduler: SchedulerConfig,
}

impl PipelineConfig {
    /// Load `.env` if present, then validate the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let missing: Vec<String> = REQUIRED_ENV_VARS
            .iter()
            .filter(|key| value(key).is_none())
            .map(|key| key.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }

        let required = |key: &str| value(key).ok_or_else(|| ConfigError::Missing(vec![key.to_string()]));

        let database = DatabaseConfig {
            user: required("DB_USER")?,
            // passwords may legitimately carry surrounding whitespace
            password: lookup("DB_PASSWORD").unwrap_or_default(),
            host: required("DB_HOST")?,
            port: parse_value("DB_PORT", &required("DB_PORT")?)?,
            name: value("DB_NAME").unwrap_or_else(|| DEFAULT_DB_NAME.to_string()),
            max_connections: value("DB_MAX_CONNECTIONS")
                .map(|v| parse_value("DB_MAX_CONNECTIONS", &v))
                .transpose()?
                .unwrap_or(5),
        };

        let timestamp_policy = value("INVALID_TIMESTAMP_POLICY")
            .map(|v| parse_value::<TimestampPolicy>("INVALID_TIMESTAMP_POLICY", &v))
            .transpose()?
            .unwrap_or_default();

        let quarantine_mode = value("QUARANTINE_MODE")
            .map(|v| parse_value::<QuarantineMode>("QUARANTINE_MODE", &v))
            .transpose()?
            .unwrap_or_default();

        let defaults = SchedulerConfig::default();
        let scheduler = SchedulerConfig {
            enabled: value("UAW_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.enabled),
            cron: value("UAW_SCHEDULE_CRON").unwrap_or(defaults.cron),
            load_retries: value("UAW_LOAD_RETRIES")
                .map(|v| parse_value("UAW_LOAD_RETRIES", &v))
                .transpose()?
                .unwrap_or(defaults.load_retries),
            retry_delay: value("UAW_RETRY_DELAY_SECS")
                .map(|v| parse_value("UAW_RETRY_DELAY_SECS", &v).map(Duration::from_secs))
                .transpose()?
                .unwrap_or(defaults.retry_delay),
        };

        Ok(Self {
            data_path: PathBuf::from(required("DATA_PATH")?),
            archive_dir: PathBuf::from(required("PROCESSED_PATH")?),
            quarantine_path: PathBuf::from(required("ERROR_RECORDS")?),
            error_log_path: PathBuf::from(required("ERROR_LOG_PATH")?),
            debug_log_path: PathBuf::from(required("DEBUG_LOG_PATH")?),
            database,
            timestamp_policy,
            quarantine_mode,
            scheduler,
        })
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    raw.parse().map_err(|err: T::Err| ConfigError::Invalid {
        key: key.to_string(),
        message: err.to_string(),
    })
}

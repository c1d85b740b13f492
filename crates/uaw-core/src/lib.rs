//! Core record model for the user-activity warehouse.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const CRATE_NAME: &str = "uaw-core";

/// Quarantine reason for records lacking either natural key.
pub const MISSING_IDENTITY_REASON: &str = "Missing user_id or action_type";

/// One element of the raw input array, kept untyped until validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRecord(pub Value);

impl RawRecord {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn as_object(&self) -> Option<&Map<String, Value>> {
        self.0.as_object()
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.0.as_object().and_then(|obj| obj.get(name))
    }

    /// Nested lookup, e.g. `metadata.device`.
    pub fn nested_field(&self, parent: &str, name: &str) -> Option<&Value> {
        self.field(parent)
            .and_then(Value::as_object)
            .and_then(|obj| obj.get(name))
    }

    /// Object view used when the record is written to quarantine. Non-object
    /// inputs are wrapped under `raw` so nothing is lost.
    pub fn into_object(self) -> Map<String, Value> {
        match self.0 {
            Value::Object(obj) => obj,
            other => {
                let mut obj = Map::new();
                obj.insert("raw".to_string(), other);
                obj
            }
        }
    }
}

/// Why a raw record was set aside instead of staged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuarantineReason {
    MissingIdentity,
    InvalidTimestamp,
    NotAnObject,
}

impl QuarantineReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingIdentity => MISSING_IDENTITY_REASON,
            Self::InvalidTimestamp => "Invalid timestamp",
            Self::NotAnObject => "Record is not a JSON object",
        }
    }
}

impl fmt::Display for QuarantineReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raw record annotated with the reason it failed validation.
///
/// Serializes as the original object with an extra `error_reason` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantinedRecord {
    #[serde(flatten)]
    pub record: Map<String, Value>,
    pub error_reason: String,
}

impl QuarantinedRecord {
    pub fn new(raw: RawRecord, reason: QuarantineReason) -> Self {
        let mut record = raw.into_object();
        // the annotation is authoritative; drop any stale reason from a re-fed file
        record.remove("error_reason");
        Self {
            record,
            error_reason: reason.as_str().to_string(),
        }
    }
}

/// Cleaned row destined for `staging.stg_logs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagingRecord {
    pub user_id: String,
    pub action_type: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub device: Option<String>,
    pub location: Option<String>,
    pub load_ts: DateTime<Utc>,
    #[serde(default)]
    pub is_processed: bool,
}

/// A staging row as persisted, carrying its surrogate id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedRow {
    pub stg_id: i64,
    pub record: StagingRecord,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimUser {
    pub user_key: i64,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimAction {
    pub action_key: i64,
    pub action_type: String,
}

/// Fact row; `stg_id` records which staging row it was promoted from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactUserAction {
    pub stg_id: i64,
    pub user_key: i64,
    pub action_key: i64,
    pub event_timestamp: DateTime<Utc>,
    pub device: Option<String>,
    pub location: Option<String>,
}

/// The ordered statements of one promotion transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PromotionStep {
    Claim,
    UpsertUsers,
    UpsertActions,
    InsertFacts,
    QualityCheck,
    MarkProcessed,
    Commit,
}

impl PromotionStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claim => "claim",
            Self::UpsertUsers => "upsert_dim_users",
            Self::UpsertActions => "upsert_dim_actions",
            Self::InsertFacts => "insert_fact_user_actions",
            Self::QualityCheck => "dq_check",
            Self::MarkProcessed => "mark_processed",
            Self::Commit => "commit",
        }
    }
}

impl fmt::Display for PromotionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of the post-load probe for fact rows missing a timestamp or key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DqReport {
    pub null_fact_keys: i64,
}

impl DqReport {
    pub fn passed(&self) -> bool {
        self.null_fact_keys == 0
    }
}

/// Row counts across staging and marts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WarehouseCounts {
    pub staging_rows: i64,
    pub unprocessed_rows: i64,
    pub dim_users: i64,
    pub dim_actions: i64,
    pub facts: i64,
}

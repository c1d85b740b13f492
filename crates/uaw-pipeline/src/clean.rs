//! Record validation and cleaning: raw input rows in, staging rows or
//! quarantined rows out.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use uaw_core::{QuarantineReason, QuarantinedRecord, RawRecord, StagingRecord};

/// What to do with a record whose timestamp cannot be parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestampPolicy {
    /// Log and discard; the record is counted in `CleanedBatch::dropped`.
    #[default]
    Drop,
    /// Route to the quarantine sink alongside missing-key records.
    Quarantine,
}

impl FromStr for TimestampPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drop" => Ok(Self::Drop),
            "quarantine" => Ok(Self::Quarantine),
            other => Err(format!("expected `drop` or `quarantine`, got `{other}`")),
        }
    }
}

impl fmt::Display for TimestampPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Drop => "drop",
            Self::Quarantine => "quarantine",
        })
    }
}

/// Partition of one input batch. Every raw record lands in exactly one field.
#[derive(Debug, Clone, Default)]
pub struct CleanedBatch {
    pub staged: Vec<StagingRecord>,
    pub quarantined: Vec<QuarantinedRecord>,
    pub dropped: Vec<RawRecord>,
}

impl CleanedBatch {
    pub fn total(&self) -> usize {
        self.staged.len() + self.quarantined.len() + self.dropped.len()
    }
}

enum Cleaned {
    Staged(StagingRecord),
    Quarantined(QuarantinedRecord),
    Dropped(RawRecord),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RecordCleaner {
    policy: TimestampPolicy,
}

impl RecordCleaner {
    pub fn new(policy: TimestampPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> TimestampPolicy {
        self.policy
    }

    /// Clean records in input order. `load_ts` is stamped on every staged row.
    pub fn clean(&self, raw: Vec<RawRecord>, load_ts: DateTime<Utc>) -> CleanedBatch {
        let input = raw.len();
        let mut batch = CleanedBatch::default();
        for record in raw {
            match self.clean_one(record, load_ts) {
                Cleaned::Staged(row) => batch.staged.push(row),
                Cleaned::Quarantined(row) => batch.quarantined.push(row),
                Cleaned::Dropped(row) => batch.dropped.push(row),
            }
        }
        debug!(
            input,
            staged = batch.staged.len(),
            quarantined = batch.quarantined.len(),
            dropped = batch.dropped.len(),
            "cleaned raw records"
        );
        batch
    }

    fn clean_one(&self, raw: RawRecord, load_ts: DateTime<Utc>) -> Cleaned {
        if raw.as_object().is_none() {
            debug!(record = %raw.0, "skipping non-object record");
            return Cleaned::Quarantined(QuarantinedRecord::new(raw, QuarantineReason::NotAnObject));
        }

        let (Some(user_id), Some(action_type)) = (
            identity_field(raw.field("user_id")),
            identity_field(raw.field("action_type")),
        ) else {
            debug!(record = %raw.0, "skipping record due to missing user_id or action_type");
            return Cleaned::Quarantined(QuarantinedRecord::new(
                raw,
                QuarantineReason::MissingIdentity,
            ));
        };

        let Some(timestamp) = raw
            .field("timestamp")
            .and_then(Value::as_str)
            .and_then(parse_timestamp)
        else {
            let shown = raw.field("timestamp").cloned().unwrap_or_default();
            warn!(
                user_id = %user_id,
                timestamp = %shown,
                policy = %self.policy,
                "invalid timestamp in record"
            );
            return match self.policy {
                TimestampPolicy::Drop => Cleaned::Dropped(raw),
                TimestampPolicy::Quarantine => Cleaned::Quarantined(QuarantinedRecord::new(
                    raw,
                    QuarantineReason::InvalidTimestamp,
                )),
            };
        };

        Cleaned::Staged(StagingRecord {
            user_id,
            action_type,
            timestamp: Some(timestamp),
            device: metadata_text(raw.nested_field("metadata", "device")),
            location: metadata_text(raw.nested_field("metadata", "location")),
            load_ts,
            is_processed: false,
        })
    }
}

/// Natural keys must be non-blank text; numeric ids are accepted as text.
/// Text keys are staged exactly as given.
fn identity_field(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn metadata_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Parse an event timestamp to an absolute instant. Values without an offset
/// are taken as UTC.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    for pattern in ["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f%z", "%Y-%m-%dT%H:%M:%S%.f%z"] {
        if let Ok(ts) = DateTime::parse_from_str(text, pattern) {
            return Some(ts.with_timezone(&Utc));
        }
    }

    let naive = text.strip_suffix('Z').unwrap_or(text);
    for pattern in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
    ] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(naive, pattern) {
            return Some(ts.and_utc());
        }
    }

    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|ts| ts.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn load_ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap()
    }

    fn raw(value: Value) -> RawRecord {
        RawRecord::new(value)
    }

    #[test]
    fn valid_record_lifts_metadata_and_stamps_load_ts() {
        let batch = RecordCleaner::default().clean(
            vec![raw(json!({
                "user_id": "u-1",
                "action_type": "login",
                "timestamp": "2024-03-01T10:15:00Z",
                "metadata": {"device": "ios", "location": "Berlin"}
            }))],
            load_ts(),
        );

        assert_eq!(batch.staged.len(), 1);
        let row = &batch.staged[0];
        assert_eq!(row.user_id, "u-1");
        assert_eq!(row.device.as_deref(), Some("ios"));
        assert_eq!(row.location.as_deref(), Some("Berlin"));
        assert_eq!(row.load_ts, load_ts());
        assert_eq!(
            row.timestamp,
            Utc.with_ymd_and_hms(2024, 3, 1, 10, 15, 0).single()
        );
        assert!(!row.is_processed);
    }

    #[test]
    fn missing_or_blank_identity_is_quarantined() {
        let batch = RecordCleaner::default().clean(
            vec![
                raw(json!({"action_type": "login", "timestamp": "2024-03-01"})),
                raw(json!({"user_id": "  ", "action_type": "login", "timestamp": "2024-03-01"})),
                raw(json!({"user_id": "u", "action_type": null, "timestamp": "2024-03-01"})),
            ],
            load_ts(),
        );
        assert!(batch.staged.is_empty());
        assert_eq!(batch.quarantined.len(), 3);
        assert!(batch
            .quarantined
            .iter()
            .all(|q| q.error_reason == "Missing user_id or action_type"));
    }

    #[test]
    fn unparseable_timestamp_follows_policy() {
        let input = || {
            vec![raw(json!({"user_id": "u", "action_type": "click", "timestamp": "yesterday-ish"}))]
        };

        let dropped = RecordCleaner::new(TimestampPolicy::Drop).clean(input(), load_ts());
        assert_eq!(dropped.dropped.len(), 1);
        assert!(dropped.quarantined.is_empty() && dropped.staged.is_empty());

        let quarantined = RecordCleaner::new(TimestampPolicy::Quarantine).clean(input(), load_ts());
        assert_eq!(quarantined.quarantined.len(), 1);
        assert_eq!(quarantined.quarantined[0].error_reason, "Invalid timestamp");
    }

    #[test]
    fn every_input_lands_in_exactly_one_bucket() {
        let input = vec![
            raw(json!({"user_id": "a", "action_type": "x", "timestamp": "2024-01-01 08:00:00"})),
            raw(json!({"user_id": "b", "action_type": "x"})),
            raw(json!({"user_id": "c"})),
            raw(json!(["not", "an", "object"])),
            raw(json!({"user_id": 17, "action_type": "y", "timestamp": "2024-01-02"})),
        ];
        let batch = RecordCleaner::default().clean(input, load_ts());
        assert_eq!(batch.total(), 5);
        assert_eq!(batch.staged.len(), 2);
        assert_eq!(batch.quarantined.len(), 2);
        assert_eq!(batch.dropped.len(), 1);
        assert_eq!(batch.staged[1].user_id, "17");
        assert!(batch
            .staged
            .iter()
            .all(|s| !s.user_id.is_empty() && !s.action_type.is_empty()));
    }

    #[test]
    fn identity_keys_are_staged_verbatim() {
        let batch = RecordCleaner::default().clean(
            vec![raw(json!({
                "user_id": " u1 ",
                "action_type": "login ",
                "timestamp": "2024-03-01T10:15:00Z"
            }))],
            load_ts(),
        );
        assert_eq!(batch.staged.len(), 1);
        assert_eq!(batch.staged[0].user_id, " u1 ");
        assert_eq!(batch.staged[0].action_type, "login ");
    }

    #[test]
    fn unparseable_non_string_timestamp_is_dropped() {
        let batch = RecordCleaner::default().clean(
            vec![
                raw(json!({"user_id": "u", "action_type": "a", "timestamp": 1714557600})),
                raw(json!({"user_id": "u", "action_type": "a"})),
            ],
            load_ts(),
        );
        assert_eq!(batch.dropped.len(), 2);
    }

    #[test]
    fn timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 6, 30, 22, 5, 9).single();
        assert_eq!(parse_timestamp("2024-06-30T22:05:09Z"), expected);
        assert_eq!(parse_timestamp("2024-07-01T00:05:09+02:00"), expected);
        assert_eq!(parse_timestamp("2024-06-30 22:05:09"), expected);
        assert_eq!(parse_timestamp("2024-06-30T22:05:09.000"), expected);
        assert_eq!(
            parse_timestamp("2024-06-30"),
            Utc.with_ymd_and_hms(2024, 6, 30, 0, 0, 0).single()
        );
        assert_eq!(parse_timestamp(""), None);
        assert_eq!(parse_timestamp("2024-13-45T99:00:00"), None);
        assert_eq!(parse_timestamp("not a date"), None);
    }
}

//! Core lead model, typed document values and sync run results for leadsync.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "leadsync-core";

/// Enrichment keys written onto every central lead document.
pub const ORIGINAL_ID_FIELD: &str = "original_id";
pub const ORIGINAL_COLLECTION_FIELD: &str = "original_collection";
pub const SOURCE_DATABASE_FIELD: &str = "source_database";
pub const SYNCED_AT_FIELD: &str = "synced_at";

/// Key under the audit `results` map that holds the error list.
pub const AUDIT_ERRORS_KEY: &str = "errors";

/// A single typed value inside a stored document.
///
/// Stores keep numbers and native timestamps apart, so range filters never
/// match across types: an epoch-millisecond bound only sees numbers and a
/// timestamp bound only sees timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Integer(i64),
    Double(f64),
    String(String),
    Timestamp(DateTime<Utc>),
    Array(Vec<FieldValue>),
    Map(BTreeMap<String, FieldValue>),
}

/// Field name -> value mapping; payload fields are carried opaquely.
pub type Document = BTreeMap<String, FieldValue>;

impl FieldValue {
    /// Inclusive lower-bound check with store-typed comparison.
    pub fn at_or_after(&self, bound: &TimestampBound) -> bool {
        match (self, bound) {
            (FieldValue::Integer(v), TimestampBound::EpochMillis(ms)) => v >= ms,
            (FieldValue::Double(v), TimestampBound::EpochMillis(ms)) => *v >= *ms as f64,
            (FieldValue::Timestamp(ts), TimestampBound::Timestamp(cutoff)) => ts >= cutoff,
            _ => false,
        }
    }

    /// Renders scalar identifiers (`String` or `Integer`) as an id string.
    pub fn as_identifier(&self) -> Option<String> {
        match self {
            FieldValue::String(s) if !s.trim().is_empty() => Some(s.clone()),
            FieldValue::Integer(i) => Some(i.to_string()),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::String(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::String(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(value: DateTime<Utc>) -> Self {
        FieldValue::Timestamp(value)
    }
}

/// How a source stores its creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampKind {
    /// Integer milliseconds since the Unix epoch.
    EpochMillis,
    /// The store's native timestamp type.
    NativeTimestamp,
}

/// A cutoff already translated into one source's timestamp representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampBound {
    EpochMillis(i64),
    Timestamp(DateTime<Utc>),
}

impl TimestampKind {
    pub fn bound_for(self, cutoff: DateTime<Utc>) -> TimestampBound {
        match self {
            TimestampKind::EpochMillis => TimestampBound::EpochMillis(cutoff.timestamp_millis()),
            TimestampKind::NativeTimestamp => TimestampBound::Timestamp(cutoff),
        }
    }
}

/// Midnight (00:00:00.000 UTC) of the calendar day containing `now`.
pub fn utc_day_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive().and_time(NaiveTime::MIN).and_utc()
}

/// Deterministic central document id for a (source, original id) pair.
pub fn central_id(source_tag: &str, original_id: &str) -> String {
    format!("{source_tag}_{original_id}")
}

/// A lead as fetched from one source store.
#[derive(Debug, Clone, PartialEq)]
pub struct RawLeadRecord {
    pub original_id: String,
    pub original_collection: String,
    pub fields: Document,
}

/// The merged document written once to the central lead collection.
#[derive(Debug, Clone, PartialEq)]
pub struct CentralLeadRecord {
    pub id: String,
    pub fields: Document,
}

impl CentralLeadRecord {
    /// Raw fields first, enrichment keys last so they win on collision.
    pub fn from_raw(source_tag: &str, raw: &RawLeadRecord, synced_at: DateTime<Utc>) -> Self {
        let mut fields = raw.fields.clone();
        fields.insert(ORIGINAL_ID_FIELD.to_string(), raw.original_id.clone().into());
        fields.insert(
            ORIGINAL_COLLECTION_FIELD.to_string(),
            raw.original_collection.clone().into(),
        );
        fields.insert(SOURCE_DATABASE_FIELD.to_string(), source_tag.into());
        fields.insert(SYNCED_AT_FIELD.to_string(), synced_at.into());
        Self {
            id: central_id(source_tag, &raw.original_id),
            fields,
        }
    }
}

/// Aggregate outcome of one orchestrator invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncRunResult {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub cutoff: DateTime<Utc>,
    pub schedule: String,
    /// Newly created central records per source tag.
    pub counts: BTreeMap<String, u64>,
    /// One entry per failed source, in source order.
    pub errors: Vec<String>,
}

impl SyncRunResult {
    pub fn total_created(&self) -> u64 {
        self.counts.values().sum()
    }

    /// `{ timestamp, results: { <tag>: count, ..., errors: [..] }, schedule }`
    pub fn to_audit_document(&self) -> Document {
        let mut results: BTreeMap<String, FieldValue> = self
            .counts
            .iter()
            .map(|(tag, count)| (tag.clone(), FieldValue::Integer(*count as i64)))
            .collect();
        results.insert(
            AUDIT_ERRORS_KEY.to_string(),
            FieldValue::Array(self.errors.iter().cloned().map(FieldValue::String).collect()),
        );

        let mut doc = Document::new();
        doc.insert("timestamp".to_string(), FieldValue::Timestamp(self.started_at));
        doc.insert("results".to_string(), FieldValue::Map(results));
        doc.insert("schedule".to_string(), self.schedule.clone().into());
        doc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn ts(y: i32, m: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, mi, s).single().unwrap()
    }

    #[test]
    fn central_id_is_tag_underscore_original() {
        assert_eq!(central_id("credsettlee", "abc123"), "credsettlee_abc123");
        assert_eq!(central_id("ama", "x_y"), central_id("ama", "x_y"));
    }

    #[test]
    fn day_start_truncates_to_utc_midnight() {
        let now = ts(2026, 3, 14, 23, 59, 59) + Duration::milliseconds(999);
        assert_eq!(utc_day_start(now), ts(2026, 3, 14, 0, 0, 0));
        assert_eq!(utc_day_start(ts(2026, 3, 14, 0, 0, 0)), ts(2026, 3, 14, 0, 0, 0));
    }

    #[test]
    fn epoch_bound_is_inclusive_and_numeric_only() {
        let cutoff = ts(2026, 3, 14, 0, 0, 0);
        let bound = TimestampKind::EpochMillis.bound_for(cutoff);
        let ms = cutoff.timestamp_millis();

        assert!(FieldValue::Integer(ms).at_or_after(&bound));
        assert!(!FieldValue::Integer(ms - 1).at_or_after(&bound));
        assert!(FieldValue::Double(ms as f64 + 0.5).at_or_after(&bound));
        assert!(!FieldValue::Timestamp(cutoff).at_or_after(&bound));
        assert!(!FieldValue::String(ms.to_string()).at_or_after(&bound));
    }

    #[test]
    fn timestamp_bound_is_inclusive_and_timestamp_only() {
        let cutoff = ts(2026, 3, 14, 0, 0, 0);
        let bound = TimestampKind::NativeTimestamp.bound_for(cutoff);

        assert!(FieldValue::Timestamp(cutoff).at_or_after(&bound));
        assert!(!FieldValue::Timestamp(cutoff - Duration::milliseconds(1)).at_or_after(&bound));
        assert!(!FieldValue::Integer(cutoff.timestamp_millis()).at_or_after(&bound));
    }

    #[test]
    fn enrichment_keys_override_colliding_raw_fields() {
        let synced_at = ts(2026, 3, 14, 9, 30, 0);
        let mut fields = Document::new();
        fields.insert("name".into(), "Asha".into());
        fields.insert("source_database".into(), "spoofed".into());
        let raw = RawLeadRecord {
            original_id: "42".into(),
            original_collection: "leads".into(),
            fields,
        };

        let central = CentralLeadRecord::from_raw("ama", &raw, synced_at);
        assert_eq!(central.id, "ama_42");
        assert_eq!(central.fields["name"], FieldValue::from("Asha"));
        assert_eq!(central.fields[SOURCE_DATABASE_FIELD], FieldValue::from("ama"));
        assert_eq!(central.fields[ORIGINAL_ID_FIELD], FieldValue::from("42"));
        assert_eq!(central.fields[ORIGINAL_COLLECTION_FIELD], FieldValue::from("leads"));
        assert_eq!(central.fields[SYNCED_AT_FIELD], FieldValue::Timestamp(synced_at));
    }

    #[test]
    fn audit_document_nests_errors_under_results() {
        let started_at = ts(2026, 3, 14, 9, 45, 0);
        let result = SyncRunResult {
            run_id: Uuid::new_v4(),
            started_at,
            cutoff: utc_day_start(started_at),
            schedule: "every 15 minutes".into(),
            counts: BTreeMap::from([("ama".to_string(), 2), ("credsettlee".to_string(), 0)]),
            errors: vec!["Error syncing from credsettlee: boom".into()],
        };

        let doc = result.to_audit_document();
        assert_eq!(doc["timestamp"], FieldValue::Timestamp(started_at));
        assert_eq!(doc["schedule"], FieldValue::from("every 15 minutes"));
        let FieldValue::Map(results) = &doc["results"] else {
            panic!("results should be a map");
        };
        assert_eq!(results["ama"], FieldValue::Integer(2));
        assert_eq!(results["credsettlee"], FieldValue::Integer(0));
        assert_eq!(
            results[AUDIT_ERRORS_KEY],
            FieldValue::Array(vec!["Error syncing from credsettlee: boom".into()])
        );
        assert_eq!(result.total_created(), 2);
    }
}

//! Core domain model, record normalization and merge accounting for APEV.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const CRATE_NAME: &str = "apev-core";

/// Artifact name stem shared by snapshots and the master dataset.
pub const DATASET_NAME: &str = "AlphaPoliceEvent";

/// Property key under which fetchers place the canonical geometry JSON.
pub const GEOMETRY_FIELD: &str = "_geometry_json";

/// One flattened feature as delivered by the fetch collaborator.
pub type RawRecord = Map<String, JsonValue>;

/// Canonical police event record. Timestamps are UTC with millisecond precision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub last_updated: DateTime<Utc>,
    pub category: Option<String>,
    pub location: Option<String>,
    pub occurred_at: Option<DateTime<Utc>>,
    pub status: Option<String>,
    pub geometry: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

impl Record {
    /// Ordering key used whenever two versions of one identifier compete.
    pub fn recency_key(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        (self.last_updated, self.fetched_at)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedRecordError {
    #[error("missing required field `{field}`")]
    MissingField { field: &'static str },
    #[error("unparseable `{field}` value: {value}")]
    Unparseable { field: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("incompatible schema: {reason}")]
pub struct IncompatibleSchemaError {
    pub reason: String,
}

impl IncompatibleSchemaError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Counters emitted by every merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
    pub added: usize,
    pub updated: usize,
    pub reconciled: usize,
    pub ignored_stale: usize,
    pub collapsed_duplicates: usize,
    pub total_master_size: usize,
}

/// The accumulated dataset keyed by identifier.
///
/// `base_version` is the persisted version this value was loaded from (0 when
/// nothing has been committed yet). It travels unchanged through a merge and is
/// checked as the commit precondition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MasterDataset {
    pub base_version: u64,
    pub records: BTreeMap<String, Record>,
}

impl MasterDataset {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_records(
        base_version: u64,
        records: impl IntoIterator<Item = Record>,
    ) -> Result<Self, IncompatibleSchemaError> {
        let mut map = BTreeMap::new();
        for record in records {
            if record.id.trim().is_empty() {
                return Err(IncompatibleSchemaError::new(
                    "master dataset contains a record with an empty identifier",
                ));
            }
            if let Some(previous) = map.insert(record.id.clone(), record) {
                return Err(IncompatibleSchemaError::new(format!(
                    "master dataset contains identifier {} more than once",
                    previous.id
                )));
            }
        }
        Ok(Self {
            base_version,
            records: map,
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Record> {
        self.records.get(id)
    }

    /// Records in identifier order, the order every persisted form uses.
    pub fn to_ordered_vec(&self) -> Vec<Record> {
        self.records.values().cloned().collect()
    }
}

/// Candidate source field names per canonical field; the first present, non-null candidate wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldMapping {
    pub identifier: Vec<String>,
    pub last_updated: Vec<String>,
    pub category: Vec<String>,
    pub location: Vec<String>,
    pub occurred_at: Vec<String>,
    pub status: Vec<String>,
    /// Derive identity from row content when no identifier field is present.
    pub content_hash_identity: bool,
}

fn names(values: &[&str]) -> Vec<String> {
    values.iter().map(ToString::to_string).collect()
}

impl Default for FieldMapping {
    fn default() -> Self {
        Self {
            identifier: names(&["GlobalID", "globalid", "GLOBALID"]),
            last_updated: names(&["EditDate", "last_edited_date", "LastUpdated", "UpdatedAt"]),
            category: names(&["EventType", "CallType", "Category", "Type"]),
            location: names(&["Address", "Location", "BlockAddress"]),
            occurred_at: names(&["EventDate", "OccurredDate", "ReportDate", "CallDateTime"]),
            status: names(&["Status", "Disposition"]),
            content_hash_identity: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRecord {
    pub index: usize,
    pub error: MalformedRecordError,
}

#[derive(Debug, Clone, Default)]
pub struct NormalizedBatch {
    pub records: Vec<Record>,
    pub rejected: Vec<RejectedRecord>,
}

#[derive(Debug, Clone, Default)]
pub struct RecordNormalizer {
    mapping: FieldMapping,
}

impl RecordNormalizer {
    pub fn new(mapping: FieldMapping) -> Self {
        Self { mapping }
    }

    pub fn mapping(&self) -> &FieldMapping {
        &self.mapping
    }

    pub fn normalize(
        &self,
        raw: &RawRecord,
        fetched_at: DateTime<Utc>,
    ) -> Result<Record, MalformedRecordError> {
        let id = match first_present(raw, &self.mapping.identifier) {
            Some(value) => canonical_identifier(value).ok_or_else(|| {
                MalformedRecordError::Unparseable {
                    field: "identifier",
                    value: value.to_string(),
                }
            })?,
            None if self.mapping.content_hash_identity => content_hash_identity(raw),
            None => return Err(MalformedRecordError::MissingField { field: "identifier" }),
        };

        let last_updated = match first_present(raw, &self.mapping.last_updated) {
            Some(value) => parse_timestamp(value).ok_or_else(|| MalformedRecordError::Unparseable {
                field: "last_updated",
                value: value.to_string(),
            })?,
            None => return Err(MalformedRecordError::MissingField { field: "last_updated" }),
        };

        let occurred_at = match first_present(raw, &self.mapping.occurred_at) {
            Some(value) => Some(parse_timestamp(value).ok_or_else(|| {
                MalformedRecordError::Unparseable {
                    field: "occurred_at",
                    value: value.to_string(),
                }
            })?),
            None => None,
        };

        Ok(Record {
            id,
            last_updated,
            category: first_present(raw, &self.mapping.category).and_then(text_value),
            location: first_present(raw, &self.mapping.location).and_then(text_value),
            occurred_at,
            status: first_present(raw, &self.mapping.status).and_then(text_value),
            geometry: raw.get(GEOMETRY_FIELD).and_then(text_value),
            fetched_at: truncate_to_millis(fetched_at),
        })
    }

    /// Normalize a whole fetch. Malformed records are collected, never fatal.
    pub fn normalize_batch(&self, raws: &[RawRecord], fetched_at: DateTime<Utc>) -> NormalizedBatch {
        let mut batch = NormalizedBatch::default();
        for (index, raw) in raws.iter().enumerate() {
            match self.normalize(raw, fetched_at) {
                Ok(record) => batch.records.push(record),
                Err(error) => batch.rejected.push(RejectedRecord { index, error }),
            }
        }
        batch
    }
}

fn first_present<'a>(raw: &'a RawRecord, candidates: &[String]) -> Option<&'a JsonValue> {
    candidates
        .iter()
        .filter_map(|name| raw.get(name))
        .find(|value| !value.is_null())
}

fn text_value(value: &JsonValue) -> Option<String> {
    let text = match value {
        JsonValue::Null => return None,
        JsonValue::String(s) => s.trim().to_string(),
        other => other.to_string(),
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Trim, strip GUID braces and uppercase GUIDs; integers are stringified.
pub fn canonical_identifier(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => {
            let trimmed = s.trim().trim_start_matches('{').trim_end_matches('}').trim();
            if trimmed.is_empty() {
                return None;
            }
            if looks_like_guid(trimmed) {
                Some(trimmed.to_ascii_uppercase())
            } else {
                Some(trimmed.to_string())
            }
        }
        JsonValue::Number(n) => n
            .as_i64()
            .map(|v| v.to_string())
            .or_else(|| n.as_u64().map(|v| v.to_string())),
        _ => None,
    }
}

fn looks_like_guid(s: &str) -> bool {
    s.len() == 36
        && s.char_indices().all(|(i, c)| match i {
            8 | 13 | 18 | 23 => c == '-',
            _ => c.is_ascii_hexdigit(),
        })
}

fn content_hash_identity(raw: &RawRecord) -> String {
    let payload: BTreeMap<&str, &JsonValue> = raw
        .iter()
        .filter(|(k, _)| !k.eq_ignore_ascii_case("objectid"))
        .map(|(k, v)| (k.as_str(), v))
        .collect();
    let encoded = serde_json::to_string(&payload).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(encoded.as_bytes());
    hex::encode(hasher.finalize())
}

/// Accepts epoch milliseconds, RFC 3339, and naive date-times (read as UTC).
pub fn parse_timestamp(value: &JsonValue) -> Option<DateTime<Utc>> {
    let parsed = match value {
        JsonValue::Number(n) => {
            let millis = n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64))?;
            Utc.timestamp_millis_opt(millis).single()
        }
        JsonValue::String(s) => parse_timestamp_str(s.trim()),
        _ => None,
    }?;
    Some(truncate_to_millis(parsed))
}

fn parse_timestamp_str(s: &str) -> Option<DateTime<Utc>> {
    if s.is_empty() {
        return None;
    }
    if s.bytes().all(|b| b.is_ascii_digit()) {
        return s
            .parse::<i64>()
            .ok()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single());
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%m/%d/%Y %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

pub fn truncate_to_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ts.timestamp_millis())
        .single()
        .unwrap_or(ts)
}

/// The single textual form used in every persisted artifact.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_canonical_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|ts| truncate_to_millis(ts.with_timezone(&Utc)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: JsonValue) -> RawRecord {
        value.as_object().cloned().expect("object")
    }

    fn fetched() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 6, 0, 0).single().unwrap()
    }

    #[test]
    fn normalizes_arcgis_epoch_millis_and_guid_identity() {
        let normalizer = RecordNormalizer::default();
        let record = normalizer
            .normalize(
                &raw(json!({
                    "GlobalID": "{6f1c2a9e-0b7d-4c53-9a51-3e2f7d1b8c44}",
                    "EditDate": 1767225600123_i64,
                    "EventType": "  Burglary ",
                    "Address": "100 MAIN ST",
                    "Status": "Open",
                    "_geometry_json": "{\"type\":\"Point\"}"
                })),
                fetched(),
            )
            .expect("normalize");

        assert_eq!(record.id, "6F1C2A9E-0B7D-4C53-9A51-3E2F7D1B8C44");
        assert_eq!(format_timestamp(record.last_updated), "2026-01-01T00:00:00.123Z");
        assert_eq!(record.category.as_deref(), Some("Burglary"));
        assert_eq!(record.location.as_deref(), Some("100 MAIN ST"));
        assert_eq!(record.status.as_deref(), Some("Open"));
        assert_eq!(record.geometry.as_deref(), Some("{\"type\":\"Point\"}"));
        assert_eq!(record.occurred_at, None);
    }

    #[test]
    fn equivalent_timestamp_forms_compare_equal() {
        let a = parse_timestamp(&json!("2026-01-02T05:00:00-05:00")).unwrap();
        let b = parse_timestamp(&json!("2026-01-02 10:00:00")).unwrap();
        let c = parse_timestamp(&json!(1767348000000_i64)).unwrap();
        let d = parse_timestamp(&json!("2026-01-02T10:00:00.000400Z")).unwrap();
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(c, d);
    }

    #[test]
    fn missing_identifier_is_malformed() {
        let err = RecordNormalizer::default()
            .normalize(&raw(json!({"EditDate": 1767225600000_i64})), fetched())
            .unwrap_err();
        assert_eq!(err, MalformedRecordError::MissingField { field: "identifier" });
    }

    #[test]
    fn null_or_unparseable_last_updated_is_malformed() {
        let normalizer = RecordNormalizer::default();
        let missing = normalizer
            .normalize(&raw(json!({"GlobalID": "a", "EditDate": null})), fetched())
            .unwrap_err();
        assert_eq!(missing, MalformedRecordError::MissingField { field: "last_updated" });

        let garbage = normalizer
            .normalize(&raw(json!({"GlobalID": "a", "EditDate": "last tuesday"})), fetched())
            .unwrap_err();
        assert!(matches!(
            garbage,
            MalformedRecordError::Unparseable { field: "last_updated", .. }
        ));
    }

    #[test]
    fn content_hash_identity_ignores_object_id() {
        let normalizer = RecordNormalizer::new(FieldMapping {
            content_hash_identity: true,
            ..FieldMapping::default()
        });
        let a = normalizer
            .normalize(
                &raw(json!({"OBJECTID": 1, "EditDate": "2026-01-01", "Address": "1 A ST"})),
                fetched(),
            )
            .unwrap();
        let b = normalizer
            .normalize(
                &raw(json!({"OBJECTID": 77, "EditDate": "2026-01-01", "Address": "1 A ST"})),
                fetched(),
            )
            .unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.id.len(), 64);
    }

    #[test]
    fn batch_counts_rejections_without_failing() {
        let raws = vec![
            raw(json!({"GlobalID": "x-1", "EditDate": "2026-01-01"})),
            raw(json!({"EditDate": "2026-01-01"})),
            raw(json!({"GlobalID": "x-2", "EditDate": "2026-01-03"})),
        ];
        let batch = RecordNormalizer::default().normalize_batch(&raws, fetched());
        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.rejected.len(), 1);
        assert_eq!(batch.rejected[0].index, 1);
    }

    #[test]
    fn master_rejects_duplicate_identifiers() {
        let record = RecordNormalizer::default()
            .normalize(&raw(json!({"GlobalID": "dup", "EditDate": "2026-01-01"})), fetched())
            .unwrap();
        let err = MasterDataset::from_records(3, vec![record.clone(), record]).unwrap_err();
        assert!(err.reason.contains("dup"));
    }
}

//! Usage event model, predicate construction and bounded retrieval.
//!
//! The storage backend is reached only through the [`EventStore`] trait, so
//! everything in this crate is independent of the concrete database.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{OffsetDateTime, UtcOffset};

pub mod query;
pub mod retrieval;

pub use query::{Operator, Predicate, PredicateBuilder, PredicateSet, Query, QueryArg};
pub use retrieval::{
    BoundedRetriever, ChunkPlan, ChunkedScan, ChunkedTimeScanner, EventStore, Retrieval,
    RetrievalLimits, TimeChunk, MAX_CHUNKS, RESULT_CEILING,
};

pub const METADATA_DECODE_FAILURE: &str = "failed to parse metadata";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum EventsError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("query failed: {0}")]
    Query(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// A JSON-compatible metadata value. Maps keep their insertion order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MetadataValue {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    List(Vec<MetadataValue>),
    Map(IndexMap<String, MetadataValue>),
}

pub type Metadata = IndexMap<String, MetadataValue>;

impl From<Value> for MetadataValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(flag) => Self::Bool(flag),
            Value::Number(number) => Self::Number(number),
            Value::String(text) => Self::String(text),
            Value::Array(items) => Self::List(items.into_iter().map(Self::from).collect()),
            Value::Object(entries) => Self::Map(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, Self::from(value)))
                    .collect(),
            ),
        }
    }
}

impl From<MetadataValue> for Value {
    fn from(value: MetadataValue) -> Self {
        match value {
            MetadataValue::Null => Value::Null,
            MetadataValue::Bool(flag) => Value::Bool(flag),
            MetadataValue::Number(number) => Value::Number(number),
            MetadataValue::String(text) => Value::String(text),
            MetadataValue::List(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            MetadataValue::Map(entries) => Value::Object(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, Value::from(value)))
                    .collect(),
            ),
        }
    }
}

/// Decodes stored metadata text.
///
/// # Errors
/// Returns [`EventsError::Validation`] when the text is not a JSON object.
pub fn decode_metadata(raw: &str) -> Result<Metadata, EventsError> {
    serde_json::from_str(raw)
        .map_err(|err| EventsError::Validation(format!("invalid metadata JSON: {err}")))
}

/// Metadata substituted for a row whose stored metadata cannot be decoded.
#[must_use]
pub fn metadata_decode_failure() -> Metadata {
    let mut marker = Metadata::new();
    marker.insert(
        "error".to_string(),
        MetadataValue::String(METADATA_DECODE_FAILURE.to_string()),
    );
    marker
}

/// One stored usage event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventRecord {
    pub id: i64,
    pub service: String,
    pub event: String,
    pub path: String,
    pub referrer: Option<String>,
    pub user_browser: Option<String>,
    pub user_device: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub user_ip: String,
    pub user_location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

/// Query intent. Absent and empty fields place no constraint.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "browser")]
    pub user_browser: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "device")]
    pub user_device: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
}

impl EventFilter {
    /// Both time bounds, when present and parseable.
    #[must_use]
    pub fn time_range(&self) -> Option<(OffsetDateTime, OffsetDateTime)> {
        let from = parse_rfc3339(self.from.as_deref()?).ok()?;
        let to = parse_rfc3339(self.to.as_deref()?).ok()?;
        Some((from, to))
    }

    #[must_use]
    pub fn without_time_bounds(&self) -> Self {
        Self {
            from: None,
            to: None,
            ..self.clone()
        }
    }
}

/// Wire shape of an ingest request.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IngestRequest {
    pub service: String,
    pub event: String,
    pub path: String,
    #[serde(default)]
    pub referrer: Option<String>,
    #[serde(default)]
    pub user_browser: Option<String>,
    #[serde(default)]
    pub user_device: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub metadata: Option<Metadata>,
}

impl IngestRequest {
    /// Resolves the request into a validated write input.
    ///
    /// A missing or blank timestamp defaults to `now`.
    ///
    /// # Errors
    /// Returns [`EventsError::Validation`] when a required field is blank or
    /// the explicit timestamp does not parse.
    pub fn into_input(
        self,
        user_ip: String,
        user_location: String,
        now: OffsetDateTime,
    ) -> Result<EventInput, EventsError> {
        let timestamp = match self.timestamp.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() => parse_rfc3339(raw)?,
            _ => now.to_offset(UtcOffset::UTC),
        };

        let input = EventInput {
            service: self.service,
            event: self.event,
            path: self.path,
            referrer: non_empty(self.referrer),
            user_browser: non_empty(self.user_browser),
            user_device: non_empty(self.user_device),
            timestamp,
            user_ip,
            user_location,
            metadata: self.metadata.filter(|metadata| !metadata.is_empty()),
        };
        input.validate()?;
        Ok(input)
    }
}

/// A validated event ready to be persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventInput {
    pub service: String,
    pub event: String,
    pub path: String,
    pub referrer: Option<String>,
    pub user_browser: Option<String>,
    pub user_device: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub user_ip: String,
    pub user_location: String,
    pub metadata: Option<Metadata>,
}

impl EventInput {
    /// Validates a write payload before insert.
    ///
    /// # Errors
    /// Returns [`EventsError::Validation`] when required fields are blank or
    /// the timestamp cannot be stored.
    pub fn validate(&self) -> Result<(), EventsError> {
        for (name, value) in [
            ("service", &self.service),
            ("event", &self.event),
            ("path", &self.path),
        ] {
            if value.trim().is_empty() {
                return Err(EventsError::Validation(format!(
                    "{name} MUST be provided for every event"
                )));
            }
        }

        timestamp_to_nanos(self.timestamp)?;
        Ok(())
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|inner| !inner.is_empty())
}

/// Parses an RFC3339 timestamp with any offset and normalizes it to UTC.
///
/// # Errors
/// Returns [`EventsError::Validation`] when parsing fails.
pub fn parse_rfc3339(value: &str) -> Result<OffsetDateTime, EventsError> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map(|parsed| parsed.to_offset(UtcOffset::UTC))
        .map_err(|err| EventsError::Validation(format!("invalid RFC3339 timestamp: {err}")))
}

/// Formats a timestamp as RFC3339 in UTC, keeping sub-second digits.
///
/// # Errors
/// Returns [`EventsError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, EventsError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| EventsError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

/// Storage representation of a timestamp: nanoseconds since the Unix epoch.
///
/// `i64::MIN` and `i64::MAX` are reserved for saturated query bounds and are
/// never stored.
///
/// # Errors
/// Returns [`EventsError::Validation`] for instants outside the open `i64`
/// range.
pub fn timestamp_to_nanos(value: OffsetDateTime) -> Result<i64, EventsError> {
    match i64::try_from(value.unix_timestamp_nanos()) {
        Ok(nanos) if nanos != i64::MIN && nanos != i64::MAX => Ok(nanos),
        _ => Err(EventsError::Validation(format!(
            "timestamp out of storable range: {value}"
        ))),
    }
}

/// Query-bound representation of any instant. Instants before or after the
/// storable range clamp to `i64::MIN` or `i64::MAX`, which lie strictly
/// outside every stored value.
#[must_use]
pub fn timestamp_to_nanos_saturating(value: OffsetDateTime) -> i64 {
    let nanos = value.unix_timestamp_nanos();
    i64::try_from(nanos).unwrap_or(if nanos < 0 { i64::MIN } else { i64::MAX })
}

/// # Errors
/// Returns [`EventsError::Validation`] when `nanos` is not a representable
/// instant.
pub fn nanos_to_timestamp(nanos: i64) -> Result<OffsetDateTime, EventsError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(nanos))
        .map_err(|err| EventsError::Validation(format!("invalid stored timestamp {nanos}: {err}")))
}

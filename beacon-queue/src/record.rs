use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;

/// A persisted poll result
///
/// `response` holds the JSON text exactly as it was stored so it can be
/// forwarded without a decode/encode round trip.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QueuedRecord {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub address: String,
    pub response: String,
    pub method: String,
}

impl QueuedRecord {
    /// Decode the stored response
    pub fn value(&self) -> serde_json::Result<Value> {
        serde_json::from_str(&self.response)
    }
}

/// Timestamps are stored as fixed-width RFC 3339 text so that ordering by
/// the column is chronological
pub(crate) fn encode_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn decode_timestamp(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(value).map(|ts| ts.with_timezone(&Utc))
}

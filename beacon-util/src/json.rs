//! Serde helpers for durations written as integer milliseconds.

use std::time::Duration;

use serde::de::Error;
use serde::{Deserialize, Deserializer, Serializer};

/// Read a millisecond count, e.g. `"poll_interval_ms": 180000`
pub fn deserialize_duration_from_ms<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}

/// Like [`deserialize_duration_from_ms`] but rejects zero, for values that
/// drive a repeating timer
pub fn deserialize_interval_from_ms<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let interval = deserialize_duration_from_ms(deserializer)?;
    if interval.is_zero() {
        return Err(D::Error::custom("interval must be greater than zero"));
    }
    Ok(interval)
}

pub fn serialize_duration_to_ms<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
    serializer.serialize_u64(ms)
}

//! Shared row-decoding helpers for the SQLite repositories.

use chrono::{DateTime, NaiveDateTime, Utc};
use uuid::Uuid;

use crate::domain::ports::StorageError;

/// Parse a datetime from RFC3339 or SQLite's default format.
pub fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StorageError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return Ok(DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc));
    }
    Err(StorageError::Corrupt(format!("unparseable datetime: {s}")))
}

/// Parse an optional datetime column.
pub fn parse_datetime_opt(s: Option<&str>) -> Result<Option<DateTime<Utc>>, StorageError> {
    s.map(parse_datetime).transpose()
}

/// Parse a UUID column.
pub fn parse_uuid(s: &str) -> Result<Uuid, StorageError> {
    Uuid::parse_str(s).map_err(|e| StorageError::Corrupt(format!("invalid uuid {s}: {e}")))
}

/// Parse an optional UUID column.
pub fn parse_uuid_opt(s: Option<&str>) -> Result<Option<Uuid>, StorageError> {
    s.map(parse_uuid).transpose()
}

/// Decode a JSON array column of UUIDs.
pub fn parse_uuid_list(s: &str) -> Result<Vec<Uuid>, StorageError> {
    serde_json::from_str(s).map_err(StorageError::Serialization)
}

/// Decode a JSON array column of strings.
pub fn parse_string_list(s: &str) -> Result<Vec<String>, StorageError> {
    serde_json::from_str(s).map_err(StorageError::Serialization)
}

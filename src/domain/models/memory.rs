//! Memory entry model.
//!
//! Free-form durable key/value records exposed through the
//! `memory store/query/delete` commands.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub namespace: String,
    pub key: String,
    pub value: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MemoryEntry {
    pub fn new(
        namespace: impl Into<String>,
        key: impl Into<String>,
        value: Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            key: key.into(),
            value,
            created_at: now,
            updated_at: now,
        }
    }
}

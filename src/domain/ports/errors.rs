//! Storage error type shared by all persistence ports.

use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by persistence implementations.
///
/// Callers retry `is_transient()` failures with backoff and surface the
/// rest fatally for the offending item.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    #[error("Record not found: {0}")]
    NotFound(Uuid),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid stored value: {0}")]
    Corrupt(String),

    #[error("Connection pool error: {0}")]
    ConnectionPool(String),

    #[error("Migration error: {0}")]
    Migration(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

impl StorageError {
    /// Whether a retry with backoff is worthwhile.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::QueryFailed(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::WorkerCrashed
            ),
            Self::ConnectionPool(_) => true,
            _ => false,
        }
    }
}

//! Domain errors for the Apiary control plane.

use thiserror::Error;
use uuid::Uuid;

/// Broad classification used by retry loops and the gateway error mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller gave bad input; do not retry.
    Invalid,
    /// Referenced entity does not exist.
    NotFound,
    /// Entity is in the wrong state for the operation.
    Conflict,
    /// I/O or storage hiccup; retry with backoff.
    Transient,
    /// A bound was hit (queue full, connection cap); shed load.
    Exhausted,
    /// Invariant broken; quarantine the offending entity and log.
    Fatal,
}

/// Domain-level errors surfaced by the coordinator, process manager,
/// auto-scaler, and command executor.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Agent not found: {0}")]
    AgentNotFound(Uuid),

    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("Swarm not found: {0}")]
    SwarmNotFound(Uuid),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Task dependency cycle detected involving task: {0}")]
    DependencyCycle(Uuid),

    #[error("Task queue full: {pending} pending tasks at capacity {capacity}")]
    QueueFull { pending: usize, capacity: usize },

    #[error("Agent {0} cannot accept tasks in its current state")]
    AgentUnavailable(Uuid),

    #[error("Agent {id} is in use: {reason}")]
    AgentInUse { id: Uuid, reason: String },

    #[error("Failed to spawn agent process: {0}")]
    SpawnFailed(String),

    #[error("Resource caps could not be applied: {0}")]
    ResourceCaps(String),

    #[error("Scaling limit violation: {0}")]
    LimitViolation(String),

    #[error("Invalid scaling policy: {0}")]
    InvalidPolicy(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Operation timed out after {0} ms")]
    DeadlineExceeded(u64),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Storage error: {0}")]
    Storage(#[from] crate::domain::ports::StorageError),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type DomainResult<T> = Result<T, DomainError>;

impl DomainError {
    /// Classify for retry / shed / quarantine decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AgentNotFound(_) | Self::TaskNotFound(_) | Self::SwarmNotFound(_) => {
                ErrorKind::NotFound
            }
            Self::DependencyCycle(_)
            | Self::ValidationFailed(_)
            | Self::InvalidPolicy(_)
            | Self::LimitViolation(_) => ErrorKind::Invalid,
            Self::InvalidTransition { .. }
            | Self::AgentUnavailable(_)
            | Self::AgentInUse { .. } => ErrorKind::Conflict,
            Self::QueueFull { .. } => ErrorKind::Exhausted,
            Self::SpawnFailed(_) | Self::ResourceCaps(_) | Self::Internal(_) => ErrorKind::Fatal,
            Self::DeadlineExceeded(_) | Self::Cancelled(_) => ErrorKind::Conflict,
            Self::Storage(e) => {
                if e.is_transient() {
                    ErrorKind::Transient
                } else {
                    ErrorKind::Fatal
                }
            }
        }
    }

    /// Stable string code exposed on the command port and gateway frames.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AgentNotFound(_) | Self::TaskNotFound(_) | Self::SwarmNotFound(_) => "not_found",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::DependencyCycle(_) => "cycle",
            Self::QueueFull { .. } => "queue_full",
            Self::AgentUnavailable(_) => "agent_unavailable",
            Self::AgentInUse { .. } => "in_use",
            Self::SpawnFailed(_) => "spawn_error",
            Self::ResourceCaps(_) => "resource_error",
            Self::LimitViolation(_) => "limit_violation",
            Self::InvalidPolicy(_) => "invalid_policy",
            Self::ValidationFailed(_) => "invalid",
            Self::DeadlineExceeded(_) => "deadline_exceeded",
            Self::Cancelled(_) => "cancelled",
            Self::Storage(_) => "storage",
            Self::Internal(_) => "internal",
        }
    }
}

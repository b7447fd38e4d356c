//! Scaling repository port: append-only actions plus policies.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::models::{ScalingAction, ScalingPolicy};
use crate::domain::ports::errors::StorageResult;

/// Repository interface for scaling actions and policies.
///
/// Actions are append-only: `put_action` inserts a new record or updates
/// the status columns of an existing one; actions are never deleted.
#[async_trait]
pub trait ScalingRepository: Send + Sync {
    /// Append or update a scaling action.
    async fn put_action(&self, action: &ScalingAction) -> StorageResult<()>;

    /// List recent scaling actions, newest first.
    async fn list_actions(&self, limit: usize) -> StorageResult<Vec<ScalingAction>>;

    /// Insert or update a scaling policy.
    async fn put_policy(&self, policy: &ScalingPolicy) -> StorageResult<()>;

    /// Get a policy by id.
    async fn get_policy(&self, id: Uuid) -> StorageResult<Option<ScalingPolicy>>;

    /// The enabled policy the auto-scaler should follow, if any.
    /// When several are enabled the most recently written wins.
    async fn get_current_policy(&self) -> StorageResult<Option<ScalingPolicy>>;

    /// List all policies.
    async fn list_policies(&self) -> StorageResult<Vec<ScalingPolicy>>;
}

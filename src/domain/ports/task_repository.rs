//! Task repository port.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::models::{Task, TaskStatus};
use crate::domain::ports::errors::StorageResult;

/// Filter criteria for listing tasks.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub task_type: Option<String>,
    pub assigned_to: Option<Uuid>,
    pub limit: Option<usize>,
}

/// Repository interface for task persistence.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Insert or update a task record.
    async fn put(&self, task: &Task) -> StorageResult<()>;

    /// Get a task by id.
    async fn get(&self, id: Uuid) -> StorageResult<Option<Task>>;

    /// List tasks with optional filters, newest first.
    async fn list(&self, filter: TaskFilter) -> StorageResult<Vec<Task>>;

    /// Delete a task record.
    async fn delete(&self, id: Uuid) -> StorageResult<()>;

    /// Count tasks in the given status.
    async fn count_by_status(&self, status: TaskStatus) -> StorageResult<u64>;
}

//! SQLite implementation of the task repository.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::domain::models::{Task, TaskStatus};
use crate::domain::ports::{StorageError, StorageResult, TaskFilter, TaskRepository};
use crate::infrastructure::database::utils::{
    parse_datetime, parse_datetime_opt, parse_string_list, parse_uuid, parse_uuid_list,
    parse_uuid_opt,
};

pub struct TaskRepositoryImpl {
    pool: SqlitePool,
}

impl TaskRepositoryImpl {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> StorageResult<Task> {
        let status_raw: String = row.get("status");
        let status = TaskStatus::parse_str(&status_raw)
            .ok_or_else(|| StorageError::Corrupt(format!("unknown task status: {status_raw}")))?;

        Ok(Task {
            id: parse_uuid(row.get::<String, _>("id").as_str())?,
            task_type: row.get("task_type"),
            description: row.get("description"),
            priority: row.get::<i64, _>("priority") as u8,
            status,
            dependencies: parse_uuid_list(row.get::<String, _>("dependencies").as_str())?,
            required_caps: parse_string_list(row.get::<String, _>("required_caps").as_str())?,
            assigned_to: parse_uuid_opt(row.get::<Option<String>, _>("assigned_to").as_deref())?,
            input: row
                .get::<Option<String>, _>("input_data")
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            result: row
                .get::<Option<String>, _>("result_data")
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            error: row.get("error_message"),
            attempt_count: row.get::<i64, _>("attempt_count") as u32,
            max_retries: row.get::<i64, _>("max_retries") as u32,
            deadline: parse_datetime_opt(row.get::<Option<String>, _>("deadline").as_deref())?,
            created_at: parse_datetime(row.get::<String, _>("created_at").as_str())?,
            started_at: parse_datetime_opt(
                row.get::<Option<String>, _>("started_at").as_deref(),
            )?,
            ended_at: parse_datetime_opt(row.get::<Option<String>, _>("ended_at").as_deref())?,
            updated_at: parse_datetime(row.get::<String, _>("updated_at").as_str())?,
        })
    }
}

#[async_trait]
impl TaskRepository for TaskRepositoryImpl {
    async fn put(&self, task: &Task) -> StorageResult<()> {
        let dependencies = serde_json::to_string(&task.dependencies)?;
        let required_caps = serde_json::to_string(&task.required_caps)?;
        let input = task
            .input
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let result = task
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r"
            INSERT INTO tasks (
                id, task_type, description, priority, status,
                dependencies, required_caps, assigned_to, input_data,
                result_data, error_message, attempt_count, max_retries,
                deadline, created_at, started_at, ended_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                task_type = excluded.task_type,
                description = excluded.description,
                priority = excluded.priority,
                status = excluded.status,
                dependencies = excluded.dependencies,
                required_caps = excluded.required_caps,
                assigned_to = excluded.assigned_to,
                input_data = excluded.input_data,
                result_data = excluded.result_data,
                error_message = excluded.error_message,
                attempt_count = excluded.attempt_count,
                max_retries = excluded.max_retries,
                deadline = excluded.deadline,
                started_at = excluded.started_at,
                ended_at = excluded.ended_at,
                updated_at = excluded.updated_at
            ",
        )
        .bind(task.id.to_string())
        .bind(&task.task_type)
        .bind(&task.description)
        .bind(i64::from(task.priority))
        .bind(task.status.as_str())
        .bind(dependencies)
        .bind(required_caps)
        .bind(task.assigned_to.map(|id| id.to_string()))
        .bind(input)
        .bind(result)
        .bind(&task.error)
        .bind(i64::from(task.attempt_count))
        .bind(i64::from(task.max_retries))
        .bind(task.deadline.map(|dt| dt.to_rfc3339()))
        .bind(task.created_at.to_rfc3339())
        .bind(task.started_at.map(|dt| dt.to_rfc3339()))
        .bind(task.ended_at.map(|dt| dt.to_rfc3339()))
        .bind(task.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> StorageResult<Option<Task>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn list(&self, filter: TaskFilter) -> StorageResult<Vec<Task>> {
        let rows = sqlx::query("SELECT * FROM tasks ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?;

        let mut tasks = Vec::new();
        for row in &rows {
            let task = Self::row_to_task(row)?;
            if let Some(status) = filter.status {
                if task.status != status {
                    continue;
                }
            }
            if let Some(ref task_type) = filter.task_type {
                if task.task_type != *task_type {
                    continue;
                }
            }
            if let Some(assigned_to) = filter.assigned_to {
                if task.assigned_to != Some(assigned_to) {
                    continue;
                }
            }
            tasks.push(task);
            if let Some(limit) = filter.limit {
                if tasks.len() >= limit {
                    break;
                }
            }
        }
        Ok(tasks)
    }

    async fn delete(&self, id: Uuid) -> StorageResult<()> {
        sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn count_by_status(&self, status: TaskStatus) -> StorageResult<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM tasks WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n") as u64)
    }
}

//! SQLite implementation of the agent repository.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::domain::models::{Agent, AgentMetrics, AgentStatus, AgentType, ResourceCaps};
use crate::domain::ports::{AgentFilter, AgentRepository, StorageError, StorageResult};
use crate::infrastructure::database::utils::{
    parse_datetime, parse_datetime_opt, parse_string_list, parse_uuid, parse_uuid_list,
    parse_uuid_opt,
};

pub struct AgentRepositoryImpl {
    pool: SqlitePool,
}

impl AgentRepositoryImpl {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_agent(row: &sqlx::sqlite::SqliteRow) -> StorageResult<Agent> {
        let status_raw: String = row.get("status");
        let status = AgentStatus::parse_str(&status_raw)
            .ok_or_else(|| StorageError::Corrupt(format!("unknown agent status: {status_raw}")))?;
        let type_raw: String = row.get("agent_type");
        let agent_type = AgentType::parse_str(&type_raw)
            .ok_or_else(|| StorageError::Corrupt(format!("unknown agent type: {type_raw}")))?;

        Ok(Agent {
            id: parse_uuid(row.get::<String, _>("id").as_str())?,
            name: row.get("name"),
            agent_type,
            capabilities: parse_string_list(row.get::<String, _>("capabilities").as_str())?,
            status,
            caps: ResourceCaps {
                max_memory_bytes: row.get::<i64, _>("max_memory_bytes") as u64,
                max_concurrent_tasks: row.get::<i64, _>("max_concurrent_tasks") as u32,
                wall_timeout_ms: row.get::<i64, _>("wall_timeout_ms") as u64,
            },
            pid: row.get::<Option<i64>, _>("pid").map(|p| p as u32),
            metrics: AgentMetrics {
                tasks_completed: row.get::<i64, _>("tasks_completed") as u64,
                tasks_failed: row.get::<i64, _>("tasks_failed") as u64,
                last_activity_at: parse_datetime_opt(
                    row.get::<Option<String>, _>("last_activity_at").as_deref(),
                )?,
                started_at: parse_datetime_opt(
                    row.get::<Option<String>, _>("started_at").as_deref(),
                )?,
            },
            assigned_tasks: parse_uuid_list(row.get::<String, _>("assigned_tasks").as_str())?,
            swarm_id: parse_uuid_opt(row.get::<Option<String>, _>("swarm_id").as_deref())?,
            restart_count: row.get::<i64, _>("restart_count") as u32,
            created_at: parse_datetime(row.get::<String, _>("created_at").as_str())?,
            updated_at: parse_datetime(row.get::<String, _>("updated_at").as_str())?,
        })
    }
}

#[async_trait]
impl AgentRepository for AgentRepositoryImpl {
    async fn put(&self, agent: &Agent) -> StorageResult<()> {
        let capabilities = serde_json::to_string(&agent.capabilities)?;
        let assigned_tasks = serde_json::to_string(&agent.assigned_tasks)?;

        sqlx::query(
            r"
            INSERT INTO agents (
                id, name, agent_type, capabilities, status,
                max_memory_bytes, max_concurrent_tasks, wall_timeout_ms,
                pid, tasks_completed, tasks_failed, last_activity_at,
                started_at, assigned_tasks, swarm_id, restart_count,
                created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                agent_type = excluded.agent_type,
                capabilities = excluded.capabilities,
                status = excluded.status,
                max_memory_bytes = excluded.max_memory_bytes,
                max_concurrent_tasks = excluded.max_concurrent_tasks,
                wall_timeout_ms = excluded.wall_timeout_ms,
                pid = excluded.pid,
                tasks_completed = excluded.tasks_completed,
                tasks_failed = excluded.tasks_failed,
                last_activity_at = excluded.last_activity_at,
                started_at = excluded.started_at,
                assigned_tasks = excluded.assigned_tasks,
                swarm_id = excluded.swarm_id,
                restart_count = excluded.restart_count,
                updated_at = excluded.updated_at
            ",
        )
        .bind(agent.id.to_string())
        .bind(&agent.name)
        .bind(agent.agent_type.as_str())
        .bind(capabilities)
        .bind(agent.status.as_str())
        .bind(agent.caps.max_memory_bytes as i64)
        .bind(i64::from(agent.caps.max_concurrent_tasks))
        .bind(agent.caps.wall_timeout_ms as i64)
        .bind(agent.pid.map(i64::from))
        .bind(agent.metrics.tasks_completed as i64)
        .bind(agent.metrics.tasks_failed as i64)
        .bind(agent.metrics.last_activity_at.map(|dt| dt.to_rfc3339()))
        .bind(agent.metrics.started_at.map(|dt| dt.to_rfc3339()))
        .bind(assigned_tasks)
        .bind(agent.swarm_id.map(|id| id.to_string()))
        .bind(i64::from(agent.restart_count))
        .bind(agent.created_at.to_rfc3339())
        .bind(agent.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> StorageResult<Option<Agent>> {
        let row = sqlx::query("SELECT * FROM agents WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_agent).transpose()
    }

    async fn list(&self, filter: AgentFilter) -> StorageResult<Vec<Agent>> {
        let rows = sqlx::query("SELECT * FROM agents ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await?;

        let mut agents = Vec::with_capacity(rows.len());
        for row in &rows {
            let agent = Self::row_to_agent(row)?;
            if let Some(status) = filter.status {
                if agent.status != status {
                    continue;
                }
            }
            if let Some(agent_type) = filter.agent_type {
                if agent.agent_type != agent_type {
                    continue;
                }
            }
            if let Some(swarm_id) = filter.swarm_id {
                if agent.swarm_id != Some(swarm_id) {
                    continue;
                }
            }
            if let Some(ref cap) = filter.capability {
                if !agent.has_capability(cap) {
                    continue;
                }
            }
            agents.push(agent);
        }
        Ok(agents)
    }

    async fn delete(&self, id: Uuid) -> StorageResult<()> {
        sqlx::query("DELETE FROM agents WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

//! SQLite implementation of the swarm repository.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::domain::models::{Swarm, SwarmMode, SwarmStatus, SwarmStrategy};
use crate::domain::ports::{StorageError, StorageResult, SwarmRepository};
use crate::infrastructure::database::utils::{parse_datetime, parse_uuid, parse_uuid_list};

pub struct SwarmRepositoryImpl {
    pool: SqlitePool,
}

impl SwarmRepositoryImpl {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_swarm(row: &sqlx::sqlite::SqliteRow) -> StorageResult<Swarm> {
        let mode_raw: String = row.get("mode");
        let mode = SwarmMode::parse_str(&mode_raw)
            .ok_or_else(|| StorageError::Corrupt(format!("unknown swarm mode: {mode_raw}")))?;
        let strategy_raw: String = row.get("strategy");
        let strategy = SwarmStrategy::parse_str(&strategy_raw).ok_or_else(|| {
            StorageError::Corrupt(format!("unknown swarm strategy: {strategy_raw}"))
        })?;
        let status_raw: String = row.get("status");
        let status = SwarmStatus::parse_str(&status_raw)
            .ok_or_else(|| StorageError::Corrupt(format!("unknown swarm status: {status_raw}")))?;

        Ok(Swarm {
            id: parse_uuid(row.get::<String, _>("id").as_str())?,
            name: row.get("name"),
            mode,
            strategy,
            agent_ids: parse_uuid_list(row.get::<String, _>("agent_ids").as_str())?,
            task_ids: parse_uuid_list(row.get::<String, _>("task_ids").as_str())?,
            status,
            created_at: parse_datetime(row.get::<String, _>("created_at").as_str())?,
        })
    }
}

#[async_trait]
impl SwarmRepository for SwarmRepositoryImpl {
    async fn put(&self, swarm: &Swarm) -> StorageResult<()> {
        let agent_ids = serde_json::to_string(&swarm.agent_ids)?;
        let task_ids = serde_json::to_string(&swarm.task_ids)?;

        sqlx::query(
            r"
            INSERT INTO swarms (id, name, mode, strategy, agent_ids, task_ids, status, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                mode = excluded.mode,
                strategy = excluded.strategy,
                agent_ids = excluded.agent_ids,
                task_ids = excluded.task_ids,
                status = excluded.status
            ",
        )
        .bind(swarm.id.to_string())
        .bind(&swarm.name)
        .bind(swarm.mode.as_str())
        .bind(swarm.strategy.as_str())
        .bind(agent_ids)
        .bind(task_ids)
        .bind(swarm.status.as_str())
        .bind(swarm.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> StorageResult<Option<Swarm>> {
        let row = sqlx::query("SELECT * FROM swarms WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_swarm).transpose()
    }

    async fn list(&self) -> StorageResult<Vec<Swarm>> {
        let rows = sqlx::query("SELECT * FROM swarms ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_swarm).collect()
    }

    async fn delete(&self, id: Uuid) -> StorageResult<()> {
        sqlx::query("DELETE FROM swarms WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

//! SQLite implementation of the scaling repository.
//!
//! Actions are append-only: rows are inserted, their status columns are
//! updated as the action progresses, and nothing deletes them.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::domain::models::{
    PolicyType, ScalingAction, ScalingActionStatus, ScalingKind, ScalingPolicy,
};
use crate::domain::ports::{ScalingRepository, StorageError, StorageResult};
use crate::infrastructure::database::utils::{
    parse_datetime, parse_datetime_opt, parse_string_list, parse_uuid,
};

pub struct ScalingRepositoryImpl {
    pool: SqlitePool,
}

impl ScalingRepositoryImpl {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_action(row: &sqlx::sqlite::SqliteRow) -> StorageResult<ScalingAction> {
        let kind_raw: String = row.get("kind");
        let kind = ScalingKind::parse_str(&kind_raw)
            .ok_or_else(|| StorageError::Corrupt(format!("unknown scaling kind: {kind_raw}")))?;
        let status_raw: String = row.get("status");
        let status = ScalingActionStatus::parse_str(&status_raw).ok_or_else(|| {
            StorageError::Corrupt(format!("unknown scaling action status: {status_raw}"))
        })?;

        Ok(ScalingAction {
            id: parse_uuid(row.get::<String, _>("id").as_str())?,
            kind,
            reason: row.get("reason"),
            from_count: row.get::<i64, _>("from_count") as u32,
            to_count: row.get::<i64, _>("to_count") as u32,
            requested_at: parse_datetime(row.get::<String, _>("requested_at").as_str())?,
            status,
            duration_ms: row.get::<Option<i64>, _>("duration_ms").map(|v| v as u64),
            error: row.get("error"),
        })
    }

    fn row_to_policy(row: &sqlx::sqlite::SqliteRow) -> StorageResult<ScalingPolicy> {
        let type_raw: String = row.get("policy_type");
        let policy_type = PolicyType::parse_str(&type_raw)
            .ok_or_else(|| StorageError::Corrupt(format!("unknown policy type: {type_raw}")))?;

        Ok(ScalingPolicy {
            id: parse_uuid(row.get::<String, _>("id").as_str())?,
            name: row.get("name"),
            policy_type,
            min_agents: row.get::<i64, _>("min_agents") as u32,
            max_agents: row.get::<i64, _>("max_agents") as u32,
            target_utilization: row.get("target_utilization"),
            scale_up_threshold: row.get("scale_up_threshold"),
            scale_down_threshold: row.get("scale_down_threshold"),
            cooldown_seconds: row.get::<i64, _>("cooldown_seconds") as u64,
            metrics: parse_string_list(row.get::<String, _>("metrics").as_str())?,
            enabled: row.get::<i64, _>("enabled") != 0,
            last_triggered_at: parse_datetime_opt(
                row.get::<Option<String>, _>("last_triggered_at").as_deref(),
            )?,
        })
    }
}

#[async_trait]
impl ScalingRepository for ScalingRepositoryImpl {
    async fn put_action(&self, action: &ScalingAction) -> StorageResult<()> {
        sqlx::query(
            r"
            INSERT INTO scaling_actions (
                id, kind, reason, from_count, to_count, requested_at,
                status, duration_ms, error
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                to_count = excluded.to_count,
                status = excluded.status,
                duration_ms = excluded.duration_ms,
                error = excluded.error
            ",
        )
        .bind(action.id.to_string())
        .bind(action.kind.as_str())
        .bind(&action.reason)
        .bind(i64::from(action.from_count))
        .bind(i64::from(action.to_count))
        .bind(action.requested_at.to_rfc3339())
        .bind(action.status.as_str())
        .bind(action.duration_ms.map(|v| v as i64))
        .bind(&action.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_actions(&self, limit: usize) -> StorageResult<Vec<ScalingAction>> {
        let rows = sqlx::query(
            "SELECT * FROM scaling_actions ORDER BY requested_at DESC, id DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_action).collect()
    }

    async fn put_policy(&self, policy: &ScalingPolicy) -> StorageResult<()> {
        let metrics = serde_json::to_string(&policy.metrics)?;
        sqlx::query(
            r"
            INSERT INTO scaling_policies (
                id, name, policy_type, min_agents, max_agents,
                target_utilization, scale_up_threshold, scale_down_threshold,
                cooldown_seconds, metrics, enabled, last_triggered_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                policy_type = excluded.policy_type,
                min_agents = excluded.min_agents,
                max_agents = excluded.max_agents,
                target_utilization = excluded.target_utilization,
                scale_up_threshold = excluded.scale_up_threshold,
                scale_down_threshold = excluded.scale_down_threshold,
                cooldown_seconds = excluded.cooldown_seconds,
                metrics = excluded.metrics,
                enabled = excluded.enabled,
                last_triggered_at = excluded.last_triggered_at,
                updated_at = excluded.updated_at
            ",
        )
        .bind(policy.id.to_string())
        .bind(&policy.name)
        .bind(policy.policy_type.as_str())
        .bind(i64::from(policy.min_agents))
        .bind(i64::from(policy.max_agents))
        .bind(policy.target_utilization)
        .bind(policy.scale_up_threshold)
        .bind(policy.scale_down_threshold)
        .bind(policy.cooldown_seconds as i64)
        .bind(metrics)
        .bind(i64::from(policy.enabled))
        .bind(policy.last_triggered_at.map(|dt| dt.to_rfc3339()))
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_policy(&self, id: Uuid) -> StorageResult<Option<ScalingPolicy>> {
        let row = sqlx::query("SELECT * FROM scaling_policies WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_policy).transpose()
    }

    async fn get_current_policy(&self) -> StorageResult<Option<ScalingPolicy>> {
        let row = sqlx::query(
            "SELECT * FROM scaling_policies WHERE enabled = 1 ORDER BY updated_at DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_policy).transpose()
    }

    async fn list_policies(&self) -> StorageResult<Vec<ScalingPolicy>> {
        let rows = sqlx::query("SELECT * FROM scaling_policies ORDER BY name ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_policy).collect()
    }
}

//! SQLite implementation of the memory repository.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use crate::domain::models::MemoryEntry;
use crate::domain::ports::{MemoryRepository, StorageResult};
use crate::infrastructure::database::utils::parse_datetime;

pub struct MemoryRepositoryImpl {
    pool: SqlitePool,
}

impl MemoryRepositoryImpl {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> StorageResult<MemoryEntry> {
        Ok(MemoryEntry {
            namespace: row.get("namespace"),
            key: row.get("key"),
            value: serde_json::from_str(row.get::<String, _>("value").as_str())?,
            created_at: parse_datetime(row.get::<String, _>("created_at").as_str())?,
            updated_at: parse_datetime(row.get::<String, _>("updated_at").as_str())?,
        })
    }
}

#[async_trait]
impl MemoryRepository for MemoryRepositoryImpl {
    async fn put(&self, entry: &MemoryEntry) -> StorageResult<()> {
        let value = serde_json::to_string(&entry.value)?;
        sqlx::query(
            r"
            INSERT INTO memory_entries (namespace, key, value, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(namespace, key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            ",
        )
        .bind(&entry.namespace)
        .bind(&entry.key)
        .bind(value)
        .bind(entry.created_at.to_rfc3339())
        .bind(entry.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, namespace: &str, key: &str) -> StorageResult<Option<MemoryEntry>> {
        let row = sqlx::query("SELECT * FROM memory_entries WHERE namespace = ? AND key = ?")
            .bind(namespace)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_entry).transpose()
    }

    async fn query(&self, namespace: &str, search: &str) -> StorageResult<Vec<MemoryEntry>> {
        let pattern = format!("%{search}%");
        let rows = sqlx::query(
            "SELECT * FROM memory_entries WHERE namespace = ? AND key LIKE ? ORDER BY key ASC",
        )
        .bind(namespace)
        .bind(pattern)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_entry).collect()
    }

    async fn delete(&self, namespace: &str, key: &str) -> StorageResult<bool> {
        let result = sqlx::query("DELETE FROM memory_entries WHERE namespace = ? AND key = ?")
            .bind(namespace)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

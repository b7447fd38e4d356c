//! Database connection pool manager.
//!
//! SQLite with WAL mode for concurrent readers alongside the single
//! writer. Handles pool lifecycle and migrations.

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};

use crate::domain::ports::StorageError;

pub struct DatabaseConnection {
    pool: SqlitePool,
}

impl DatabaseConnection {
    /// Open a pool against `database_url`
    /// (e.g. `"sqlite:.apiary/apiary.db"`), creating the file if missing.
    pub async fn new(database_url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| StorageError::ConnectionPool(format!("invalid database URL: {e}")))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(10)
            .idle_timeout(Duration::from_secs(30))
            .max_lifetime(Duration::from_secs(1800))
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(|e| {
                StorageError::ConnectionPool(format!("failed to create connection pool: {e}"))
            })?;

        Ok(Self { pool })
    }

    /// Apply pending migrations. Safe to call repeatedly.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StorageError::Migration(e.to_string()))?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close all connections. Call during shutdown.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connection_and_migration() {
        // File-backed: an in-memory URL would give each pooled connection
        // its own database.
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite:{}/apiary.db", dir.path().display());
        let db = DatabaseConnection::new(&url)
            .await
            .expect("failed to create database connection");

        db.migrate().await.expect("failed to run migrations");

        let result: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='agents'",
        )
        .fetch_one(db.pool())
        .await
        .expect("failed to query table");
        assert_eq!(result.0, 1, "agents table should exist");

        db.close().await;
        assert!(db.pool().is_closed());
    }
}

//! Swarm repository port.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::models::Swarm;
use crate::domain::ports::errors::StorageResult;

/// Repository interface for swarm persistence.
#[async_trait]
pub trait SwarmRepository: Send + Sync {
    /// Insert or update a swarm record.
    async fn put(&self, swarm: &Swarm) -> StorageResult<()>;

    /// Get a swarm by id.
    async fn get(&self, id: Uuid) -> StorageResult<Option<Swarm>>;

    /// List all swarms.
    async fn list(&self) -> StorageResult<Vec<Swarm>>;

    /// Delete a swarm record.
    async fn delete(&self, id: Uuid) -> StorageResult<()>;
}

//! Agent repository port.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::models::{Agent, AgentStatus, AgentType};
use crate::domain::ports::errors::StorageResult;

/// Filter criteria for listing agents.
#[derive(Debug, Clone, Default)]
pub struct AgentFilter {
    pub status: Option<AgentStatus>,
    pub agent_type: Option<AgentType>,
    pub swarm_id: Option<Uuid>,
    pub capability: Option<String>,
}

/// Repository interface for agent persistence.
#[async_trait]
pub trait AgentRepository: Send + Sync {
    /// Insert or update an agent record.
    async fn put(&self, agent: &Agent) -> StorageResult<()>;

    /// Get an agent by id.
    async fn get(&self, id: Uuid) -> StorageResult<Option<Agent>>;

    /// List agents with optional filters.
    async fn list(&self, filter: AgentFilter) -> StorageResult<Vec<Agent>>;

    /// Delete an agent record.
    async fn delete(&self, id: Uuid) -> StorageResult<()>;
}

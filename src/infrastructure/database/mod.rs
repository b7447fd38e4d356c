//! SQLite persistence implementations.

pub mod agent_repo;
pub mod connection;
pub mod memory_repo;
pub mod scaling_repo;
pub mod swarm_repo;
pub mod task_repo;
pub mod utils;

pub use agent_repo::AgentRepositoryImpl;
pub use connection::DatabaseConnection;
pub use memory_repo::MemoryRepositoryImpl;
pub use scaling_repo::ScalingRepositoryImpl;
pub use swarm_repo::SwarmRepositoryImpl;
pub use task_repo::TaskRepositoryImpl;

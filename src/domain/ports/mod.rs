//! Ports (interfaces) consumed by the application layer.

pub mod agent_repository;
pub mod clock;
pub mod command;
pub mod errors;
pub mod memory_repository;
pub mod process;
pub mod scaling_repository;
pub mod swarm_repository;
pub mod task_repository;

pub use agent_repository::{AgentFilter, AgentRepository};
pub use clock::{Clock, IdSource, ManualClock, SystemClock, UuidSource};
pub use command::CommandExecutor;
pub use errors::{StorageError, StorageResult};
pub use memory_repository::MemoryRepository;
pub use process::{
    ProcessControl, ProcessError, ProcessReader, ProcessRunner, ProcessSpec, SpawnedProcess,
};
pub use scaling_repository::ScalingRepository;
pub use swarm_repository::SwarmRepository;
pub use task_repository::{TaskFilter, TaskRepository};

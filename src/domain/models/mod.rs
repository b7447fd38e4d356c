//! Domain models.

pub mod agent;
pub mod config;
pub mod memory;
pub mod metrics;
pub mod scaling;
pub mod swarm;
pub mod task;

pub use agent::{Agent, AgentMetrics, AgentSpec, AgentStatus, AgentType, ResourceCaps};
pub use config::{Config, CoordinatorConfig, MetricsConfig, ProcessConfig, RetryConfig};
pub use memory::MemoryEntry;
pub use metrics::{CompletionRecord, MetricsSample};
pub use scaling::{
    PolicyType, ScalingAction, ScalingActionStatus, ScalingKind, ScalingPolicy,
};
pub use swarm::{Swarm, SwarmMode, SwarmStatus, SwarmStrategy};
pub use task::{Task, TaskOutcome, TaskSpec, TaskStatus};

//! Application layer: long-running loops and orchestration.

pub mod auto_scaler;
pub mod command_executor;
pub mod coordinator;
pub mod metrics_collector;
pub mod process_manager;
pub mod retry;

pub use auto_scaler::AutoScaler;
pub use command_executor::ControlCommandExecutor;
pub use coordinator::{MetricsSnapshot, StatusReport, SwarmCoordinator};
pub use metrics_collector::{MetricsCollector, MetricsRing};
pub use process_manager::{AgentEvent, ProcessManager, TaskEnvelope};

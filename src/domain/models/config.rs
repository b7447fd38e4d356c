//! Application configuration model.
//!
//! Built once at startup and passed into constructors; nothing reads
//! configuration ambiently after that.

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database file.
    pub data_path: String,
    /// Shared token for console clients. When unset, auth is disabled and
    /// every connection is treated as authenticated.
    pub auth_token: Option<String>,
    pub bind_host: String,
    pub bind_port: u16,
    /// One of debug|info|warn|error.
    pub log_level: String,
    /// Hard ceiling on concurrently managed agents.
    pub max_agents: u32,
    /// Auto-scaler tick interval.
    pub scale_interval_ms: u64,
    /// Metrics sampler interval.
    pub metrics_interval_ms: u64,
    /// Console connection cap.
    pub max_connections: usize,
    pub coordinator: CoordinatorConfig,
    pub process: ProcessConfig,
    pub metrics: MetricsConfig,
    pub retry: RetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_path: ".apiary/apiary.db".to_string(),
            auth_token: None,
            bind_host: "127.0.0.1".to_string(),
            bind_port: 7700,
            log_level: "info".to_string(),
            max_agents: 10,
            scale_interval_ms: 30_000,
            metrics_interval_ms: 30_000,
            max_connections: 64,
            coordinator: CoordinatorConfig::default(),
            process: ProcessConfig::default(),
            metrics: MetricsConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

/// Swarm coordinator tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Pending-task ceiling; `submit_task` sheds load beyond it.
    pub max_queue_size: usize,
    /// Default retry budget for tasks that do not carry their own.
    pub max_task_retries: u32,
    /// Completions kept for latency / error-rate derivation.
    pub completion_window: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            max_task_retries: 3,
            completion_window: 50,
        }
    }
}

/// Agent subprocess supervision tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// Program executed for each agent.
    pub agent_command: String,
    pub agent_args: Vec<String>,
    /// Working directory for agent processes.
    pub working_dir: Option<String>,
    /// Window for the first heartbeat before spawn counts as failed.
    pub start_grace_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub max_missed_heartbeats: u32,
    /// Cooperative-stop window before force kill.
    pub stop_timeout_ms: u64,
    /// Whether crashed agents are respawned.
    pub restart_on_crash: bool,
    /// Restart budget per agent.
    pub max_restarts: u32,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            agent_command: "apiary-agent".to_string(),
            agent_args: Vec::new(),
            working_dir: None,
            start_grace_ms: 5_000,
            heartbeat_interval_ms: 2_000,
            max_missed_heartbeats: 3,
            stop_timeout_ms: 5_000,
            restart_on_crash: true,
            max_restarts: 3,
        }
    }
}

/// Metrics collector tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Ring capacity.
    pub ring_capacity: usize,
    /// Queue length above which the scaler treats load as high.
    pub queue_high_watermark: usize,
    /// Response time above which the scaler treats latency as high.
    pub response_time_high_ms: f64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 100,
            queue_high_watermark: 5,
            response_time_high_ms: 5_000.0,
        }
    }
}

/// Backoff policy for transient storage failures inside loops.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
        }
    }
}

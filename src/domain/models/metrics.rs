//! Metrics sample model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One periodic observation of the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSample {
    pub ts: DateTime<Utc>,
    /// Process-group CPU, percent 0-100.
    pub cpu_pct: f64,
    /// Process-group memory, percent of system total.
    pub mem_pct: f64,
    /// Pending + running tasks.
    pub queue_len: usize,
    /// Agents in starting/idle/busy states.
    pub active_agents: usize,
    pub idle_agents: usize,
    /// Tasks completed per minute over the trailing sample window.
    pub throughput_tpm: f64,
    /// p50 over the trailing completion window.
    pub response_time_ms: f64,
    /// Failures over terminal outcomes in the trailing window, percent.
    pub error_rate_pct: f64,
}

impl MetricsSample {
    pub fn empty(ts: DateTime<Utc>) -> Self {
        Self {
            ts,
            cpu_pct: 0.0,
            mem_pct: 0.0,
            queue_len: 0,
            active_agents: 0,
            idle_agents: 0,
            throughput_tpm: 0.0,
            response_time_ms: 0.0,
            error_rate_pct: 0.0,
        }
    }
}

/// Snapshot of recent task completions used to derive latency and error
/// rate. Maintained by the coordinator, read by the metrics collector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub failed: bool,
}

//! Scaling policy and scaling action models.
//!
//! A policy is the tuple of bounds and thresholds governing the
//! auto-scaler. Actions are the append-only record of every scaling
//! decision and its outcome.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyType {
    Manual,
    Auto,
    Scheduled,
    DemandBased,
}

impl Default for PolicyType {
    fn default() -> Self {
        Self::Auto
    }
}

impl PolicyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Auto => "auto",
            Self::Scheduled => "scheduled",
            Self::DemandBased => "demand-based",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "manual" => Some(Self::Manual),
            "auto" => Some(Self::Auto),
            "scheduled" => Some(Self::Scheduled),
            "demand-based" | "demand_based" => Some(Self::DemandBased),
            _ => None,
        }
    }
}

/// Bounds and thresholds governing auto-scaling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingPolicy {
    pub id: Uuid,
    pub name: String,
    pub policy_type: PolicyType,
    pub min_agents: u32,
    pub max_agents: u32,
    /// Percent 0-100.
    pub target_utilization: f64,
    /// CPU percent above which scale-up is eligible.
    pub scale_up_threshold: f64,
    /// CPU percent below which scale-down is eligible.
    pub scale_down_threshold: f64,
    pub cooldown_seconds: u64,
    /// Metric names this policy consults.
    pub metrics: Vec<String>,
    pub enabled: bool,
    pub last_triggered_at: Option<DateTime<Utc>>,
}

impl ScalingPolicy {
    pub fn new(id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            policy_type: PolicyType::Auto,
            min_agents: 1,
            max_agents: 10,
            target_utilization: 70.0,
            scale_up_threshold: 80.0,
            scale_down_threshold: 30.0,
            cooldown_seconds: 300,
            metrics: vec!["cpu".to_string(), "queue_len".to_string()],
            enabled: true,
            last_triggered_at: None,
        }
    }

    /// Enforce the bound and hysteresis invariants. Called on every policy
    /// write; a policy that fails here is never adopted.
    pub fn validate(&self) -> Result<(), String> {
        if self.min_agents == 0 {
            return Err("min_agents must be at least 1".to_string());
        }
        if self.min_agents > self.max_agents {
            return Err(format!(
                "min_agents ({}) exceeds max_agents ({})",
                self.min_agents, self.max_agents
            ));
        }
        if !(0.0..=100.0).contains(&self.target_utilization) {
            return Err(format!(
                "target_utilization {} out of range 0-100",
                self.target_utilization
            ));
        }
        // Strict hysteresis band: down < target < up.
        if self.scale_down_threshold >= self.target_utilization {
            return Err(format!(
                "scale_down_threshold ({}) must be strictly below target_utilization ({})",
                self.scale_down_threshold, self.target_utilization
            ));
        }
        if self.scale_up_threshold <= self.target_utilization {
            return Err(format!(
                "scale_up_threshold ({}) must be strictly above target_utilization ({})",
                self.scale_up_threshold, self.target_utilization
            ));
        }
        Ok(())
    }

    /// Whether the cooldown window has elapsed.
    pub fn cooldown_elapsed(&self, now: DateTime<Utc>) -> bool {
        match self.last_triggered_at {
            None => true,
            Some(last) => {
                let elapsed = now.signed_duration_since(last);
                elapsed >= chrono::Duration::seconds(self.cooldown_seconds as i64)
            }
        }
    }
}

/// Direction of one scaling decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingKind {
    Up,
    Down,
    Rebalance,
}

impl ScalingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
            Self::Rebalance => "rebalance",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "up" => Some(Self::Up),
            "down" => Some(Self::Down),
            "rebalance" => Some(Self::Rebalance),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingActionStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl ScalingActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Append-only record of one scale up/down/rebalance and its outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingAction {
    pub id: Uuid,
    pub kind: ScalingKind,
    pub reason: String,
    pub from_count: u32,
    pub to_count: u32,
    pub requested_at: DateTime<Utc>,
    pub status: ScalingActionStatus,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
}

impl ScalingAction {
    pub fn new(
        id: Uuid,
        kind: ScalingKind,
        reason: impl Into<String>,
        from_count: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            kind,
            reason: reason.into(),
            from_count,
            to_count: from_count,
            requested_at: now,
            status: ScalingActionStatus::Pending,
            duration_ms: None,
            error: None,
        }
    }

    pub fn begin(&mut self) {
        self.status = ScalingActionStatus::InProgress;
    }

    pub fn complete(&mut self, to_count: u32, now: DateTime<Utc>) {
        self.to_count = to_count;
        self.status = ScalingActionStatus::Completed;
        self.duration_ms = Some(
            now.signed_duration_since(self.requested_at)
                .num_milliseconds()
                .max(0) as u64,
        );
    }

    pub fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.status = ScalingActionStatus::Failed;
        self.error = Some(error.into());
        self.duration_ms = Some(
            now.signed_duration_since(self.requested_at)
                .num_milliseconds()
                .max(0) as u64,
        );
    }
}

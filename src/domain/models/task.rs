//! Task domain model.
//!
//! Tasks are the units of work queued by callers and executed by agents.
//! Dependencies form a DAG; cycles are rejected at submission.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Status of a task in the execution pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Queued; may still be waiting on dependencies.
    Pending,
    /// Handed to an agent, awaiting its ack.
    Assigned,
    /// Agent acknowledged and is executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Exhausted retries or failed terminally.
    Failed,
    /// Withdrawn by a caller or a deadline.
    Cancelled,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "assigned" => Some(Self::Assigned),
            "running" => Some(Self::Running),
            "completed" | "complete" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Valid transitions from this status. Re-entry into `Pending` happens
    /// only via retry after an agent failure.
    pub fn valid_transitions(&self) -> &'static [TaskStatus] {
        match self {
            Self::Pending => &[Self::Assigned, Self::Cancelled],
            Self::Assigned => &[Self::Running, Self::Pending, Self::Failed, Self::Cancelled],
            Self::Running => &[Self::Completed, Self::Failed, Self::Pending, Self::Cancelled],
            Self::Completed | Self::Failed | Self::Cancelled => &[],
        }
    }

    pub fn can_transition_to(&self, new_status: Self) -> bool {
        self.valid_transitions().contains(&new_status)
    }
}

/// Outcome reported by an agent for one task attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Success,
    Failure,
}

/// Caller-supplied description of a task to submit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub task_type: String,
    pub description: String,
    /// 0 lowest, 10 highest.
    #[serde(default)]
    pub priority: u8,
    #[serde(default)]
    pub dependencies: Vec<Uuid>,
    /// Capability tags an agent must carry to score on this task.
    #[serde(default)]
    pub required_caps: Vec<String>,
    #[serde(default)]
    pub input: Option<Value>,
    /// Optional wall-clock deadline.
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl TaskSpec {
    pub fn new(task_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            description: description.into(),
            priority: 5,
            dependencies: Vec::new(),
            required_caps: Vec::new(),
            input: None,
            deadline: None,
            max_retries: None,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependency(mut self, dep: Uuid) -> Self {
        if !self.dependencies.contains(&dep) {
            self.dependencies.push(dep);
        }
        self
    }

    pub fn with_required_cap(mut self, cap: impl Into<String>) -> Self {
        self.required_caps.push(cap.into());
        self
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.task_type.trim().is_empty() {
            return Err("Task type cannot be empty".to_string());
        }
        if self.description.trim().is_empty() {
            return Err("Task description cannot be empty".to_string());
        }
        if self.priority > 10 {
            return Err(format!("Priority {} out of range 0-10", self.priority));
        }
        Ok(())
    }
}

/// A unit of work owned by the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub task_type: String,
    pub description: String,
    pub priority: u8,
    pub status: TaskStatus,
    pub dependencies: Vec<Uuid>,
    pub required_caps: Vec<String>,
    pub assigned_to: Option<Uuid>,
    pub input: Option<Value>,
    pub result: Option<Value>,
    pub error: Option<String>,
    /// Number of delivery attempts, including the current one.
    pub attempt_count: u32,
    pub max_retries: u32,
    pub deadline: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn from_spec(id: Uuid, spec: &TaskSpec, default_max_retries: u32, now: DateTime<Utc>) -> Self {
        Self {
            id,
            task_type: spec.task_type.clone(),
            description: spec.description.clone(),
            priority: spec.priority,
            status: TaskStatus::Pending,
            dependencies: spec.dependencies.clone(),
            required_caps: spec.required_caps.clone(),
            assigned_to: None,
            input: spec.input.clone(),
            result: None,
            error: None,
            attempt_count: 0,
            max_retries: spec.max_retries.unwrap_or(default_max_retries),
            deadline: spec.deadline,
            created_at: now,
            started_at: None,
            ended_at: None,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn can_transition_to(&self, new_status: TaskStatus) -> bool {
        self.status.can_transition_to(new_status)
    }

    /// Transition through the state machine, stamping timestamps.
    pub fn transition_to(
        &mut self,
        new_status: TaskStatus,
        now: DateTime<Utc>,
    ) -> Result<(), String> {
        if !self.can_transition_to(new_status) {
            return Err(format!(
                "Cannot transition task from {} to {}",
                self.status.as_str(),
                new_status.as_str()
            ));
        }
        self.status = new_status;
        self.updated_at = now;
        match new_status {
            TaskStatus::Running => self.started_at = Some(now),
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => {
                self.ended_at = Some(now);
            }
            TaskStatus::Pending => {
                // Requeue: the assignment is void.
                self.assigned_to = None;
            }
            TaskStatus::Assigned => {}
        }
        Ok(())
    }

    /// Force a status, bypassing the state machine. Quarantine and crash
    /// recovery only; every call is logged.
    pub fn force_status(&mut self, new_status: TaskStatus, now: DateTime<Utc>, reason: &str) {
        tracing::warn!(
            task_id = %self.id,
            from = self.status.as_str(),
            to = new_status.as_str(),
            reason,
            "Forcing task status transition"
        );
        self.status = new_status;
        self.updated_at = now;
        match new_status {
            TaskStatus::Running => self.started_at = Some(now),
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => {
                self.ended_at = Some(now);
            }
            _ => {}
        }
    }

    /// Whether a failed attempt may be retried.
    pub fn can_retry(&self) -> bool {
        self.attempt_count < self.max_retries.saturating_add(1)
    }

    /// Whether the deadline has passed.
    pub fn past_deadline(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|d| now > d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(spec: &TaskSpec) -> Task {
        Task::from_spec(Uuid::new_v4(), spec, 3, Utc::now())
    }

    #[test]
    fn test_spec_validation() {
        assert!(TaskSpec::new("echo", "say hello").validate().is_ok());
        assert!(TaskSpec::new("", "x").validate().is_err());
        assert!(TaskSpec::new("echo", "   ").validate().is_err());
        assert!(TaskSpec::new("echo", "x").with_priority(11).validate().is_err());
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut t = task(&TaskSpec::new("echo", "hello"));
        let now = Utc::now();
        t.transition_to(TaskStatus::Assigned, now).unwrap();
        t.transition_to(TaskStatus::Running, now).unwrap();
        assert!(t.started_at.is_some());
        t.transition_to(TaskStatus::Completed, now).unwrap();
        assert!(t.ended_at.is_some());
        assert!(t.is_terminal());
    }

    #[test]
    fn test_requeue_clears_assignment() {
        let mut t = task(&TaskSpec::new("echo", "hello"));
        let now = Utc::now();
        t.assigned_to = Some(Uuid::new_v4());
        t.transition_to(TaskStatus::Assigned, now).unwrap();
        t.transition_to(TaskStatus::Running, now).unwrap();
        t.transition_to(TaskStatus::Pending, now).unwrap();
        assert_eq!(t.assigned_to, None);
    }

    #[test]
    fn test_invalid_transitions() {
        let mut t = task(&TaskSpec::new("echo", "hello"));
        let now = Utc::now();
        // Pending cannot jump straight to running or completed.
        assert!(t.transition_to(TaskStatus::Running, now).is_err());
        assert!(t.transition_to(TaskStatus::Completed, now).is_err());

        t.transition_to(TaskStatus::Cancelled, now).unwrap();
        // Terminal states are sinks.
        assert!(t.transition_to(TaskStatus::Pending, now).is_err());
        assert!(t.transition_to(TaskStatus::Assigned, now).is_err());
    }

    #[test]
    fn test_cancel_from_any_non_terminal() {
        for setup in [
            &[] as &[TaskStatus],
            &[TaskStatus::Assigned],
            &[TaskStatus::Assigned, TaskStatus::Running],
        ] {
            let mut t = task(&TaskSpec::new("echo", "hello"));
            let now = Utc::now();
            for s in setup {
                t.transition_to(*s, now).unwrap();
            }
            assert!(t.transition_to(TaskStatus::Cancelled, now).is_ok());
        }
    }

    #[test]
    fn test_retry_budget() {
        let mut t = task(&TaskSpec::new("echo", "hello"));
        t.max_retries = 2;
        t.attempt_count = 1;
        assert!(t.can_retry());
        t.attempt_count = 3;
        assert!(!t.can_retry());
    }

    #[test]
    fn test_deadline() {
        let now = Utc::now();
        let mut t = task(&TaskSpec::new("echo", "hello"));
        assert!(!t.past_deadline(now));
        t.deadline = Some(now - chrono::Duration::seconds(1));
        assert!(t.past_deadline(now));
    }
}

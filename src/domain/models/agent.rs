//! Agent domain model.
//!
//! An agent is one managed worker subprocess. The coordinator owns the
//! authoritative agent records; the process manager materializes them into
//! OS processes and keeps their status fresh.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Closed set of agent specializations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Researcher,
    Coder,
    Analyst,
    Coordinator,
    Tester,
    Reviewer,
    Architect,
    Optimizer,
    Documenter,
    Monitor,
    Specialist,
    Security,
    Devops,
    General,
}

impl Default for AgentType {
    fn default() -> Self {
        Self::General
    }
}

impl AgentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Researcher => "researcher",
            Self::Coder => "coder",
            Self::Analyst => "analyst",
            Self::Coordinator => "coordinator",
            Self::Tester => "tester",
            Self::Reviewer => "reviewer",
            Self::Architect => "architect",
            Self::Optimizer => "optimizer",
            Self::Documenter => "documenter",
            Self::Monitor => "monitor",
            Self::Specialist => "specialist",
            Self::Security => "security",
            Self::Devops => "devops",
            Self::General => "general",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "researcher" => Some(Self::Researcher),
            "coder" => Some(Self::Coder),
            "analyst" => Some(Self::Analyst),
            "coordinator" => Some(Self::Coordinator),
            "tester" => Some(Self::Tester),
            "reviewer" => Some(Self::Reviewer),
            "architect" => Some(Self::Architect),
            "optimizer" => Some(Self::Optimizer),
            "documenter" => Some(Self::Documenter),
            "monitor" => Some(Self::Monitor),
            "specialist" => Some(Self::Specialist),
            "security" => Some(Self::Security),
            "devops" => Some(Self::Devops),
            "general" => Some(Self::General),
            _ => None,
        }
    }

    /// Capability tags implied by the type, used when a spec carries none.
    pub fn default_capabilities(&self) -> Vec<String> {
        let caps: &[&str] = match self {
            Self::Researcher => &["research", "analysis"],
            Self::Coder => &["code", "implement"],
            Self::Analyst => &["analysis", "data"],
            Self::Coordinator => &["coordinate", "plan"],
            Self::Tester => &["test", "verify"],
            Self::Reviewer => &["review", "code"],
            Self::Architect => &["design", "plan"],
            Self::Optimizer => &["optimize", "profile"],
            Self::Documenter => &["document", "write"],
            Self::Monitor => &["monitor", "observe"],
            Self::Specialist => &["specialist"],
            Self::Security => &["security", "audit"],
            Self::Devops => &["deploy", "infra"],
            Self::General => &[],
        };
        caps.iter().map(|c| (*c).to_string()).collect()
    }
}

/// Lifecycle status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Process spawned, waiting for the first heartbeat.
    Starting,
    /// Ready for assignment.
    Idle,
    /// At least one task assigned.
    Busy,
    /// Cooperative shutdown in progress.
    Stopping,
    /// Process gone, record retained.
    Stopped,
    /// Crashed or lost heartbeats.
    Error,
}

impl Default for AgentStatus {
    fn default() -> Self {
        Self::Starting
    }
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "starting" => Some(Self::Starting),
            "idle" => Some(Self::Idle),
            "busy" => Some(Self::Busy),
            "stopping" => Some(Self::Stopping),
            "stopped" => Some(Self::Stopped),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// Whether the agent can be handed new work.
    pub fn is_schedulable(&self) -> bool {
        matches!(self, Self::Idle | Self::Busy)
    }

    /// Whether the underlying process is expected to be alive.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Starting | Self::Idle | Self::Busy | Self::Stopping)
    }

    /// Valid transitions from this status.
    ///
    /// Crash and heartbeat loss promote any live state to `Error`, which is
    /// why `Error` appears in every non-terminal row.
    pub fn valid_transitions(&self) -> &'static [AgentStatus] {
        match self {
            Self::Starting => &[Self::Idle, Self::Stopping, Self::Error],
            Self::Idle => &[Self::Busy, Self::Stopping, Self::Error],
            Self::Busy => &[Self::Idle, Self::Stopping, Self::Error],
            Self::Stopping => &[Self::Stopped, Self::Error],
            Self::Stopped => &[],
            // Restart policy permitting, an errored agent respawns.
            Self::Error => &[Self::Starting, Self::Stopped],
        }
    }

    pub fn can_transition_to(&self, new_status: Self) -> bool {
        self.valid_transitions().contains(&new_status)
    }
}

/// Per-agent resource bounds applied by the process manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceCaps {
    /// Hard memory ceiling for the subprocess.
    pub max_memory_bytes: u64,
    /// How many tasks the agent may run at once.
    pub max_concurrent_tasks: u32,
    /// Wall-clock ceiling per task.
    pub wall_timeout_ms: u64,
}

impl Default for ResourceCaps {
    fn default() -> Self {
        Self {
            max_memory_bytes: 512 * 1024 * 1024,
            max_concurrent_tasks: 1,
            wall_timeout_ms: 300_000,
        }
    }
}

impl ResourceCaps {
    /// Reject nonsense values before any process is spawned.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_memory_bytes == 0 {
            return Err("max_memory_bytes must be positive".to_string());
        }
        if self.max_concurrent_tasks == 0 {
            return Err("max_concurrent_tasks must be at least 1".to_string());
        }
        if self.wall_timeout_ms == 0 {
            return Err("wall_timeout_ms must be positive".to_string());
        }
        Ok(())
    }
}

/// Lifetime execution counters for one agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub last_activity_at: Option<DateTime<Utc>>,
    /// When the current process (if any) was started.
    pub started_at: Option<DateTime<Utc>>,
}

impl AgentMetrics {
    /// Fraction of completions among terminal outcomes; 1.0 when unproven.
    pub fn success_rate(&self) -> f64 {
        let total = self.tasks_completed + self.tasks_failed;
        if total == 0 {
            1.0
        } else {
            self.tasks_completed as f64 / total as f64
        }
    }
}

/// Caller-supplied description of an agent to create.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub name: Option<String>,
    pub agent_type: AgentType,
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub caps: ResourceCaps,
}

impl AgentSpec {
    pub fn new(agent_type: AgentType) -> Self {
        Self {
            name: None,
            agent_type,
            capabilities: agent_type.default_capabilities(),
            caps: ResourceCaps::default(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_capability(mut self, cap: impl Into<String>) -> Self {
        self.capabilities.push(cap.into());
        self
    }

    pub fn with_caps(mut self, caps: ResourceCaps) -> Self {
        self.caps = caps;
        self
    }
}

/// Authoritative agent record owned by the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub name: String,
    pub agent_type: AgentType,
    pub capabilities: Vec<String>,
    pub status: AgentStatus,
    pub caps: ResourceCaps,
    /// OS pid of the live process, if any. Must be `None` once stopped.
    pub pid: Option<u32>,
    pub metrics: AgentMetrics,
    /// Tasks currently assigned to this agent.
    pub assigned_tasks: Vec<Uuid>,
    /// Swarm membership; an agent belongs to at most one swarm.
    pub swarm_id: Option<Uuid>,
    /// Consecutive restarts after crashes.
    pub restart_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    pub fn from_spec(id: Uuid, spec: &AgentSpec, now: DateTime<Utc>) -> Self {
        let name = spec
            .name
            .clone()
            .unwrap_or_else(|| format!("{}-{}", spec.agent_type.as_str(), &id.to_string()[..8]));
        Self {
            id,
            name,
            agent_type: spec.agent_type,
            capabilities: spec.capabilities.clone(),
            status: AgentStatus::Starting,
            caps: spec.caps,
            pid: None,
            metrics: AgentMetrics::default(),
            assigned_tasks: Vec::new(),
            swarm_id: None,
            restart_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn can_transition_to(&self, new_status: AgentStatus) -> bool {
        self.status.can_transition_to(new_status)
    }

    /// Transition through the state machine, keeping invariants intact.
    pub fn transition_to(
        &mut self,
        new_status: AgentStatus,
        now: DateTime<Utc>,
    ) -> Result<(), String> {
        if !self.can_transition_to(new_status) {
            return Err(format!(
                "Cannot transition agent from {} to {}",
                self.status.as_str(),
                new_status.as_str()
            ));
        }
        self.status = new_status;
        self.updated_at = now;
        if new_status == AgentStatus::Stopped || new_status == AgentStatus::Error {
            self.pid = None;
        }
        Ok(())
    }

    /// Force a status, bypassing the state machine. Crash recovery and
    /// quarantine only; every call is logged.
    pub fn force_status(&mut self, new_status: AgentStatus, now: DateTime<Utc>, reason: &str) {
        tracing::warn!(
            agent_id = %self.id,
            from = self.status.as_str(),
            to = new_status.as_str(),
            reason,
            "Forcing agent status transition"
        );
        self.status = new_status;
        self.updated_at = now;
        if new_status == AgentStatus::Stopped || new_status == AgentStatus::Error {
            self.pid = None;
        }
    }

    pub fn current_task_count(&self) -> usize {
        self.assigned_tasks.len()
    }

    /// Idle, or busy with spare concurrency.
    pub fn has_capacity(&self) -> bool {
        match self.status {
            AgentStatus::Idle => true,
            AgentStatus::Busy => {
                (self.assigned_tasks.len() as u32) < self.caps.max_concurrent_tasks
            }
            _ => false,
        }
    }

    pub fn has_capability(&self, cap: &str) -> bool {
        self.capabilities.iter().any(|c| c == cap)
    }

    /// Record an assignment and flip to busy.
    pub fn assign(&mut self, task_id: Uuid, now: DateTime<Utc>) {
        if !self.assigned_tasks.contains(&task_id) {
            self.assigned_tasks.push(task_id);
        }
        self.status = AgentStatus::Busy;
        self.metrics.last_activity_at = Some(now);
        self.updated_at = now;
    }

    /// Drop an assignment; returns to idle when nothing remains and the
    /// agent is not mid-shutdown.
    pub fn release(&mut self, task_id: Uuid, now: DateTime<Utc>) {
        self.assigned_tasks.retain(|t| *t != task_id);
        if self.assigned_tasks.is_empty() && self.status == AgentStatus::Busy {
            self.status = AgentStatus::Idle;
        }
        self.metrics.last_activity_at = Some(now);
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn test_agent_type_round_trip() {
        for t in [
            AgentType::Researcher,
            AgentType::Coder,
            AgentType::Security,
            AgentType::General,
        ] {
            assert_eq!(AgentType::parse_str(t.as_str()), Some(t));
        }
        assert_eq!(AgentType::parse_str("wizard"), None);
    }

    #[test]
    fn test_agent_lifecycle_transitions() {
        let spec = AgentSpec::new(AgentType::Coder);
        let mut agent = Agent::from_spec(Uuid::new_v4(), &spec, now());
        assert_eq!(agent.status, AgentStatus::Starting);

        agent.transition_to(AgentStatus::Idle, now()).unwrap();
        agent.transition_to(AgentStatus::Busy, now()).unwrap();
        agent.transition_to(AgentStatus::Idle, now()).unwrap();
        agent.transition_to(AgentStatus::Stopping, now()).unwrap();
        agent.transition_to(AgentStatus::Stopped, now()).unwrap();

        // Terminal: nothing leaves stopped.
        assert!(agent.transition_to(AgentStatus::Idle, now()).is_err());
    }

    #[test]
    fn test_stopped_clears_pid() {
        let spec = AgentSpec::new(AgentType::Tester);
        let mut agent = Agent::from_spec(Uuid::new_v4(), &spec, now());
        agent.pid = Some(4242);
        agent.transition_to(AgentStatus::Idle, now()).unwrap();
        agent.transition_to(AgentStatus::Stopping, now()).unwrap();
        agent.transition_to(AgentStatus::Stopped, now()).unwrap();
        assert_eq!(agent.pid, None);
    }

    #[test]
    fn test_error_allows_restart() {
        let spec = AgentSpec::new(AgentType::General);
        let mut agent = Agent::from_spec(Uuid::new_v4(), &spec, now());
        agent.transition_to(AgentStatus::Idle, now()).unwrap();
        agent.transition_to(AgentStatus::Error, now()).unwrap();
        assert!(agent.can_transition_to(AgentStatus::Starting));
        assert!(agent.can_transition_to(AgentStatus::Stopped));
        assert!(!agent.can_transition_to(AgentStatus::Busy));
    }

    #[test]
    fn test_capacity() {
        let spec = AgentSpec::new(AgentType::Coder).with_caps(ResourceCaps {
            max_concurrent_tasks: 2,
            ..ResourceCaps::default()
        });
        let mut agent = Agent::from_spec(Uuid::new_v4(), &spec, now());
        agent.transition_to(AgentStatus::Idle, now()).unwrap();
        assert!(agent.has_capacity());

        agent.assign(Uuid::new_v4(), now());
        assert_eq!(agent.status, AgentStatus::Busy);
        assert!(agent.has_capacity());

        agent.assign(Uuid::new_v4(), now());
        assert!(!agent.has_capacity());
    }

    #[test]
    fn test_release_returns_to_idle() {
        let spec = AgentSpec::new(AgentType::Coder);
        let mut agent = Agent::from_spec(Uuid::new_v4(), &spec, now());
        agent.transition_to(AgentStatus::Idle, now()).unwrap();

        let task = Uuid::new_v4();
        agent.assign(task, now());
        assert_eq!(agent.status, AgentStatus::Busy);

        agent.release(task, now());
        assert_eq!(agent.status, AgentStatus::Idle);
        assert!(agent.assigned_tasks.is_empty());
    }

    #[test]
    fn test_caps_validation() {
        assert!(ResourceCaps::default().validate().is_ok());
        let bad = ResourceCaps { max_memory_bytes: 0, ..ResourceCaps::default() };
        assert!(bad.validate().is_err());
        let bad = ResourceCaps { max_concurrent_tasks: 0, ..ResourceCaps::default() };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_success_rate() {
        let mut m = AgentMetrics::default();
        assert!((m.success_rate() - 1.0).abs() < f64::EPSILON);
        m.tasks_completed = 3;
        m.tasks_failed = 1;
        assert!((m.success_rate() - 0.75).abs() < f64::EPSILON);
    }
}

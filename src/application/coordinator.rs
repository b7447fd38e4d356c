//! Swarm coordinator.
//!
//! Owns the authoritative agent, task, and swarm maps and decides which
//! agent runs which task, when. External code never mutates the maps;
//! reads go through the state lock, writes happen in the API methods and
//! the serial event loop. Persistence calls and process-manager calls
//! are made outside the critical sections.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, Mutex, Notify, RwLock};
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::application::process_manager::{AgentEvent, ProcessManager, TaskEnvelope};
use crate::application::retry::retry_storage;
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    Agent, AgentSpec, AgentStatus, AgentType, CompletionRecord, Config, Swarm, SwarmMode,
    SwarmStatus, SwarmStrategy, Task, TaskOutcome, TaskSpec, TaskStatus,
};
use crate::domain::ports::{
    AgentFilter, AgentRepository, Clock, IdSource, SwarmRepository, TaskFilter, TaskRepository,
};
use crate::services::dependency_resolver::DependencyResolver;
use crate::services::event_bus::{EventBus, EventPayload};
use crate::services::{plan_assignments, EligibleAgent, ReadyTask};

/// Counts by state plus uptime, returned by `get_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub uptime_ms: u64,
    pub agents_total: usize,
    pub agents_by_status: HashMap<String, usize>,
    pub tasks_total: usize,
    pub tasks_by_status: HashMap<String, usize>,
    pub swarms_active: usize,
    pub queue_len: usize,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
}

/// Snapshot handed to the metrics collector.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub queue_len: usize,
    pub active_agents: usize,
    pub idle_agents: usize,
    pub completions: Vec<CompletionRecord>,
}

struct CoordinatorState {
    agents: HashMap<Uuid, Agent>,
    tasks: HashMap<Uuid, Task>,
    swarms: HashMap<Uuid, Swarm>,
    completions: VecDeque<CompletionRecord>,
    tasks_completed: u64,
    tasks_failed: u64,
}

impl CoordinatorState {
    fn new() -> Self {
        Self {
            agents: HashMap::new(),
            tasks: HashMap::new(),
            swarms: HashMap::new(),
            completions: VecDeque::new(),
            tasks_completed: 0,
            tasks_failed: 0,
        }
    }

    fn pending_count(&self) -> usize {
        self.tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .count()
    }

    fn queue_len(&self) -> usize {
        self.tasks
            .values()
            .filter(|t| {
                matches!(
                    t.status,
                    TaskStatus::Pending | TaskStatus::Assigned | TaskStatus::Running
                )
            })
            .count()
    }

    fn push_completion(&mut self, record: CompletionRecord, window: usize) {
        self.completions.push_back(record);
        while self.completions.len() > window {
            self.completions.pop_front();
        }
    }
}

/// The control plane's authoritative registry and scheduler.
pub struct SwarmCoordinator {
    state: RwLock<CoordinatorState>,
    agent_repo: Arc<dyn AgentRepository>,
    task_repo: Arc<dyn TaskRepository>,
    swarm_repo: Arc<dyn SwarmRepository>,
    apm: Arc<ProcessManager>,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdSource>,
    config: Config,
    resolver: DependencyResolver,
    notify: Notify,
    events_rx: Mutex<Option<mpsc::Receiver<AgentEvent>>>,
    shutdown_tx: broadcast::Sender<()>,
    started_at: DateTime<Utc>,
}

impl SwarmCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agent_repo: Arc<dyn AgentRepository>,
        task_repo: Arc<dyn TaskRepository>,
        swarm_repo: Arc<dyn SwarmRepository>,
        apm: Arc<ProcessManager>,
        events_rx: mpsc::Receiver<AgentEvent>,
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdSource>,
        config: Config,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let started_at = clock.now();
        Self {
            state: RwLock::new(CoordinatorState::new()),
            agent_repo,
            task_repo,
            swarm_repo,
            apm,
            bus,
            clock,
            ids,
            config,
            resolver: DependencyResolver::new(),
            notify: Notify::new(),
            events_rx: Mutex::new(Some(events_rx)),
            shutdown_tx,
            started_at,
        }
    }

    /// Load persisted records and reconcile stale runtime state. Agents
    /// that claimed to be live before the restart have no process now:
    /// they are quarantined to `error`, and their in-flight tasks are
    /// requeued.
    pub async fn recover(&self) -> DomainResult<()> {
        let now = self.clock.now();
        let agents = self.agent_repo.list(AgentFilter::default()).await?;
        let tasks = self.task_repo.list(TaskFilter::default()).await?;
        let swarms = self.swarm_repo.list().await?;

        let mut dirty_agents = Vec::new();
        let mut dirty_tasks = Vec::new();
        {
            let mut state = self.state.write().await;
            for mut agent in agents {
                if agent.status.is_live() {
                    agent.force_status(AgentStatus::Error, now, "stale after restart");
                    agent.assigned_tasks.clear();
                    dirty_agents.push(agent.clone());
                }
                state.agents.insert(agent.id, agent);
            }
            for mut task in tasks {
                if matches!(task.status, TaskStatus::Assigned | TaskStatus::Running) {
                    task.force_status(TaskStatus::Pending, now, "orphaned by restart");
                    task.assigned_to = None;
                    dirty_tasks.push(task.clone());
                }
                state.tasks.insert(task.id, task);
            }
            for swarm in swarms {
                state.swarms.insert(swarm.id, swarm);
            }
        }

        for agent in &dirty_agents {
            self.persist_agent(agent).await;
        }
        for task in &dirty_tasks {
            self.persist_task(task).await;
        }
        if !dirty_agents.is_empty() || !dirty_tasks.is_empty() {
            info!(
                agents = dirty_agents.len(),
                tasks = dirty_tasks.len(),
                "Reconciled stale records after restart"
            );
        }
        Ok(())
    }

    /// Spawn the serial event loop. Call once.
    pub fn start(self: &Arc<Self>) {
        let rx = self
            .events_rx
            .try_lock()
            .ok()
            .and_then(|mut guard| guard.take());
        let Some(rx) = rx else {
            warn!("Coordinator loop already started");
            return;
        };
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            coordinator.run(rx).await;
        });
    }

    /// Signal the loop to stop, then drain processes and requeue
    /// in-flight work.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        self.apm
            .stop_all(Duration::from_millis(self.config.process.stop_timeout_ms * 2))
            .await;

        let now = self.clock.now();
        let mut dirty = Vec::new();
        {
            let mut state = self.state.write().await;
            for task in state.tasks.values_mut() {
                if matches!(task.status, TaskStatus::Assigned | TaskStatus::Running) {
                    task.force_status(TaskStatus::Pending, now, "drain on shutdown");
                    task.assigned_to = None;
                    dirty.push(task.clone());
                }
            }
        }
        for task in &dirty {
            self.persist_task(task).await;
        }
        info!(requeued = dirty.len(), "Coordinator drained");
    }

    // ========================
    // Agent API
    // ========================

    /// Register an agent and materialize its process.
    pub async fn register_agent(&self, spec: AgentSpec) -> DomainResult<Uuid> {
        spec.caps
            .validate()
            .map_err(DomainError::ResourceCaps)?;

        let now = self.clock.now();
        let id = self.ids.new_id();
        let mut agent = Agent::from_spec(id, &spec, now);

        // Limit check and insert under one lock so concurrent registers
        // cannot overshoot. Record first so a crash between spawn and
        // persist cannot lose an untracked process.
        {
            let mut state = self.state.write().await;
            let live = state.agents.values().filter(|a| a.status.is_live()).count();
            if live >= self.config.max_agents as usize {
                return Err(DomainError::LimitViolation(format!(
                    "agent limit {} reached",
                    self.config.max_agents
                )));
            }
            state.agents.insert(id, agent.clone());
        }
        self.persist_agent(&agent).await;

        match self.apm.start_agent(id, spec.caps).await {
            Ok(pid) => {
                let mut state = self.state.write().await;
                if let Some(stored) = state.agents.get_mut(&id) {
                    stored.pid = pid;
                    stored.metrics.started_at = Some(now);
                    agent = stored.clone();
                }
                drop(state);
                self.persist_agent(&agent).await;
                self.bus.publish(
                    EventPayload::AgentRegistered {
                        agent_id: id,
                        name: agent.name.clone(),
                        agent_type: agent.agent_type.as_str().to_string(),
                    },
                    now,
                );
                info!(agent_id = %id, agent_type = agent.agent_type.as_str(), "Agent registered");
                Ok(id)
            }
            Err(e) => {
                let mut state = self.state.write().await;
                if let Some(stored) = state.agents.get_mut(&id) {
                    stored.force_status(AgentStatus::Stopped, now, "spawn failed");
                    agent = stored.clone();
                }
                drop(state);
                self.persist_agent(&agent).await;
                Err(e)
            }
        }
    }

    /// Stop an agent's process. Idempotent.
    pub async fn stop_agent(
        &self,
        id: Uuid,
        graceful: bool,
        timeout_ms: Option<u64>,
    ) -> DomainResult<()> {
        let now = self.clock.now();
        let snapshot = {
            let mut state = self.state.write().await;
            let agent = state
                .agents
                .get_mut(&id)
                .ok_or(DomainError::AgentNotFound(id))?;
            let from = agent.status;
            match agent.status {
                AgentStatus::Stopped | AgentStatus::Stopping => None,
                AgentStatus::Error => {
                    // No process behind it; finish the record directly.
                    agent.force_status(AgentStatus::Stopped, now, "stop requested in error state");
                    Some((agent.clone(), from, false))
                }
                _ => {
                    agent
                        .transition_to(AgentStatus::Stopping, now)
                        .map_err(|_| DomainError::InvalidTransition {
                            from: from.as_str().to_string(),
                            to: AgentStatus::Stopping.as_str().to_string(),
                        })?;
                    Some((agent.clone(), from, true))
                }
            }
        };

        let Some((agent, from, has_process)) = snapshot else {
            return Ok(());
        };
        self.persist_agent(&agent).await;
        self.publish_agent_status(&agent, from, now);
        if has_process {
            self.apm.stop_agent(id, graceful, timeout_ms).await?;
        }
        Ok(())
    }

    /// Stop an agent and delete its record.
    pub async fn remove_agent(&self, id: Uuid, force: bool) -> DomainResult<()> {
        {
            let state = self.state.read().await;
            let agent = state
                .agents
                .get(&id)
                .ok_or(DomainError::AgentNotFound(id))?;
            if !force && !agent.assigned_tasks.is_empty() {
                return Err(DomainError::AgentInUse {
                    id,
                    reason: format!("{} assigned tasks", agent.assigned_tasks.len()),
                });
            }
        }

        if self.apm.is_running(id).await {
            self.apm.stop_agent(id, !force, None).await?;
        }

        let now = self.clock.now();
        {
            let mut state = self.state.write().await;
            if let Some(swarm_id) = state.agents.get(&id).and_then(|a| a.swarm_id) {
                if let Some(swarm) = state.swarms.get_mut(&swarm_id) {
                    swarm.remove_agent(id);
                }
            }
            state.agents.remove(&id);
        }
        if let Err(e) = retry_storage(&self.config.retry, || self.agent_repo.delete(id)).await {
            error!(agent_id = %id, error = %e, "Failed to delete agent record");
        }
        self.bus.publish(EventPayload::AgentRemoved { agent_id: id }, now);
        Ok(())
    }

    pub async fn get_agent(&self, id: Uuid) -> Option<Agent> {
        self.state.read().await.agents.get(&id).cloned()
    }

    pub async fn list_agents(&self, filter: &AgentFilter) -> Vec<Agent> {
        let state = self.state.read().await;
        let mut agents: Vec<Agent> = state
            .agents
            .values()
            .filter(|a| {
                filter.status.is_none_or(|s| a.status == s)
                    && filter.agent_type.is_none_or(|t| a.agent_type == t)
                    && filter
                        .swarm_id
                        .is_none_or(|sw| a.swarm_id == Some(sw))
                    && filter
                        .capability
                        .as_ref()
                        .is_none_or(|c| a.has_capability(c))
            })
            .cloned()
            .collect();
        agents.sort_by_key(|a| a.created_at);
        agents
    }

    // ========================
    // Task API
    // ========================

    /// Queue a task. Rejects cycles and sheds load when the pending
    /// queue is at capacity.
    pub async fn submit_task(&self, spec: TaskSpec) -> DomainResult<Uuid> {
        spec.validate().map_err(DomainError::ValidationFailed)?;

        let now = self.clock.now();
        let id = self.ids.new_id();
        let task = {
            let mut state = self.state.write().await;
            let pending = state.pending_count();
            if pending >= self.config.coordinator.max_queue_size {
                return Err(DomainError::QueueFull {
                    pending,
                    capacity: self.config.coordinator.max_queue_size,
                });
            }
            self.resolver
                .check_submission(id, &spec.dependencies, &state.tasks)?;

            let task = Task::from_spec(id, &spec, self.config.coordinator.max_task_retries, now);
            state.tasks.insert(id, task.clone());
            task
        };

        self.persist_task(&task).await;
        self.bus.publish(
            EventPayload::TaskSubmitted {
                task_id: id,
                task_type: task.task_type.clone(),
                priority: task.priority,
            },
            now,
        );
        debug!(task_id = %id, priority = task.priority, "Task submitted");
        self.notify.notify_one();
        Ok(id)
    }

    /// Cancel a non-terminal task.
    pub async fn cancel_task(&self, id: Uuid, reason: &str) -> DomainResult<()> {
        let now = self.clock.now();
        let (task, from, agent) = {
            let mut state = self.state.write().await;
            let task = state
                .tasks
                .get_mut(&id)
                .ok_or(DomainError::TaskNotFound(id))?;
            if task.is_terminal() {
                return Err(DomainError::InvalidTransition {
                    from: task.status.as_str().to_string(),
                    to: TaskStatus::Cancelled.as_str().to_string(),
                });
            }
            let from = task.status;
            task.transition_to(TaskStatus::Cancelled, now)
                .map_err(|_| DomainError::InvalidTransition {
                    from: from.as_str().to_string(),
                    to: TaskStatus::Cancelled.as_str().to_string(),
                })?;
            task.error = Some(reason.to_string());
            let task = task.clone();

            let agent = task.assigned_to.and_then(|agent_id| {
                let agent = state.agents.get_mut(&agent_id)?;
                agent.release(id, now);
                Some(agent.clone())
            });
            (task, from, agent)
        };

        self.persist_task(&task).await;
        if let Some(agent) = agent {
            self.persist_agent(&agent).await;
        }
        self.publish_task_status(&task, from, now);
        info!(task_id = %id, reason, "Task cancelled");
        self.notify.notify_one();
        Ok(())
    }

    pub async fn get_task(&self, id: Uuid) -> Option<Task> {
        self.state.read().await.tasks.get(&id).cloned()
    }

    pub async fn list_tasks(&self, filter: &TaskFilter) -> Vec<Task> {
        let state = self.state.read().await;
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| {
                filter.status.is_none_or(|s| t.status == s)
                    && filter
                        .task_type
                        .as_ref()
                        .is_none_or(|ty| t.task_type == *ty)
                    && filter
                        .assigned_to
                        .is_none_or(|a| t.assigned_to == Some(a))
            })
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            tasks.truncate(limit);
        }
        tasks
    }

    // ========================
    // Swarm API
    // ========================

    /// Create a swarm and spawn `agent_count` general agents into it.
    pub async fn create_swarm(
        &self,
        name: &str,
        agent_count: usize,
        mode: SwarmMode,
        strategy: SwarmStrategy,
    ) -> DomainResult<Uuid> {
        let now = self.clock.now();
        let swarm_id = self.ids.new_id();
        let mut swarm = Swarm::new(swarm_id, name, mode, strategy, now);

        for _ in 0..agent_count {
            let agent_id = self
                .register_agent(AgentSpec::new(AgentType::General))
                .await?;
            swarm.add_agent(agent_id);
            let snapshot = {
                let mut state = self.state.write().await;
                state.agents.get_mut(&agent_id).map(|agent| {
                    agent.swarm_id = Some(swarm_id);
                    agent.clone()
                })
            };
            if let Some(agent) = snapshot {
                self.persist_agent(&agent).await;
            }
        }

        self.state.write().await.swarms.insert(swarm_id, swarm.clone());
        self.persist_swarm(&swarm).await;
        self.bus.publish(
            EventPayload::SwarmCreated {
                swarm_id,
                name: name.to_string(),
                agent_count,
            },
            now,
        );
        info!(swarm_id = %swarm_id, agents = agent_count, "Swarm created");
        Ok(swarm_id)
    }

    pub async fn get_swarm(&self, id: Uuid) -> Option<Swarm> {
        self.state.read().await.swarms.get(&id).cloned()
    }

    pub async fn list_swarms(&self) -> Vec<Swarm> {
        let mut swarms: Vec<Swarm> = self.state.read().await.swarms.values().cloned().collect();
        swarms.sort_by_key(|s| s.created_at);
        swarms
    }

    /// Grow or shrink a swarm to `target` members, one agent at a time.
    pub async fn scale_swarm(&self, id: Uuid, target: usize) -> DomainResult<(usize, usize)> {
        let now = self.clock.now();
        let current = {
            let state = self.state.read().await;
            let swarm = state.swarms.get(&id).ok_or(DomainError::SwarmNotFound(id))?;
            swarm.agent_count()
        };
        if target > self.config.max_agents as usize {
            return Err(DomainError::LimitViolation(format!(
                "target {target} exceeds max_agents {}",
                self.config.max_agents
            )));
        }

        if target > current {
            for _ in current..target {
                let agent_id = self
                    .register_agent(AgentSpec::new(AgentType::General))
                    .await?;
                let snapshot = {
                    let mut state = self.state.write().await;
                    let snapshot = state.agents.get_mut(&agent_id).map(|agent| {
                        agent.swarm_id = Some(id);
                        agent.clone()
                    });
                    if let Some(swarm) = state.swarms.get_mut(&id) {
                        swarm.add_agent(agent_id);
                    }
                    snapshot
                };
                if let Some(agent) = snapshot {
                    self.persist_agent(&agent).await;
                }
            }
        } else {
            for _ in target..current {
                let victim = {
                    let state = self.state.read().await;
                    let swarm = state.swarms.get(&id).ok_or(DomainError::SwarmNotFound(id))?;
                    pick_scale_down_victim(
                        state
                            .agents
                            .values()
                            .filter(|a| swarm.agent_ids.contains(&a.id)),
                    )
                };
                let Some(victim) = victim else {
                    return Err(DomainError::LimitViolation(
                        "no idle agent eligible for removal".to_string(),
                    ));
                };
                self.stop_agent(victim, true, None).await?;
                let snapshot = {
                    let mut state = self.state.write().await;
                    if let Some(swarm) = state.swarms.get_mut(&id) {
                        swarm.remove_agent(victim);
                    }
                    state.agents.get_mut(&victim).map(|agent| {
                        agent.swarm_id = None;
                        agent.clone()
                    })
                };
                if let Some(agent) = snapshot {
                    self.persist_agent(&agent).await;
                }
            }
        }

        let swarm = {
            let state = self.state.read().await;
            state.swarms.get(&id).cloned()
        };
        if let Some(swarm) = swarm {
            self.persist_swarm(&swarm).await;
        }
        self.bus.publish(
            EventPayload::SwarmScaled {
                swarm_id: id,
                from_count: current,
                to_count: target,
            },
            now,
        );
        Ok((current, target))
    }

    // ========================
    // Status and scaling support
    // ========================

    pub async fn get_status(&self) -> StatusReport {
        let state = self.state.read().await;
        let mut agents_by_status: HashMap<String, usize> = HashMap::new();
        for agent in state.agents.values() {
            *agents_by_status
                .entry(agent.status.as_str().to_string())
                .or_insert(0) += 1;
        }
        let mut tasks_by_status: HashMap<String, usize> = HashMap::new();
        for task in state.tasks.values() {
            *tasks_by_status
                .entry(task.status.as_str().to_string())
                .or_insert(0) += 1;
        }
        let uptime_ms = self
            .clock
            .now()
            .signed_duration_since(self.started_at)
            .num_milliseconds()
            .max(0) as u64;

        StatusReport {
            uptime_ms,
            agents_total: state.agents.len(),
            agents_by_status,
            tasks_total: state.tasks.len(),
            tasks_by_status,
            swarms_active: state
                .swarms
                .values()
                .filter(|s| s.status == SwarmStatus::Active)
                .count(),
            queue_len: state.queue_len(),
            tasks_completed: state.tasks_completed,
            tasks_failed: state.tasks_failed,
        }
    }

    /// Counts and the completion window for the metrics collector.
    pub async fn metrics_snapshot(&self) -> MetricsSnapshot {
        let state = self.state.read().await;
        let active = state
            .agents
            .values()
            .filter(|a| matches!(a.status, AgentStatus::Starting | AgentStatus::Idle | AgentStatus::Busy))
            .count();
        let idle = state
            .agents
            .values()
            .filter(|a| a.status == AgentStatus::Idle)
            .count();
        MetricsSnapshot {
            queue_len: state.queue_len(),
            active_agents: active,
            idle_agents: idle,
            completions: state.completions.iter().copied().collect(),
        }
    }

    /// Live agents (starting/idle/busy/stopping), the population the
    /// auto-scaler bounds.
    pub async fn active_agent_count(&self) -> usize {
        let state = self.state.read().await;
        state.agents.values().filter(|a| a.status.is_live()).count()
    }

    /// Spawn one general-purpose agent on behalf of the auto-scaler.
    pub async fn spawn_for_scaler(&self) -> DomainResult<Uuid> {
        self.register_agent(AgentSpec::new(AgentType::General)).await
    }

    /// Choose and stop one agent for scale-down. Idle agents only;
    /// among idle, fewest lifetime completions first, then earliest
    /// process start.
    pub async fn stop_for_scaler(&self) -> DomainResult<Uuid> {
        let victim = {
            let state = self.state.read().await;
            pick_scale_down_victim(state.agents.values())
        };
        let Some(victim) = victim else {
            return Err(DomainError::LimitViolation(
                "no idle agent eligible for scale-down".to_string(),
            ));
        };
        self.stop_agent(victim, true, None).await?;
        Ok(victim)
    }

    // ========================
    // Event loop
    // ========================

    async fn run(self: Arc<Self>, mut events: mpsc::Receiver<AgentEvent>) {
        info!("Coordinator loop started");
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut sweep = interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        self.handle_agent_event(event).await;
                        self.run_assignment_pass().await;
                    }
                    None => break,
                },
                _ = self.notify.notified() => {
                    self.run_assignment_pass().await;
                }
                _ = sweep.tick() => {
                    self.sweep_deadlines().await;
                }
                _ = shutdown_rx.recv() => break,
            }
        }
        info!("Coordinator loop stopped");
    }

    /// One serial assignment pass: ready tasks to eligible agents.
    pub async fn run_assignment_pass(&self) {
        let now = self.clock.now();
        let mut sends: Vec<(Uuid, TaskEnvelope)> = Vec::new();
        let mut dirty_tasks: Vec<Task> = Vec::new();
        let mut dirty_agents: Vec<Agent> = Vec::new();

        {
            let mut state = self.state.write().await;

            let ready: Vec<ReadyTask> = state
                .tasks
                .values()
                .filter(|t| {
                    t.status == TaskStatus::Pending
                        && self.resolver.dependencies_met(t, &state.tasks)
                })
                .map(|t| ReadyTask {
                    id: t.id,
                    priority: t.priority,
                    created_at: t.created_at,
                    required_caps: t.required_caps.clone(),
                })
                .collect();

            let eligible: Vec<EligibleAgent> = state
                .agents
                .values()
                .filter(|a| a.has_capacity())
                .map(|a| EligibleAgent {
                    id: a.id,
                    capabilities: a.capabilities.clone(),
                    current_task_count: a.current_task_count() as u32,
                    max_concurrent_tasks: a.caps.max_concurrent_tasks,
                    tasks_completed: a.metrics.tasks_completed,
                    tasks_failed: a.metrics.tasks_failed,
                })
                .collect();

            if ready.is_empty() || eligible.is_empty() {
                return;
            }

            for assignment in plan_assignments(&ready, &eligible) {
                let Some(task) = state.tasks.get_mut(&assignment.task_id) else {
                    continue;
                };
                if task.transition_to(TaskStatus::Assigned, now).is_err() {
                    continue;
                }
                task.assigned_to = Some(assignment.agent_id);
                task.attempt_count += 1;
                let envelope = TaskEnvelope {
                    task_id: task.id,
                    task_type: task.task_type.clone(),
                    description: task.description.clone(),
                    input: task.input.clone(),
                    timeout_ms: 0,
                };
                dirty_tasks.push(task.clone());

                let Some(agent) = state.agents.get_mut(&assignment.agent_id) else {
                    continue;
                };
                agent.assign(assignment.task_id, now);
                dirty_agents.push(agent.clone());

                let mut envelope = envelope;
                envelope.timeout_ms = agent.caps.wall_timeout_ms;
                sends.push((assignment.agent_id, envelope));
            }
        }

        // Suspending work happens outside the state lock.
        for task in &dirty_tasks {
            self.persist_task(task).await;
            self.publish_task_status(task, TaskStatus::Pending, now);
        }
        for agent in &dirty_agents {
            self.persist_agent(agent).await;
        }
        for (agent_id, envelope) in sends {
            let task_id = envelope.task_id;
            if let Err(e) = self.apm.send_task(agent_id, envelope).await {
                warn!(task_id = %task_id, agent_id = %agent_id, error = %e, "Send failed, requeueing");
                self.requeue_task(task_id, "agent unavailable at send").await;
            }
        }
    }

    async fn handle_agent_event(&self, event: AgentEvent) {
        match event {
            AgentEvent::Ready { agent_id } => self.on_agent_ready(agent_id).await,
            AgentEvent::TaskAcked { agent_id, task_id } => {
                self.on_task_acked(agent_id, task_id).await;
            }
            AgentEvent::TaskCompleted { agent_id, task_id, result } => {
                self.on_task_finished(agent_id, task_id, TaskOutcome::Success, result, None)
                    .await;
            }
            AgentEvent::TaskFailed { agent_id, task_id, error } => {
                self.on_task_finished(agent_id, task_id, TaskOutcome::Failure, None, Some(error))
                    .await;
            }
            AgentEvent::TaskTimedOut { agent_id, task_id } => {
                self.on_task_finished(
                    agent_id,
                    task_id,
                    TaskOutcome::Failure,
                    None,
                    Some("wall-clock timeout exceeded".to_string()),
                )
                .await;
            }
            AgentEvent::Exited { agent_id, code } => {
                self.on_agent_lost(agent_id, &format!("process exited with code {code}"), code == 0)
                    .await;
            }
            AgentEvent::HeartbeatLost { agent_id } => {
                self.on_agent_lost(agent_id, "heartbeat lost", false).await;
            }
            AgentEvent::CapExceeded { agent_id, memory_bytes } => {
                self.on_agent_lost(
                    agent_id,
                    &format!("memory cap exceeded ({memory_bytes} bytes)"),
                    false,
                )
                .await;
            }
            AgentEvent::Stopped { agent_id } => self.on_agent_stopped(agent_id).await,
        }
    }

    async fn on_agent_ready(&self, agent_id: Uuid) {
        let now = self.clock.now();
        let snapshot = {
            let mut state = self.state.write().await;
            let Some(agent) = state.agents.get_mut(&agent_id) else {
                return;
            };
            if agent.status != AgentStatus::Starting {
                return;
            }
            if agent.transition_to(AgentStatus::Idle, now).is_err() {
                return;
            }
            agent.clone()
        };
        self.persist_agent(&snapshot).await;
        self.publish_agent_status(&snapshot, AgentStatus::Starting, now);
        debug!(agent_id = %agent_id, "Agent ready");
    }

    async fn on_task_acked(&self, agent_id: Uuid, task_id: Uuid) {
        let now = self.clock.now();
        let snapshot = {
            let mut state = self.state.write().await;
            let Some(task) = state.tasks.get_mut(&task_id) else {
                return;
            };
            if task.assigned_to != Some(agent_id) || task.status != TaskStatus::Assigned {
                return;
            }
            if task.transition_to(TaskStatus::Running, now).is_err() {
                return;
            }
            task.clone()
        };
        self.persist_task(&snapshot).await;
        self.publish_task_status(&snapshot, TaskStatus::Assigned, now);
    }

    async fn on_task_finished(
        &self,
        agent_id: Uuid,
        task_id: Uuid,
        outcome: TaskOutcome,
        result: Option<Value>,
        error: Option<String>,
    ) {
        let now = self.clock.now();
        let mut requeued = false;
        let (task, agent) = {
            let mut state = self.state.write().await;
            let Some(task) = state.tasks.get_mut(&task_id) else {
                return;
            };
            // Stale report from a previous assignment; at-least-once
            // semantics make this harmless to drop.
            if task.assigned_to != Some(agent_id) || task.is_terminal() {
                return;
            }
            let from = task.status;

            match outcome {
                TaskOutcome::Success => {
                    if task.status == TaskStatus::Assigned {
                        // Ack raced the completion; fast-forward.
                        let _ = task.transition_to(TaskStatus::Running, now);
                    }
                    if task.transition_to(TaskStatus::Completed, now).is_err() {
                        return;
                    }
                    task.result = result;
                }
                TaskOutcome::Failure => {
                    if task.attempt_count >= task.max_retries {
                        if task.status == TaskStatus::Assigned {
                            let _ = task.transition_to(TaskStatus::Running, now);
                        }
                        if task.transition_to(TaskStatus::Failed, now).is_err() {
                            return;
                        }
                        task.error = error;
                    } else {
                        if task.transition_to(TaskStatus::Pending, now).is_err() {
                            return;
                        }
                        task.error = error;
                        requeued = true;
                    }
                }
            }

            // End the task borrow before touching the rest of the state.
            let task = task.clone();

            let duration_ms = task
                .started_at
                .map(|s| now.signed_duration_since(s).num_milliseconds().max(0) as u64)
                .unwrap_or(0);
            let failed = task.status == TaskStatus::Failed;
            if task.is_terminal() {
                state.push_completion(
                    CompletionRecord { ended_at: now, duration_ms, failed },
                    self.config.coordinator.completion_window,
                );
                if failed {
                    state.tasks_failed += 1;
                } else {
                    state.tasks_completed += 1;
                }
            }

            let agent = state.agents.get_mut(&agent_id).map(|agent| {
                agent.release(task_id, now);
                match outcome {
                    TaskOutcome::Success => agent.metrics.tasks_completed += 1,
                    TaskOutcome::Failure => agent.metrics.tasks_failed += 1,
                }
                agent.clone()
            });

            self.publish_task_status(&task, from, now);
            if requeued {
                self.bus.publish(
                    EventPayload::TaskRequeued { task_id, attempt: task.attempt_count },
                    now,
                );
            }
            (task, agent)
        };

        self.persist_task(&task).await;
        if let Some(agent) = agent {
            self.persist_agent(&agent).await;
        }
    }

    /// Crash and heartbeat-loss handling: requeue in-flight tasks, then
    /// restart the agent or retire it per policy.
    async fn on_agent_lost(&self, agent_id: Uuid, reason: &str, clean_exit: bool) {
        let now = self.clock.now();
        let mut dirty_tasks: Vec<Task> = Vec::new();
        let (agent, from, restart) = {
            let mut state = self.state.write().await;
            let Some(agent) = state.agents.get_mut(&agent_id) else {
                return;
            };
            let from = agent.status;
            let was_stopping = agent.status == AgentStatus::Stopping;
            let assigned = std::mem::take(&mut agent.assigned_tasks);
            let target = if clean_exit || was_stopping {
                AgentStatus::Stopped
            } else {
                AgentStatus::Error
            };
            agent.force_status(target, now, reason);
            if target == AgentStatus::Error {
                agent.metrics.tasks_failed += assigned.len() as u64;
            }

            let restart = target == AgentStatus::Error
                && self.config.process.restart_on_crash
                && agent.restart_count < self.config.process.max_restarts;
            if restart {
                agent.restart_count += 1;
            } else if target == AgentStatus::Error {
                // Permanently retired.
                agent.force_status(AgentStatus::Stopped, now, "restart budget exhausted");
            }
            let agent_snapshot = agent.clone();

            for task_id in assigned {
                let (task, from) = {
                    let Some(task) = state.tasks.get_mut(&task_id) else {
                        continue;
                    };
                    if task.is_terminal() {
                        continue;
                    }
                    let from = task.status;
                    if task.attempt_count >= task.max_retries {
                        task.force_status(TaskStatus::Failed, now, reason);
                        task.error = Some(format!("agent lost: {reason}"));
                    } else {
                        task.force_status(TaskStatus::Pending, now, reason);
                        task.assigned_to = None;
                    }
                    (task.clone(), from)
                };
                if task.status == TaskStatus::Failed {
                    let duration_ms = task
                        .started_at
                        .map(|s| now.signed_duration_since(s).num_milliseconds().max(0) as u64)
                        .unwrap_or(0);
                    state.push_completion(
                        CompletionRecord { ended_at: now, duration_ms, failed: true },
                        self.config.coordinator.completion_window,
                    );
                    state.tasks_failed += 1;
                }
                self.publish_task_status(&task, from, now);
                if task.status == TaskStatus::Pending {
                    self.bus.publish(
                        EventPayload::TaskRequeued { task_id, attempt: task.attempt_count },
                        now,
                    );
                }
                dirty_tasks.push(task);
            }
            (agent_snapshot, from, restart)
        };

        warn!(agent_id = %agent_id, reason, restart, "Agent lost");
        self.persist_agent(&agent).await;
        self.publish_agent_status(&agent, from, now);
        for task in &dirty_tasks {
            self.persist_task(task).await;
        }

        if restart {
            let caps = agent.caps;
            let restarted = {
                let mut state = self.state.write().await;
                match state.agents.get_mut(&agent_id) {
                    Some(stored) => {
                        stored.force_status(AgentStatus::Starting, now, "restart after crash");
                        stored.metrics.started_at = Some(now);
                        Some(stored.clone())
                    }
                    None => None,
                }
            };
            if let Some(snapshot) = restarted {
                self.persist_agent(&snapshot).await;
                if let Err(e) = self.apm.start_agent(agent_id, caps).await {
                    error!(agent_id = %agent_id, error = %e, "Restart failed");
                    let failed = {
                        let mut state = self.state.write().await;
                        state.agents.get_mut(&agent_id).map(|stored| {
                            stored.force_status(AgentStatus::Stopped, now, "restart spawn failed");
                            stored.clone()
                        })
                    };
                    if let Some(snapshot) = failed {
                        self.persist_agent(&snapshot).await;
                    }
                }
            }
        }
    }

    async fn on_agent_stopped(&self, agent_id: Uuid) {
        let now = self.clock.now();
        let mut dirty_tasks: Vec<Task> = Vec::new();
        let (agent, from) = {
            let mut state = self.state.write().await;
            let Some(agent) = state.agents.get_mut(&agent_id) else {
                return;
            };
            if agent.status == AgentStatus::Stopped {
                // Second stop of an already-stopped agent: no event.
                return;
            }
            let from = agent.status;
            let assigned = std::mem::take(&mut agent.assigned_tasks);
            if agent.status == AgentStatus::Stopping {
                let _ = agent.transition_to(AgentStatus::Stopped, now);
            } else {
                agent.force_status(AgentStatus::Stopped, now, "process stopped");
            }
            let snapshot = agent.clone();

            for task_id in assigned {
                let Some(task) = state.tasks.get_mut(&task_id) else {
                    continue;
                };
                if task.is_terminal() {
                    continue;
                }
                task.force_status(TaskStatus::Pending, now, "agent stopped");
                task.assigned_to = None;
                dirty_tasks.push(task.clone());
            }
            (snapshot, from)
        };

        self.persist_agent(&agent).await;
        self.publish_agent_status(&agent, from, now);
        for task in &dirty_tasks {
            self.persist_task(task).await;
        }
        info!(agent_id = %agent_id, "Agent stopped");
    }

    /// Cancel tasks whose deadline passed before completion.
    async fn sweep_deadlines(&self) {
        let now = self.clock.now();
        let expired: Vec<Uuid> = {
            let state = self.state.read().await;
            state
                .tasks
                .values()
                .filter(|t| !t.is_terminal() && t.past_deadline(now))
                .map(|t| t.id)
                .collect()
        };
        for id in expired {
            if let Err(e) = self.cancel_task(id, "deadline exceeded").await {
                debug!(task_id = %id, error = %e, "Deadline sweep skipped task");
            }
        }
    }

    /// Put an assigned/running task back on the queue.
    async fn requeue_task(&self, task_id: Uuid, reason: &str) {
        let now = self.clock.now();
        let snapshot = {
            let mut state = self.state.write().await;
            let Some(task) = state.tasks.get_mut(&task_id) else {
                return;
            };
            if task.is_terminal() || task.status == TaskStatus::Pending {
                return;
            }
            let agent_id = task.assigned_to;
            task.force_status(TaskStatus::Pending, now, reason);
            task.assigned_to = None;
            let task = task.clone();
            if let Some(agent_id) = agent_id {
                if let Some(agent) = state.agents.get_mut(&agent_id) {
                    agent.release(task_id, now);
                }
            }
            task
        };
        self.persist_task(&snapshot).await;
        self.notify.notify_one();
    }

    // ========================
    // Persistence and events
    // ========================

    async fn persist_agent(&self, agent: &Agent) {
        if let Err(e) = retry_storage(&self.config.retry, || self.agent_repo.put(agent)).await {
            error!(agent_id = %agent.id, error = %e, "Failed to persist agent");
        }
    }

    async fn persist_task(&self, task: &Task) {
        if let Err(e) = retry_storage(&self.config.retry, || self.task_repo.put(task)).await {
            error!(task_id = %task.id, error = %e, "Failed to persist task");
        }
    }

    async fn persist_swarm(&self, swarm: &Swarm) {
        if let Err(e) = retry_storage(&self.config.retry, || self.swarm_repo.put(swarm)).await {
            error!(swarm_id = %swarm.id, error = %e, "Failed to persist swarm");
        }
    }

    fn publish_agent_status(&self, agent: &Agent, from: AgentStatus, now: DateTime<Utc>) {
        self.bus.publish(
            EventPayload::AgentStatusChanged {
                agent_id: agent.id,
                from,
                to: agent.status,
            },
            now,
        );
    }

    fn publish_task_status(&self, task: &Task, from: TaskStatus, now: DateTime<Utc>) {
        self.bus.publish(
            EventPayload::TaskStatusChanged {
                task_id: task.id,
                from,
                to: task.status,
            },
            now,
        );
    }
}

/// Scale-down victim ordering: idle agents carrying no tasks, fewest
/// lifetime completions first (least warmed up), earliest process start
/// breaking ties. Agents running tasks are never candidates.
fn pick_scale_down_victim<'a, I>(agents: I) -> Option<Uuid>
where
    I: Iterator<Item = &'a Agent>,
{
    agents
        .filter(|a| a.status == AgentStatus::Idle && a.assigned_tasks.is_empty())
        .min_by(|a, b| {
            a.metrics
                .tasks_completed
                .cmp(&b.metrics.tasks_completed)
                .then_with(|| a.metrics.started_at.cmp(&b.metrics.started_at))
                .then_with(|| a.id.cmp(&b.id))
        })
        .map(|a| a.id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idle_agent(completed: u64, started_secs_ago: i64) -> Agent {
        let now = Utc::now();
        let mut agent = Agent::from_spec(
            Uuid::new_v4(),
            &AgentSpec::new(AgentType::General),
            now,
        );
        agent.transition_to(AgentStatus::Idle, now).unwrap();
        agent.metrics.tasks_completed = completed;
        agent.metrics.started_at = Some(now - chrono::Duration::seconds(started_secs_ago));
        agent
    }

    #[test]
    fn test_victim_prefers_fewest_completions() {
        let warm = idle_agent(10, 100);
        let cold = idle_agent(1, 100);
        let agents = vec![warm, cold.clone()];
        assert_eq!(pick_scale_down_victim(agents.iter()), Some(cold.id));
    }

    #[test]
    fn test_victim_tie_breaks_on_earliest_start() {
        let newer = idle_agent(5, 10);
        let older = idle_agent(5, 500);
        let agents = vec![newer, older.clone()];
        assert_eq!(pick_scale_down_victim(agents.iter()), Some(older.id));
    }

    #[test]
    fn test_victim_never_picks_busy() {
        let now = Utc::now();
        let mut busy = idle_agent(0, 100);
        busy.assign(Uuid::new_v4(), now);
        let agents = vec![busy];
        assert_eq!(pick_scale_down_victim(agents.iter()), None);
    }

    #[test]
    fn test_queue_len_counts_open_work() {
        let mut state = CoordinatorState::new();
        let now = Utc::now();
        for (i, status) in [
            TaskStatus::Pending,
            TaskStatus::Assigned,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Cancelled,
        ]
        .iter()
        .enumerate()
        {
            let mut task = Task::from_spec(
                Uuid::new_v4(),
                &TaskSpec::new("echo", format!("t{i}")),
                3,
                now,
            );
            task.force_status(*status, now, "test setup");
            state.tasks.insert(task.id, task);
        }
        assert_eq!(state.queue_len(), 3);
        assert_eq!(state.pending_count(), 1);
    }

    #[test]
    fn test_completion_window_is_bounded() {
        let mut state = CoordinatorState::new();
        let now = Utc::now();
        for _ in 0..10 {
            state.push_completion(
                CompletionRecord { ended_at: now, duration_ms: 5, failed: false },
                4,
            );
        }
        assert_eq!(state.completions.len(), 4);
    }
}

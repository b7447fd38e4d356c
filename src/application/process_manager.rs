//! Agent process manager.
//!
//! Materializes agent records into running OS subprocesses and keeps
//! their status fresh. One watcher task per live agent supervises the
//! process: it relays task envelopes to stdin, parses stdout messages,
//! probes liveness, enforces resource caps, and reports everything to
//! the coordinator over a bounded event channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{ProcessConfig, ResourceCaps};
use crate::domain::ports::process::{ProcessControl, ProcessError, ProcessRunner, ProcessSpec};
use crate::domain::ports::Clock;

/// Messages an agent may emit on stdout, newline-delimited JSON.
/// Unknown `type` tags are logged and dropped.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AgentMessage {
    Heartbeat,
    Ack {
        task_id: Uuid,
    },
    Completed {
        task_id: Uuid,
        #[serde(default)]
        result: Option<Value>,
    },
    Failed {
        task_id: Uuid,
        error: String,
    },
}

/// Task envelope written to an agent's stdin.
#[derive(Debug, Clone, Serialize)]
pub struct TaskEnvelope {
    pub task_id: Uuid,
    pub task_type: String,
    pub description: String,
    pub input: Option<Value>,
    pub timeout_ms: u64,
}

impl TaskEnvelope {
    fn to_wire(&self) -> serde_json::Result<String> {
        let mut value = serde_json::to_value(self)?;
        if let Some(obj) = value.as_object_mut() {
            obj.insert("type".to_string(), Value::String("task".to_string()));
        }
        serde_json::to_string(&value)
    }
}

/// State changes posted to the coordinator.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// First heartbeat arrived within the start grace window.
    Ready { agent_id: Uuid },
    TaskAcked { agent_id: Uuid, task_id: Uuid },
    TaskCompleted {
        agent_id: Uuid,
        task_id: Uuid,
        result: Option<Value>,
    },
    TaskFailed {
        agent_id: Uuid,
        task_id: Uuid,
        error: String,
    },
    /// Wall-clock cap elapsed without a terminal message for the task.
    TaskTimedOut { agent_id: Uuid, task_id: Uuid },
    /// Process exited on its own.
    Exited { agent_id: Uuid, code: i32 },
    /// Liveness probes went unanswered past the limit.
    HeartbeatLost { agent_id: Uuid },
    /// Memory cap breached; the process was force-stopped.
    CapExceeded { agent_id: Uuid, memory_bytes: u64 },
    /// A requested stop finished.
    Stopped { agent_id: Uuid },
}

#[derive(Debug, Clone, Copy)]
enum StopMode {
    Graceful { timeout_ms: u64 },
    Force,
}

struct AgentRuntime {
    outbox: mpsc::Sender<(Uuid, String)>,
    control: mpsc::Sender<StopMode>,
    pid: Option<u32>,
}

/// Spawns, supervises, and terminates agent subprocesses.
pub struct ProcessManager {
    runner: Arc<dyn ProcessRunner>,
    config: ProcessConfig,
    clock: Arc<dyn Clock>,
    events: mpsc::Sender<AgentEvent>,
    runtimes: Arc<RwLock<HashMap<Uuid, AgentRuntime>>>,
}

impl ProcessManager {
    pub fn new(
        runner: Arc<dyn ProcessRunner>,
        config: ProcessConfig,
        clock: Arc<dyn Clock>,
        events: mpsc::Sender<AgentEvent>,
    ) -> Self {
        Self {
            runner,
            config,
            clock,
            events,
            runtimes: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Spawn the subprocess for `agent_id` and start its watcher.
    ///
    /// Returns the OS pid. Fails with `SpawnFailed` when the executable
    /// cannot be launched and `ResourceCaps` when caps are rejected.
    pub async fn start_agent(
        &self,
        agent_id: Uuid,
        caps: ResourceCaps,
    ) -> DomainResult<Option<u32>> {
        if self.runtimes.read().await.contains_key(&agent_id) {
            return Err(DomainError::AgentInUse {
                id: agent_id,
                reason: "process already running".to_string(),
            });
        }

        let spec = ProcessSpec {
            command: self.config.agent_command.clone(),
            args: self.config.agent_args.clone(),
            working_dir: self.config.working_dir.clone().map(Into::into),
            env: vec![("APIARY_AGENT_ID".to_string(), agent_id.to_string())],
            caps,
        };

        let process = self.runner.spawn(&spec).await.map_err(|e| match e {
            ProcessError::Caps(msg) => DomainError::ResourceCaps(msg),
            other => DomainError::SpawnFailed(other.to_string()),
        })?;

        let pid = process.control.pid();
        let (outbox_tx, outbox_rx) = mpsc::channel(64);
        let (control_tx, control_rx) = mpsc::channel(4);

        self.runtimes.write().await.insert(
            agent_id,
            AgentRuntime {
                outbox: outbox_tx,
                control: control_tx,
                pid,
            },
        );

        let watcher = Watcher {
            agent_id,
            caps,
            config: self.config.clone(),
            events: self.events.clone(),
            runtimes: Arc::clone(&self.runtimes),
        };
        tokio::spawn(watcher.run(process.reader, process.control, outbox_rx, control_rx));

        info!(agent_id = %agent_id, pid = ?pid, "Agent process spawned");
        Ok(pid)
    }

    /// Queue a task envelope onto the agent's stdin channel.
    pub async fn send_task(&self, agent_id: Uuid, envelope: TaskEnvelope) -> DomainResult<()> {
        let line = envelope
            .to_wire()
            .map_err(|e| DomainError::Internal(format!("envelope encode failed: {e}")))?;
        let runtimes = self.runtimes.read().await;
        let runtime = runtimes
            .get(&agent_id)
            .ok_or(DomainError::AgentUnavailable(agent_id))?;
        runtime
            .outbox
            .send((envelope.task_id, line))
            .await
            .map_err(|_| DomainError::AgentUnavailable(agent_id))?;
        Ok(())
    }

    /// Stop the agent's process. Idempotent: stopping an agent with no
    /// live process is a no-op.
    pub async fn stop_agent(
        &self,
        agent_id: Uuid,
        graceful: bool,
        timeout_ms: Option<u64>,
    ) -> DomainResult<()> {
        let control = {
            let runtimes = self.runtimes.read().await;
            match runtimes.get(&agent_id) {
                Some(rt) => rt.control.clone(),
                None => return Ok(()),
            }
        };

        let mode = if graceful {
            StopMode::Graceful {
                timeout_ms: timeout_ms.unwrap_or(self.config.stop_timeout_ms),
            }
        } else {
            StopMode::Force
        };
        // A closed channel means the watcher already wound down.
        let _ = control.send(mode).await;
        Ok(())
    }

    /// Stop every live agent, waiting up to `timeout` for watchers to
    /// drain.
    pub async fn stop_all(&self, timeout: Duration) {
        let ids: Vec<Uuid> = self.runtimes.read().await.keys().copied().collect();
        for id in &ids {
            let _ = self.stop_agent(*id, true, None).await;
        }

        let deadline = self.clock.monotonic() + timeout;
        while !self.runtimes.read().await.is_empty() {
            if Instant::now() >= deadline.into() {
                warn!(
                    remaining = self.runtimes.read().await.len(),
                    "Stop-all timeout reached with agents still live"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    pub async fn is_running(&self, agent_id: Uuid) -> bool {
        self.runtimes.read().await.contains_key(&agent_id)
    }

    pub async fn running_count(&self) -> usize {
        self.runtimes.read().await.len()
    }

    pub async fn pid_of(&self, agent_id: Uuid) -> Option<u32> {
        self.runtimes.read().await.get(&agent_id).and_then(|rt| rt.pid)
    }
}

enum ExitReason {
    Exited(i32),
    HeartbeatLost,
    CapExceeded(u64),
    Stopped,
}

struct Watcher {
    agent_id: Uuid,
    caps: ResourceCaps,
    config: ProcessConfig,
    events: mpsc::Sender<AgentEvent>,
    runtimes: Arc<RwLock<HashMap<Uuid, AgentRuntime>>>,
}

impl Watcher {
    async fn run(
        self,
        mut reader: Box<dyn crate::domain::ports::process::ProcessReader>,
        mut control: Box<dyn ProcessControl>,
        mut outbox_rx: mpsc::Receiver<(Uuid, String)>,
        mut control_rx: mpsc::Receiver<StopMode>,
    ) {
        let agent_id = self.agent_id;
        let mut ticker = interval(Duration::from_millis(self.config.heartbeat_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; consume it so the grace
        // window is measured from spawn.
        ticker.tick().await;

        let start_deadline =
            Instant::now() + Duration::from_millis(self.config.start_grace_ms);
        let wall_timeout = Duration::from_millis(self.caps.wall_timeout_ms);
        let mut ready = false;
        let mut missed: u32 = 0;
        let mut in_flight: HashMap<Uuid, Instant> = HashMap::new();

        let reason = loop {
            tokio::select! {
                line = reader.read_line() => match line {
                    Ok(Some(line)) => {
                        missed = 0;
                        self.handle_line(&line, &mut ready, &mut in_flight).await;
                    }
                    Ok(None) | Err(_) => {
                        let code = wait_for_exit(&mut control, Duration::from_secs(5))
                            .await
                            .unwrap_or(-1);
                        break ExitReason::Exited(code);
                    }
                },
                Some(mode) = control_rx.recv() => {
                    match mode {
                        StopMode::Graceful { timeout_ms } => {
                            let _ = control.signal_stop().await;
                            let grace = Duration::from_millis(timeout_ms);
                            if wait_for_exit(&mut control, grace).await.is_none() {
                                warn!(agent_id = %agent_id, "Graceful stop timed out, killing");
                                let _ = control.kill().await;
                                let _ = wait_for_exit(&mut control, Duration::from_secs(5)).await;
                            }
                        }
                        StopMode::Force => {
                            let _ = control.kill().await;
                            let _ = wait_for_exit(&mut control, Duration::from_secs(5)).await;
                        }
                    }
                    break ExitReason::Stopped;
                },
                Some((task_id, line)) = outbox_rx.recv() => {
                    if let Err(e) = control.write_line(&line).await {
                        // The reader arm will observe EOF and reap.
                        warn!(agent_id = %agent_id, error = %e, "Failed to write task envelope");
                    } else {
                        in_flight.insert(task_id, Instant::now() + wall_timeout);
                    }
                },
                _ = ticker.tick() => {
                    if !ready && Instant::now() >= start_deadline {
                        warn!(agent_id = %agent_id, "No heartbeat within start grace window");
                        let _ = control.kill().await;
                        break ExitReason::HeartbeatLost;
                    }
                    if ready {
                        missed += 1;
                        if missed > self.config.max_missed_heartbeats {
                            warn!(agent_id = %agent_id, missed, "Heartbeat probes unanswered");
                            let _ = control.kill().await;
                            break ExitReason::HeartbeatLost;
                        }
                    }
                    let _ = control.write_line(r#"{"type":"ping"}"#).await;

                    if let Some(memory) = control.memory_bytes() {
                        if memory > self.caps.max_memory_bytes {
                            warn!(
                                agent_id = %agent_id,
                                memory_bytes = memory,
                                cap = self.caps.max_memory_bytes,
                                "Memory cap exceeded"
                            );
                            let _ = control.kill().await;
                            break ExitReason::CapExceeded(memory);
                        }
                    }

                    let now = Instant::now();
                    let expired: Vec<Uuid> = in_flight
                        .iter()
                        .filter(|(_, deadline)| **deadline <= now)
                        .map(|(id, _)| *id)
                        .collect();
                    for task_id in expired {
                        in_flight.remove(&task_id);
                        let _ = self
                            .events
                            .send(AgentEvent::TaskTimedOut { agent_id, task_id })
                            .await;
                    }
                },
            }
        };

        self.runtimes.write().await.remove(&agent_id);

        let event = match reason {
            ExitReason::Exited(code) => AgentEvent::Exited { agent_id, code },
            ExitReason::HeartbeatLost => AgentEvent::HeartbeatLost { agent_id },
            ExitReason::CapExceeded(memory_bytes) => {
                AgentEvent::CapExceeded { agent_id, memory_bytes }
            }
            ExitReason::Stopped => AgentEvent::Stopped { agent_id },
        };
        let _ = self.events.send(event).await;
        debug!(agent_id = %agent_id, "Watcher finished");
    }

    async fn handle_line(
        &self,
        line: &str,
        ready: &mut bool,
        in_flight: &mut HashMap<Uuid, Instant>,
    ) {
        let agent_id = self.agent_id;
        let message = match serde_json::from_str::<AgentMessage>(line) {
            Ok(m) => m,
            Err(_) => {
                debug!(agent_id = %agent_id, line, "Dropping unrecognized agent output");
                return;
            }
        };

        // Any well-formed message proves liveness.
        if !*ready {
            *ready = true;
            let _ = self.events.send(AgentEvent::Ready { agent_id }).await;
        }

        match message {
            AgentMessage::Heartbeat => {}
            AgentMessage::Ack { task_id } => {
                let _ = self
                    .events
                    .send(AgentEvent::TaskAcked { agent_id, task_id })
                    .await;
            }
            AgentMessage::Completed { task_id, result } => {
                in_flight.remove(&task_id);
                let _ = self
                    .events
                    .send(AgentEvent::TaskCompleted { agent_id, task_id, result })
                    .await;
            }
            AgentMessage::Failed { task_id, error } => {
                in_flight.remove(&task_id);
                let _ = self
                    .events
                    .send(AgentEvent::TaskFailed { agent_id, task_id, error })
                    .await;
            }
        }
    }
}

/// Poll for process exit until `timeout` elapses.
async fn wait_for_exit(control: &mut Box<dyn ProcessControl>, timeout: Duration) -> Option<i32> {
    let deadline = Instant::now() + timeout;
    loop {
        match control.try_wait().await {
            Ok(Some(code)) => return Some(code),
            Ok(None) => {}
            Err(_) => return Some(-1),
        }
        if Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

//! Shared test harness: a scripted process runner standing in for real
//! agent subprocesses, plus wiring helpers for the full control plane
//! against a temporary SQLite database.
//!
//! Each integration test binary uses a subset of this module.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::mpsc;

use apiary::application::{
    AutoScaler, ControlCommandExecutor, MetricsCollector, MetricsRing, ProcessManager,
    SwarmCoordinator,
};
use apiary::domain::models::Config;
use apiary::domain::ports::process::{
    ProcessControl, ProcessError, ProcessReader, ProcessRunner, ProcessSpec, SpawnedProcess,
};
use apiary::domain::ports::{ManualClock, UuidSource};
use apiary::infrastructure::database::{
    AgentRepositoryImpl, DatabaseConnection, MemoryRepositoryImpl, ScalingRepositoryImpl,
    SwarmRepositoryImpl, TaskRepositoryImpl,
};
use apiary::services::EventBus;

/// How scripted agents behave once spawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentBehavior {
    /// Heartbeat, ack tasks, complete them with the input echoed back.
    Echo { complete_after_ms: u64 },
    /// Heartbeat, ack tasks, then report failure.
    AlwaysFail,
    /// Heartbeat, ack the first task, then exit with code 1.
    CrashOnTask,
    /// Never write anything; triggers the start grace window.
    Silent,
}

/// Scripted process runner. Every spawn gets an in-memory agent
/// following the configured behavior.
pub struct FakeRunner {
    behavior: AgentBehavior,
    spawned: AtomicUsize,
}

impl FakeRunner {
    pub fn new(behavior: AgentBehavior) -> Self {
        Self {
            behavior,
            spawned: AtomicUsize::new(0),
        }
    }

    pub fn spawn_count(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessRunner for FakeRunner {
    async fn spawn(&self, spec: &ProcessSpec) -> Result<SpawnedProcess, ProcessError> {
        spec.caps.validate().map_err(ProcessError::Caps)?;
        let n = self.spawned.fetch_add(1, Ordering::SeqCst);

        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel::<String>();
        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel::<String>();
        let exit = Arc::new(StdMutex::new(None::<i32>));

        tokio::spawn(run_scripted_agent(
            self.behavior,
            stdin_rx,
            stdout_tx,
            Arc::clone(&exit),
        ));

        Ok(SpawnedProcess {
            reader: Box::new(FakeReader { stdout_rx }),
            control: Box::new(FakeControl {
                pid: Some(40_000 + n as u32),
                stdin_tx: Some(stdin_tx),
                exit,
            }),
        })
    }
}

async fn run_scripted_agent(
    behavior: AgentBehavior,
    mut stdin_rx: mpsc::UnboundedReceiver<String>,
    stdout_tx: mpsc::UnboundedSender<String>,
    exit: Arc<StdMutex<Option<i32>>>,
) {
    if behavior == AgentBehavior::Silent {
        // Keep stdout open but never speak; the watcher's grace window
        // handles the rest. Dropping stdin ends the agent.
        while stdin_rx.recv().await.is_some() {}
        *exit.lock().unwrap() = Some(0);
        return;
    }

    let _ = stdout_tx.send(r#"{"type":"heartbeat"}"#.to_string());

    while let Some(line) = stdin_rx.recv().await {
        let Ok(message) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        match message["type"].as_str() {
            Some("ping") => {
                let _ = stdout_tx.send(r#"{"type":"heartbeat"}"#.to_string());
            }
            Some("task") => {
                let task_id = message["task_id"].clone();
                let _ = stdout_tx.send(format!(r#"{{"type":"ack","task_id":{task_id}}}"#));
                match behavior {
                    AgentBehavior::Echo { complete_after_ms } => {
                        if complete_after_ms > 0 {
                            tokio::time::sleep(Duration::from_millis(complete_after_ms)).await;
                        }
                        let result = message["input"].clone();
                        let _ = stdout_tx.send(format!(
                            r#"{{"type":"completed","task_id":{task_id},"result":{result}}}"#
                        ));
                    }
                    AgentBehavior::AlwaysFail => {
                        let _ = stdout_tx.send(format!(
                            r#"{{"type":"failed","task_id":{task_id},"error":"scripted failure"}}"#
                        ));
                    }
                    AgentBehavior::CrashOnTask => {
                        *exit.lock().unwrap() = Some(1);
                        // Dropping stdout simulates the process dying.
                        return;
                    }
                    AgentBehavior::Silent => unreachable!(),
                }
            }
            _ => {}
        }
    }
    *exit.lock().unwrap() = Some(0);
}

struct FakeReader {
    stdout_rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl ProcessReader for FakeReader {
    async fn read_line(&mut self) -> Result<Option<String>, ProcessError> {
        Ok(self.stdout_rx.recv().await)
    }
}

struct FakeControl {
    pid: Option<u32>,
    stdin_tx: Option<mpsc::UnboundedSender<String>>,
    exit: Arc<StdMutex<Option<i32>>>,
}

#[async_trait]
impl ProcessControl for FakeControl {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn write_line(&mut self, line: &str) -> Result<(), ProcessError> {
        let tx = self.stdin_tx.as_ref().ok_or(ProcessError::Exited)?;
        tx.send(line.to_string()).map_err(|_| ProcessError::Exited)
    }

    async fn signal_stop(&mut self) -> Result<(), ProcessError> {
        // Closing stdin is the cooperative stop for scripted agents.
        self.stdin_tx = None;
        Ok(())
    }

    async fn kill(&mut self) -> Result<(), ProcessError> {
        self.stdin_tx = None;
        let mut exit = self.exit.lock().unwrap();
        if exit.is_none() {
            *exit = Some(-9);
        }
        Ok(())
    }

    async fn try_wait(&mut self) -> Result<Option<i32>, ProcessError> {
        Ok(*self.exit.lock().unwrap())
    }

    fn memory_bytes(&self) -> Option<u64> {
        None
    }
}

/// A fully wired control plane over a temp database and scripted
/// processes.
pub struct Harness {
    pub coordinator: Arc<SwarmCoordinator>,
    pub scaler: Arc<AutoScaler>,
    pub collector: Arc<MetricsCollector>,
    pub ring: Arc<MetricsRing>,
    pub bus: Arc<EventBus>,
    pub executor: Arc<ControlCommandExecutor>,
    pub runner: Arc<FakeRunner>,
    pub clock: Arc<ManualClock>,
    pub memory_repo: Arc<MemoryRepositoryImpl>,
    pub db: DatabaseConnection,
    _dir: TempDir,
}

/// Config tuned for fast tests.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.max_agents = 16;
    // Scripted agents go quiet while "working"; keep the probe budget
    // comfortably above the longest scripted sleep.
    config.process.heartbeat_interval_ms = 50;
    config.process.start_grace_ms = 500;
    config.process.max_missed_heartbeats = 10;
    config.process.stop_timeout_ms = 250;
    config.process.restart_on_crash = false;
    config.coordinator.max_queue_size = 100;
    config.coordinator.max_task_retries = 3;
    config.retry.initial_backoff_ms = 1;
    config.retry.max_backoff_ms = 10;
    config
}

pub async fn build_harness(behavior: AgentBehavior, config: Config) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = format!("sqlite:{}/apiary.db", dir.path().display());
    let db = DatabaseConnection::new(&url).await.expect("database");
    db.migrate().await.expect("migrations");

    let agent_repo = Arc::new(AgentRepositoryImpl::new(db.pool().clone()));
    let task_repo = Arc::new(TaskRepositoryImpl::new(db.pool().clone()));
    let swarm_repo = Arc::new(SwarmRepositoryImpl::new(db.pool().clone()));
    let scaling_repo = Arc::new(ScalingRepositoryImpl::new(db.pool().clone()));
    let memory_repo = Arc::new(MemoryRepositoryImpl::new(db.pool().clone()));

    let clock = Arc::new(ManualClock::new(Utc::now()));
    let ids = Arc::new(UuidSource);
    let bus = Arc::new(EventBus::default());
    let runner = Arc::new(FakeRunner::new(behavior));

    let (events_tx, events_rx) = mpsc::channel(256);
    let apm = Arc::new(ProcessManager::new(
        runner.clone(),
        config.process.clone(),
        clock.clone(),
        events_tx,
    ));

    let coordinator = Arc::new(SwarmCoordinator::new(
        agent_repo,
        task_repo,
        swarm_repo,
        apm,
        events_rx,
        Arc::clone(&bus),
        clock.clone(),
        ids.clone(),
        config.clone(),
    ));
    coordinator.recover().await.expect("recover");
    coordinator.start();

    let ring = Arc::new(MetricsRing::new(config.metrics.ring_capacity));
    let collector = Arc::new(MetricsCollector::new(
        Arc::clone(&ring),
        Arc::clone(&coordinator),
        Arc::clone(&bus),
        clock.clone(),
        config.metrics.clone(),
        config.metrics_interval_ms,
    ));

    let scaler = Arc::new(AutoScaler::new(
        Arc::clone(&coordinator),
        scaling_repo,
        Arc::clone(&ring),
        Arc::clone(&bus),
        clock.clone(),
        ids.clone(),
        config,
    ));

    let executor = Arc::new(ControlCommandExecutor::new(
        Arc::clone(&coordinator),
        Arc::clone(&scaler),
        memory_repo.clone(),
        clock.clone(),
        ids,
    ));

    Harness {
        coordinator,
        scaler,
        collector,
        ring,
        bus,
        executor,
        runner,
        clock,
        memory_repo,
        db,
        _dir: dir,
    }
}

/// Poll `check` until it returns true or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

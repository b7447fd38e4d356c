//! Process runner port.
//!
//! The process manager talks to agent subprocesses only through this
//! seam: a spawner producing a reader half (stdout lines) and a control
//! half (stdin writes, signals, exit polling). The halves are separate
//! objects so a supervision loop can await the reader while driving the
//! control half from other select arms. Tests inject a scripted runner
//! instead of forking real processes.

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::models::ResourceCaps;

/// What to launch for one agent.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Extra environment exported to the child.
    pub env: Vec<(String, String)>,
    pub caps: ResourceCaps,
}

/// Errors from spawning or driving a subprocess.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Failed to spawn process: {0}")]
    Spawn(String),

    #[error("Resource caps rejected: {0}")]
    Caps(String),

    #[error("Process I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Process already exited")]
    Exited,
}

/// Read half: lines from the child's stdout. `Ok(None)` means the child
/// closed its stdout (usually exit).
#[async_trait]
pub trait ProcessReader: Send {
    async fn read_line(&mut self) -> Result<Option<String>, ProcessError>;
}

/// Control half: stdin writes, signals, and exit polling.
#[async_trait]
pub trait ProcessControl: Send {
    fn pid(&self) -> Option<u32>;

    async fn write_line(&mut self, line: &str) -> Result<(), ProcessError>;

    /// Cooperative stop signal (SIGTERM on Unix).
    async fn signal_stop(&mut self) -> Result<(), ProcessError>;

    /// Force termination (SIGKILL on Unix).
    async fn kill(&mut self) -> Result<(), ProcessError>;

    /// Exit code when the process has finished, without blocking.
    async fn try_wait(&mut self) -> Result<Option<i32>, ProcessError>;

    /// Resident memory of the child, when the host can report it.
    fn memory_bytes(&self) -> Option<u64>;
}

/// A spawned subprocess, split into its two halves.
pub struct SpawnedProcess {
    pub reader: Box<dyn ProcessReader>,
    pub control: Box<dyn ProcessControl>,
}

/// Spawner for agent subprocesses.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn spawn(&self, spec: &ProcessSpec) -> Result<SpawnedProcess, ProcessError>;
}

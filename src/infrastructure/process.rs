//! OS implementation of the process runner port.
//!
//! Agent subprocesses are spawned with piped stdio. Stdin/stdout carry
//! the newline-delimited JSON protocol; stop is SIGTERM first, SIGKILL
//! after the grace window (driven by the process manager).

use std::process::Stdio;
use std::sync::Mutex;

use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use sysinfo::{Pid as SysPid, ProcessesToUpdate, System};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::domain::ports::process::{
    ProcessControl, ProcessError, ProcessReader, ProcessRunner, ProcessSpec, SpawnedProcess,
};

/// Spawns real agent subprocesses via `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioProcessRunner;

struct TokioReader {
    lines: Lines<BufReader<ChildStdout>>,
}

struct TokioControl {
    child: Child,
    stdin: Option<ChildStdin>,
    pid: Option<u32>,
    system: Mutex<System>,
}

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn spawn(&self, spec: &ProcessSpec) -> Result<SpawnedProcess, ProcessError> {
        spec.caps.validate().map_err(ProcessError::Caps)?;

        let mut command = Command::new(&spec.command);
        command
            .args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .env("APIARY_MAX_MEMORY_BYTES", spec.caps.max_memory_bytes.to_string())
            .env(
                "APIARY_MAX_CONCURRENT_TASKS",
                spec.caps.max_concurrent_tasks.to_string(),
            )
            .env("APIARY_WALL_TIMEOUT_MS", spec.caps.wall_timeout_ms.to_string());

        for (key, value) in &spec.env {
            command.env(key, value);
        }
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .map_err(|e| ProcessError::Spawn(format!("{}: {e}", spec.command)))?;

        let pid = child.id();
        let stdin = child.stdin.take();
        let stdout = child.stdout.take().ok_or_else(|| {
            ProcessError::Spawn("child stdout was not captured".to_string())
        })?;

        Ok(SpawnedProcess {
            reader: Box::new(TokioReader {
                lines: BufReader::new(stdout).lines(),
            }),
            control: Box::new(TokioControl {
                child,
                stdin,
                pid,
                system: Mutex::new(System::new()),
            }),
        })
    }
}

#[async_trait]
impl ProcessReader for TokioReader {
    async fn read_line(&mut self) -> Result<Option<String>, ProcessError> {
        Ok(self.lines.next_line().await?)
    }
}

#[async_trait]
impl ProcessControl for TokioControl {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn write_line(&mut self, line: &str) -> Result<(), ProcessError> {
        let stdin = self.stdin.as_mut().ok_or(ProcessError::Exited)?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn signal_stop(&mut self) -> Result<(), ProcessError> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(ProcessError::Spawn(format!("SIGTERM failed: {e}"))),
        }
    }

    async fn kill(&mut self) -> Result<(), ProcessError> {
        // Already-dead children are fine.
        let _ = self.child.kill().await;
        Ok(())
    }

    async fn try_wait(&mut self) -> Result<Option<i32>, ProcessError> {
        let status = self.child.try_wait()?;
        Ok(status.map(|s| s.code().unwrap_or(-1)))
    }

    fn memory_bytes(&self) -> Option<u64> {
        let pid = self.pid?;
        let mut system = self.system.lock().ok()?;
        let sys_pid = SysPid::from_u32(pid);
        system.refresh_processes(ProcessesToUpdate::Some(&[sys_pid]), true);
        system.process(sys_pid).map(sysinfo::Process::memory)
    }
}

//! Worker process supervision.
//!
//! Flow:
//! 1. Spawn the worker with stdin/stdout piped
//! 2. Hand the child to a monitor task that records its exit
//! 3. Wait out the startup grace window; an exit inside it is a startup failure
//! 4. Mark the process Running and return the pipes to the bridge
//!
//! Termination is always forceful. The monitor kills the child when asked to
//! or when the handle is dropped.

use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, watch};

use crate::config::WorkerCommand;
use crate::error::BridgeError;

/// Lifecycle of the worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessState {
    /// Spawned, still inside the grace window
    Starting,
    /// Survived the grace window
    Running,
    /// Exited, killed, or never came up
    Terminated,
}

#[derive(Debug, Clone)]
struct Lifecycle {
    state: ProcessState,
    exit_cause: Option<String>,
}

impl Lifecycle {
    fn is_terminated(&self) -> bool {
        self.state == ProcessState::Terminated
    }

    fn exit_cause(&self) -> String {
        self.exit_cause
            .clone()
            .unwrap_or_else(|| "unknown exit".to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for different worker launch strategies.
///
/// Implementations must pipe stdin and stdout; stderr follows
/// `command.stderr`.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, command: &WorkerCommand) -> Result<Child, SpawnError>;
}

/// Launches the worker directly with `tokio::process::Command`.
pub struct CommandSpawner;

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self, command: &WorkerCommand) -> Result<Child, SpawnError> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(command.stderr.stdio())
            .kill_on_drop(true);
        if let Some(dir) = &command.current_dir {
            cmd.current_dir(dir);
        }
        Ok(cmd.spawn()?)
    }
}

/// The worker's protocol pipes, handed to the sender and dispatcher.
pub struct WorkerPipes {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}

/// Asks the monitor to kill the worker. Shared by every holder; the first
/// `kill` wins.
#[derive(Clone)]
pub(crate) struct KillSwitch {
    tx: Arc<StdMutex<Option<oneshot::Sender<()>>>>,
}

impl KillSwitch {
    /// Returns false if the kill was already requested.
    pub(crate) fn kill(&self) -> bool {
        let tx = match self.tx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        match tx {
            Some(tx) => {
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }
}

/// Handle to a live (or formerly live) worker process.
pub struct WorkerProcess {
    pid: Option<u32>,
    lifecycle: watch::Receiver<Lifecycle>,
    kill: KillSwitch,
}

impl WorkerProcess {
    /// Spawn the worker and wait out the startup grace window.
    pub async fn start(
        spawner: &dyn WorkerSpawner,
        command: &WorkerCommand,
        grace: Duration,
    ) -> Result<(Self, WorkerPipes), BridgeError> {
        tracing::info!(
            program = %command.program.display(),
            args = ?command.args,
            "Spawning worker"
        );

        let mut child = spawner.spawn(command)?;
        let pid = child.id();

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SpawnError::Other("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpawnError::Other("stdout not captured".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(stderr, pid));
        }

        let (lifecycle_tx, lifecycle_rx) = watch::channel(Lifecycle {
            state: ProcessState::Starting,
            exit_cause: None,
        });
        let lifecycle_tx = Arc::new(lifecycle_tx);
        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(monitor(child, pid, Arc::clone(&lifecycle_tx), kill_rx));

        let process = Self {
            pid,
            lifecycle: lifecycle_rx,
            kill: KillSwitch {
                tx: Arc::new(StdMutex::new(Some(kill_tx))),
            },
        };

        tracing::debug!(?pid, grace_ms = grace.as_millis(), "Waiting out startup grace window");
        let mut rx = process.lifecycle.clone();
        let waited =
            tokio::time::timeout(grace, rx.wait_for(Lifecycle::is_terminated)).await;
        let early_exit = match waited {
            Ok(Ok(lifecycle)) => Some(lifecycle.exit_cause()),
            Ok(Err(_)) => Some("worker monitor stopped".to_string()),
            Err(_) => None,
        };
        if let Some(cause) = early_exit {
            tracing::error!(?pid, %cause, "Worker exited during startup");
            return Err(BridgeError::Startup(format!(
                "worker exited during startup: {cause}"
            )));
        }

        // The monitor may record an exit at any moment; only promote a Starting process.
        lifecycle_tx.send_if_modified(|l| {
            if l.state == ProcessState::Starting {
                l.state = ProcessState::Running;
                true
            } else {
                false
            }
        });
        if !process.is_running() {
            let cause = process.lifecycle.borrow().exit_cause();
            return Err(BridgeError::Startup(format!(
                "worker exited during startup: {cause}"
            )));
        }

        tracing::info!(?pid, "Worker running");
        Ok((process, WorkerPipes { stdin, stdout }))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        self.lifecycle.borrow().state
    }

    /// Best-effort liveness: true until the monitor has observed an exit.
    pub fn is_running(&self) -> bool {
        !self.lifecycle.borrow().is_terminated()
    }

    /// Exit status text, once the process has terminated.
    pub fn exit_cause(&self) -> Option<String> {
        self.lifecycle.borrow().exit_cause.clone()
    }

    /// Resolves with the exit cause once the process has terminated.
    pub fn wait_for_exit(&self) -> impl Future<Output = String> + Send + use<> {
        let mut rx = self.lifecycle.clone();
        async move {
            match rx.wait_for(Lifecycle::is_terminated).await {
                Ok(lifecycle) => lifecycle.exit_cause(),
                Err(_) => "worker monitor stopped".to_string(),
            }
        }
    }

    pub(crate) fn kill_switch(&self) -> KillSwitch {
        self.kill.clone()
    }

    /// Kill the worker and wait until it has been reaped. Idempotent.
    pub async fn terminate(&self) {
        if self.kill.kill() {
            tracing::info!(pid = ?self.pid, "Terminating worker");
        }
        let cause = self.wait_for_exit().await;
        tracing::debug!(pid = ?self.pid, %cause, "Worker terminated");
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        if self.is_running() {
            tracing::debug!(pid = ?self.pid, "Dropping WorkerProcess, killing worker");
            self.kill.kill();
        }
    }
}

/// Owns the child: waits for it to exit (or kills it on request) and records the outcome.
async fn monitor(
    mut child: Child,
    pid: Option<u32>,
    lifecycle: Arc<watch::Sender<Lifecycle>>,
    kill_rx: oneshot::Receiver<()>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_rx => {
            if let Err(e) = child.start_kill() {
                tracing::warn!(?pid, error = %e, "Failed to kill worker");
            }
            child.wait().await
        }
    };

    let cause = match status {
        Ok(status) => status.to_string(),
        Err(e) => format!("failed to wait for worker: {e}"),
    };
    tracing::info!(?pid, %cause, "Worker process exited");

    lifecycle.send_modify(|l| {
        l.state = ProcessState::Terminated;
        l.exit_cause = Some(cause);
    });
}

/// Relay worker stderr into the log, line by line. Keeps draining so the
/// worker never blocks on a full stderr pipe.
async fn forward_stderr(stderr: ChildStderr, pid: Option<u32>) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end();
                if !line.is_empty() {
                    tracing::info!(target: "molbridge::worker", ?pid, "{}", line);
                }
            }
            Err(e) => {
                tracing::warn!(?pid, error = %e, "Failed to read worker stderr");
                break;
            }
        }
    }
    tracing::trace!(?pid, "Worker stderr closed");
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::StderrMode;

    fn sh(script: &str) -> WorkerCommand {
        WorkerCommand::new("/bin/sh").with_args(["-c", script])
    }

    #[tokio::test]
    async fn exit_during_grace_is_startup_error() {
        let result =
            WorkerProcess::start(&CommandSpawner, &sh("exit 3"), Duration::from_secs(5)).await;

        match result {
            Err(BridgeError::Startup(msg)) => assert!(msg.contains('3'), "{msg}"),
            Err(other) => panic!("expected Startup, got {other}"),
            Ok(_) => panic!("expected Startup error"),
        }
    }

    #[tokio::test]
    async fn missing_executable_is_launch_error() {
        let command = WorkerCommand::new("/nonexistent/molbridge-worker");
        let result =
            WorkerProcess::start(&CommandSpawner, &command, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(BridgeError::Launch(_))));
    }

    #[tokio::test]
    async fn survives_grace_then_terminates() {
        let (process, _pipes) =
            WorkerProcess::start(&CommandSpawner, &sh("sleep 30"), Duration::from_millis(100))
                .await
                .unwrap();

        assert_eq!(process.state(), ProcessState::Running);
        assert!(process.is_running());
        assert!(process.pid().is_some());

        process.terminate().await;
        assert_eq!(process.state(), ProcessState::Terminated);
        assert!(!process.is_running());
        assert!(process.exit_cause().is_some());

        // idempotent
        process.terminate().await;
    }

    #[tokio::test]
    async fn kill_switch_fires_once() {
        let (process, _pipes) =
            WorkerProcess::start(&CommandSpawner, &sh("sleep 30"), Duration::from_millis(50))
                .await
                .unwrap();

        let switch = process.kill_switch();
        assert!(switch.kill());
        assert!(!switch.kill());

        let cause = tokio::time::timeout(Duration::from_secs(5), process.wait_for_exit())
            .await
            .unwrap();
        assert!(!cause.is_empty());
        assert_eq!(process.state(), ProcessState::Terminated);
    }

    #[tokio::test]
    async fn exit_after_grace_is_observed() {
        let command = sh("sleep 0.3; exit 7");
        let (process, _pipes) =
            WorkerProcess::start(&CommandSpawner, &command, Duration::from_millis(50))
                .await
                .unwrap();
        assert!(process.is_running());

        let cause = tokio::time::timeout(Duration::from_secs(5), process.wait_for_exit())
            .await
            .unwrap();
        assert!(cause.contains('7'), "{cause}");
        assert!(!process.is_running());
    }

    #[tokio::test]
    async fn stderr_noise_does_not_block_worker() {
        let script = concat!(
            "i=0; while [ $i -lt 10000 ]; do echo noise-line-$i >&2; i=$((i+1)); done; ",
            "echo ready; sleep 30",
        );
        let command = sh(script).with_stderr(StderrMode::Log);
        let (process, pipes) =
            WorkerProcess::start(&CommandSpawner, &command, Duration::from_millis(50))
                .await
                .unwrap();

        let mut lines = BufReader::new(pipes.stdout).lines();
        let line = tokio::time::timeout(Duration::from_secs(10), lines.next_line())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(line.as_deref(), Some("ready"));

        process.terminate().await;
    }
}

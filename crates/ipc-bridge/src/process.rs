//! Worker process manager.
//!
//! Owns the subprocess: spawns it, frames its stdout/stderr into lines,
//! writes lines to its stdin, and tracks the lifecycle state.
//!
//! ```text
//! NOT_STARTED -> STARTING -> READY -> RUNNING -> STOPPING -> STOPPED
//!                   |          |         |
//!                   +----------+---------+------> CRASHED
//! ```

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::LineCodec;
use crate::config::{BridgeConfig, WorkerCommand};

/// How long the exit monitor waits for the output streams to drain after the
/// child exits, so lines written just before exit are routed before the exit.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

/// Lines buffered for the stdin writer. A worker that leaves this many lines
/// unread is treated as unwritable.
pub const WRITE_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    #[default]
    NotStarted,
    Starting,
    Ready,
    Running,
    Stopping,
    Stopped,
    Crashed,
}

impl WorkerState {
    /// Process is up and has not been asked to stop.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Starting | Self::Ready | Self::Running)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotStarted => "NOT_STARTED",
            Self::Starting => "STARTING",
            Self::Ready => "READY",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
            Self::Crashed => "CRASHED",
        };
        f.write_str(s)
    }
}

/// Everything the worker produces, in arrival order per stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutput {
    Stdout(String),
    Stderr(String),
    /// Writing to stdin failed; later writes are refused.
    StdinClosed(String),
    /// Sent once, after both output streams have drained. `None` when killed by a signal.
    Exited(Option<i32>),
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// A lifecycle transition the current state does not permit.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid worker state transition: {from} -> {to}")]
pub struct TransitionError {
    pub from: WorkerState,
    pub to: WorkerState,
}

/// Extension point for different worker launch strategies.
///
/// Implementations must pipe stdin, stdout and stderr.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, command: &WorkerCommand) -> Result<Child, SpawnError>;
}

/// Launches [`WorkerCommand`] directly with piped stdio.
pub struct CommandSpawner;

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self, command: &WorkerCommand) -> Result<Child, SpawnError> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(&command.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &command.cwd {
            cmd.current_dir(cwd);
        }
        Ok(cmd.spawn()?)
    }
}

pub struct WorkerProcess {
    state: Arc<watch::Sender<WorkerState>>,
    stdin: Option<mpsc::Sender<String>>,
    writer: Option<JoinHandle<()>>,
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
    exited: watch::Receiver<bool>,
    grace: Duration,
}

impl WorkerProcess {
    /// Launch the worker and wire line readers on both output streams.
    ///
    /// The returned receiver yields stdout/stderr lines and, finally, the exit.
    /// State is `STARTING` on success.
    pub fn start(
        config: &BridgeConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<WorkerOutput>), SpawnError> {
        let (state, _) = watch::channel(WorkerState::NotStarted);
        let state = Arc::new(state);

        tracing::info!(program = %config.worker.program.display(), "Spawning worker subprocess");
        let mut child = config.spawner.spawn(&config.worker)?;
        let pid = child.id();

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SpawnError::Other("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpawnError::Other("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SpawnError::Other("stderr not captured".to_string()))?;

        state.send_replace(WorkerState::Starting);

        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = watch::channel(false);

        let stdout_task = tokio::spawn(forward_stdout(
            FramedRead::new(stdout, LineCodec::new()),
            output_tx.clone(),
        ));
        let stderr_task = tokio::spawn(forward_stderr(
            FramedRead::new(stderr, LineCodec::new()),
            output_tx.clone(),
        ));
        let (stdin_tx, stdin_rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);
        let writer = tokio::spawn(write_stdin(
            FramedWrite::new(stdin, LineCodec::new()),
            stdin_rx,
            Arc::clone(&state),
            output_tx.clone(),
        ));
        tokio::spawn(monitor_exit(
            child,
            kill_rx,
            Arc::clone(&state),
            [stdout_task, stderr_task],
            output_tx,
            exited_tx,
        ));

        tracing::debug!(?pid, "Worker spawned");

        Ok((
            Self {
                state,
                stdin: Some(stdin_tx),
                writer: Some(writer),
                pid,
                kill_tx: Some(kill_tx),
                exited: exited_rx,
                grace: config.stop_grace(),
            },
            output_rx,
        ))
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    /// STARTING -> READY, after a valid handshake.
    pub fn mark_ready(&self) -> Result<(), TransitionError> {
        self.transition(WorkerState::Starting, WorkerState::Ready)
    }

    /// READY -> RUNNING, once the heartbeat is armed.
    pub fn mark_running(&self) -> Result<(), TransitionError> {
        self.transition(WorkerState::Ready, WorkerState::Running)
    }

    fn transition(&self, from: WorkerState, to: WorkerState) -> Result<(), TransitionError> {
        let mut actual = from;
        let moved = self.state.send_if_modified(|s| {
            actual = *s;
            if *s == from {
                *s = to;
                true
            } else {
                false
            }
        });
        if moved {
            tracing::debug!(%from, %to, "Worker state transition");
            Ok(())
        } else {
            Err(TransitionError { from: actual, to })
        }
    }

    /// True while READY or RUNNING with a writable stdin.
    pub fn can_accept_requests(&self) -> bool {
        self.stdin.is_some() && matches!(self.state(), WorkerState::Ready | WorkerState::Running)
    }

    /// Best-effort write of one line. Never waits on the pipe.
    ///
    /// The line is handed to the stdin writer task. Returns false when stdin
    /// is already closed or the worker has left [`WRITE_QUEUE_CAPACITY`] lines
    /// unread; either way stdin is closed and the worker marked CRASHED.
    /// Failures inside the writer arrive later as [`WorkerOutput::StdinClosed`].
    pub fn write_line(&mut self, line: String) -> bool {
        if !self.state().is_live() {
            return false;
        }
        let Some(stdin) = self.stdin.as_ref() else {
            return false;
        };
        match stdin.try_send(line) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::error!(
                    capacity = WRITE_QUEUE_CAPACITY,
                    "Worker is not reading stdin, closing it"
                );
                self.close_stdin();
                mark_crashed(&self.state);
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.close_stdin();
                mark_crashed(&self.state);
                false
            }
        }
    }

    /// Drop the writer, discarding unwritten lines. Closes the pipe even if
    /// the writer is stuck on a full one.
    fn close_stdin(&mut self) {
        self.stdin = None;
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
    }

    /// Terminate the worker: close stdin, SIGTERM, then kill after the grace
    /// period. Settles to STOPPED, or stays CRASHED if it already crashed.
    pub async fn stop(&mut self) {
        let current = self.state();
        match current {
            WorkerState::Stopped => return,
            WorkerState::NotStarted => {
                self.state.send_replace(WorkerState::Stopped);
                return;
            }
            WorkerState::Crashed => {}
            _ => {
                self.state.send_replace(WorkerState::Stopping);
                tracing::info!(pid = ?self.pid, "Stopping worker");
            }
        }

        self.close_stdin();

        let mut exited = self.exited.clone();
        if !*exited.borrow() {
            self.terminate();
            let graceful = tokio::time::timeout(self.grace, exited.wait_for(|done| *done))
                .await
                .is_ok();
            if !graceful {
                tracing::warn!(pid = ?self.pid, grace = ?self.grace, "Worker ignored termination, killing");
                if let Some(kill_tx) = self.kill_tx.take() {
                    let _ = kill_tx.send(());
                }
                let _ = exited.wait_for(|done| *done).await;
            }
        }

        self.state.send_if_modified(|s| {
            if *s == WorkerState::Stopping {
                *s = WorkerState::Stopped;
                true
            } else {
                false
            }
        });
        tracing::info!(state = %self.state(), "Worker stopped");
    }

    #[cfg(unix)]
    fn terminate(&self) {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        if let Some(pid) = self.pid
            && let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
        {
            tracing::debug!(pid, error = %e, "SIGTERM failed");
        }
    }

    #[cfg(not(unix))]
    fn terminate(&self) {
        // No SIGTERM; closing stdin is the graceful request.
    }
}

fn mark_crashed(state: &watch::Sender<WorkerState>) {
    state.send_if_modified(|s| {
        if s.is_live() {
            *s = WorkerState::Crashed;
            true
        } else {
            false
        }
    });
}

async fn write_stdin(
    mut writer: FramedWrite<ChildStdin, LineCodec>,
    mut lines: mpsc::Receiver<String>,
    state: Arc<watch::Sender<WorkerState>>,
    tx: mpsc::UnboundedSender<WorkerOutput>,
) {
    while let Some(line) = lines.recv().await {
        if let Err(e) = writer.send(line).await {
            tracing::error!(error = %e, "Failed to write to worker stdin");
            mark_crashed(&state);
            let _ = tx.send(WorkerOutput::StdinClosed(e.to_string()));
            return;
        }
    }
}

async fn forward_stdout(
    mut reader: FramedRead<tokio::process::ChildStdout, LineCodec>,
    tx: mpsc::UnboundedSender<WorkerOutput>,
) {
    while let Some(item) = reader.next().await {
        match item {
            Ok(line) => {
                if tx.send(WorkerOutput::Stdout(line)).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Worker stdout read error");
                break;
            }
        }
    }
}

async fn forward_stderr(
    mut reader: FramedRead<tokio::process::ChildStderr, LineCodec>,
    tx: mpsc::UnboundedSender<WorkerOutput>,
) {
    while let Some(item) = reader.next().await {
        match item {
            Ok(line) => {
                tracing::info!(target: "ipc_bridge::worker", "{}", line);
                if tx.send(WorkerOutput::Stderr(line)).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Worker stderr read error");
                break;
            }
        }
    }
}

async fn monitor_exit(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    state: Arc<watch::Sender<WorkerState>>,
    readers: [tokio::task::JoinHandle<()>; 2],
    tx: mpsc::UnboundedSender<WorkerOutput>,
    exited_tx: watch::Sender<bool>,
) {
    // A dropped kill sender (owner gone) also kills.
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_rx => {
            if let Err(e) = child.start_kill() {
                tracing::debug!(error = %e, "Kill failed");
            }
            child.wait().await
        }
    };

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to wait for worker");
            None
        }
    };

    if state.borrow().is_live() {
        tracing::error!(?code, "Worker exited unexpectedly");
        mark_crashed(&state);
    } else {
        tracing::debug!(?code, "Worker exited");
    }

    if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, futures::future::join_all(readers))
        .await
        .is_err()
    {
        tracing::debug!("Worker output still open after exit");
    }

    let _ = tx.send(WorkerOutput::Exited(code));
    let _ = exited_tx.send(true);
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> BridgeConfig {
        BridgeConfig::new(WorkerCommand::new("sh").args(["-c", script]))
            .with_stop_grace(Duration::from_millis(500))
    }

    async fn next_stdout(rx: &mut mpsc::UnboundedReceiver<WorkerOutput>) -> Option<String> {
        while let Some(out) = rx.recv().await {
            match out {
                WorkerOutput::Stdout(line) => return Some(line),
                WorkerOutput::Stderr(_) | WorkerOutput::StdinClosed(_) => continue,
                WorkerOutput::Exited(_) => return None,
            }
        }
        None
    }

    #[tokio::test]
    async fn lines_are_framed_and_blank_lines_skipped() {
        let (worker, mut rx) =
            WorkerProcess::start(&sh("printf 'one\\n\\n  \\ntw'; printf 'o\\n'; echo err >&2"))
                .unwrap();
        assert_eq!(worker.state(), WorkerState::Starting);

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit = None;
        while let Some(out) = rx.recv().await {
            match out {
                WorkerOutput::Stdout(l) => stdout.push(l),
                WorkerOutput::Stderr(l) => stderr.push(l),
                WorkerOutput::StdinClosed(e) => panic!("stdin closed: {e}"),
                WorkerOutput::Exited(code) => {
                    exit = Some(code);
                    break;
                }
            }
        }
        assert_eq!(stdout, vec!["one", "two"]);
        assert_eq!(stderr, vec!["err"]);
        assert_eq!(exit, Some(Some(0)));
    }

    #[tokio::test]
    async fn lifecycle_transitions_are_enforced() {
        let (mut worker, _rx) = WorkerProcess::start(&sh("cat")).unwrap();

        let err = worker.mark_running().unwrap_err();
        assert_eq!(
            err,
            TransitionError {
                from: WorkerState::Starting,
                to: WorkerState::Running,
            }
        );
        assert!(!worker.can_accept_requests());

        worker.mark_ready().unwrap();
        assert!(worker.can_accept_requests());
        assert!(worker.mark_ready().is_err());
        worker.mark_running().unwrap();
        assert_eq!(worker.state(), WorkerState::Running);

        worker.stop().await;
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert!(!worker.can_accept_requests());
    }

    #[tokio::test]
    async fn write_line_reaches_worker() {
        let (mut worker, mut rx) = WorkerProcess::start(&sh("read line; echo \"got:$line\"")).unwrap();
        worker.mark_ready().unwrap();
        assert!(worker.write_line("hello".to_string()));
        assert_eq!(next_stdout(&mut rx).await.as_deref(), Some("got:hello"));
    }

    #[tokio::test]
    async fn unexpected_exit_marks_crashed() {
        let (worker, mut rx) = WorkerProcess::start(&sh("exit 3")).unwrap();
        let mut state = worker.subscribe_state();
        loop {
            match rx.recv().await {
                Some(WorkerOutput::Exited(code)) => {
                    assert_eq!(code, Some(3));
                    break;
                }
                Some(_) => continue,
                None => panic!("output channel closed before exit"),
            }
        }
        state
            .wait_for(|s| *s == WorkerState::Crashed)
            .await
            .unwrap();
        assert!(!worker.can_accept_requests());
    }

    #[tokio::test]
    async fn write_to_closed_stdin_fails() {
        // Close stdin but stay alive so only the write path can notice.
        let (mut worker, mut rx) = WorkerProcess::start(&sh("exec 0<&-; sleep 5")).unwrap();
        worker.mark_ready().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(worker.write_line("x".repeat(128)));
        let closed = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match rx.recv().await {
                    Some(WorkerOutput::StdinClosed(reason)) => return reason,
                    Some(_) => continue,
                    None => panic!("output channel closed"),
                }
            }
        })
        .await
        .unwrap();
        assert!(!closed.is_empty());
        assert_eq!(worker.state(), WorkerState::Crashed);
        assert!(!worker.write_line("again".to_string()));

        worker.stop().await;
        assert_eq!(worker.state(), WorkerState::Crashed);
    }

    #[tokio::test]
    async fn write_line_never_waits_on_a_full_pipe() {
        // Alive but never reads stdin.
        let (mut worker, _rx) = WorkerProcess::start(&sh("sleep 30")).unwrap();
        worker.mark_ready().unwrap();

        // Larger than any pipe buffer, so the writer is stuck on it.
        assert!(worker.write_line("x".repeat(200 * 1024)));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut accepted = 0;
        while worker.write_line("y".to_string()) {
            accepted += 1;
            assert!(accepted <= WRITE_QUEUE_CAPACITY, "queue never filled");
        }
        assert_eq!(accepted, WRITE_QUEUE_CAPACITY);
        assert_eq!(worker.state(), WorkerState::Crashed);

        tokio::time::timeout(Duration::from_secs(3), worker.stop())
            .await
            .unwrap();
        assert_eq!(worker.state(), WorkerState::Crashed);
    }

    #[tokio::test]
    async fn stop_kills_worker_that_ignores_sigterm() {
        let (mut worker, _rx) =
            WorkerProcess::start(&sh("trap '' TERM; exec 0<&-; while :; do sleep 0.05; done"))
                .unwrap();
        worker.mark_ready().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = std::time::Instant::now();
        worker.stop().await;
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert!(started.elapsed() >= Duration::from_millis(400));

        worker.stop().await;
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let cfg = BridgeConfig::new(WorkerCommand::new("/nonexistent/worker-binary"));
        let err = WorkerProcess::start(&cfg).err().unwrap();
        assert!(matches!(err, SpawnError::Spawn(_)));
    }
}

//! Process execution and termination.
//!
//! `spawn_command` launches one external command and returns a
//! `ProcessHandle`. Each spawned process gets two pump tasks forwarding its
//! stdout/stderr lines to the log multiplexer and one waiter task that owns
//! the child, publishes its exit state, and performs forced kills.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::errors::{KillError, LaunchError};
use crate::output::{LogMux, StreamKind};
use crate::process::HandleState;

/// Bounded wait after a forced kill before the kill is declared failed.
const KILL_WAIT: Duration = Duration::from_secs(5);

/// The supervisor's reference to one spawned external process.
///
/// Handles are cheap to clone; all clones observe the same process. The
/// underlying `tokio::process::Child` is owned by a waiter task, so `wait`
/// suspends only its caller.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: u32,
    command: Arc<str>,
    started_at: Instant,
    exit_rx: watch::Receiver<Option<HandleState>>,
    kill_tx: mpsc::Sender<()>,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Current state without blocking.
    pub fn state(&self) -> HandleState {
        (*self.exit_rx.borrow()).unwrap_or(HandleState::Running)
    }

    /// Waits until the process exits and returns its terminal state.
    ///
    /// Returns immediately if it has already exited.
    pub async fn wait(&self) -> HandleState {
        let mut rx = self.exit_rx.clone();
        // The waiter task publishes a terminal state before dropping the
        // sender, so an error here can only mean the state is already set.
        let result = match rx.wait_for(|state| state.is_some()).await {
            Ok(state) => (*state).unwrap_or(HandleState::Killed),
            Err(_) => self.state(),
        };
        result
    }

    /// Requests graceful shutdown, escalating to a forced kill after `grace`.
    ///
    /// Idempotent: terminating an already-exited handle is a no-op. Only a
    /// forced kill that itself fails to take within a bounded window is an
    /// error.
    pub async fn terminate(&self, grace: Duration) -> Result<(), KillError> {
        if !self.state().is_running() {
            return Ok(());
        }
        debug!(pid = self.pid, command = %self.command, "sending graceful signal");
        send_graceful_signal(self.pid);
        if self.exited_within(grace).await {
            return Ok(());
        }
        warn!(pid = self.pid, command = %self.command, "grace period expired, killing");
        // Capacity-1 channel: a pending kill request is already enough.
        let _ = self.kill_tx.try_send(());
        if self.exited_within(KILL_WAIT).await {
            Ok(())
        } else {
            Err(KillError {
                pid: self.pid,
                command: self.command.to_string(),
            })
        }
    }

    async fn exited_within(&self, window: Duration) -> bool {
        tokio::time::timeout(window, self.wait()).await.is_ok()
    }
}

/// Spawns `command_text` in `dir` with exactly the environment `env`.
///
/// The command string is split with shell-words rules; the first word must
/// resolve to an executable. Output pumps and the waiter task are wired to
/// `mux` before this returns.
pub async fn spawn_command(
    project_id: &str,
    command_text: &str,
    dir: &Path,
    env: &HashMap<String, String>,
    mux: &LogMux,
) -> Result<ProcessHandle, LaunchError> {
    if !dir.is_dir() {
        return Err(LaunchError::MissingWorkdir(dir.to_path_buf()));
    }
    let mut parts = shell_words::split(command_text)
        .map_err(|_| LaunchError::InvalidCommand(command_text.to_string()))?;
    if parts.is_empty() {
        return Err(LaunchError::InvalidCommand(command_text.to_string()));
    }
    let program = parts.remove(0);

    let mut command = Command::new(&program);
    command.args(&parts);
    command.current_dir(dir);
    command.env_clear();
    command.envs(env);
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    command.kill_on_drop(true);

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
        command.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }

    // Own process group so signals reach the whole npm/node tree.
    #[cfg(unix)]
    unsafe {
        command.pre_exec(|| {
            let _ = libc::setpgid(0, 0);
            Ok(())
        });
    }

    let mut child = command.spawn().map_err(|source| LaunchError::Spawn {
        command: command_text.to_string(),
        source,
    })?;
    let pid = child.id().unwrap_or(0);
    debug!(project = project_id, pid, command = command_text, "spawned");

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(read_stream(
            project_id.to_string(),
            command_text.to_string(),
            StreamKind::Stdout,
            stdout,
            mux.clone(),
        ));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(read_stream(
            project_id.to_string(),
            command_text.to_string(),
            StreamKind::Stderr,
            stderr,
            mux.clone(),
        ));
    }

    let (exit_tx, exit_rx) = watch::channel(None);
    let (kill_tx, kill_rx) = mpsc::channel(1);
    tokio::spawn(supervise_child(
        child,
        project_id.to_string(),
        command_text.to_string(),
        exit_tx,
        kill_rx,
        mux.clone(),
    ));

    Ok(ProcessHandle {
        pid,
        command: Arc::from(command_text),
        started_at: Instant::now(),
        exit_rx,
        kill_tx,
    })
}

/// Owns the child until it exits; forced kills are routed through here so no
/// other task needs mutable access to the `Child`.
async fn supervise_child(
    mut child: tokio::process::Child,
    project: String,
    command: String,
    exit_tx: watch::Sender<Option<HandleState>>,
    mut kill_rx: mpsc::Receiver<()>,
    mux: LogMux,
) {
    let mut killed = false;
    let state = loop {
        tokio::select! {
            status = child.wait() => {
                break match status {
                    Ok(_) if killed => HandleState::Killed,
                    Ok(status) => HandleState::Exited(status.code()),
                    Err(err) => {
                        warn!(project = %project, command = %command, error = %err, "wait failed");
                        HandleState::Killed
                    }
                };
            }
            Some(()) = kill_rx.recv() => {
                killed = true;
                let _ = child.start_kill();
            }
        }
    };

    // Publish the terminal state first so waiters are never held up by a
    // slow log consumer.
    let _ = exit_tx.send(Some(state));

    let notice = match state {
        HandleState::Exited(Some(0)) => "process ended successfully".to_string(),
        HandleState::Exited(Some(code)) => format!("process ended with code {}", code),
        HandleState::Exited(None) => "process ended".to_string(),
        HandleState::Killed => "process killed".to_string(),
        HandleState::Running => unreachable!("waiter only publishes terminal states"),
    };
    mux.emit(&project, &command, notice, StreamKind::Supervisor)
        .await;
}

async fn read_stream<R>(
    project: String,
    tag: String,
    stream: StreamKind,
    reader: R,
    mux: LogMux,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        mux.emit(&project, &tag, line, stream).await;
    }
}

#[cfg(unix)]
fn send_graceful_signal(pid: u32) {
    unsafe {
        let pid = pid as i32;
        let _ = libc::kill(-pid, libc::SIGTERM);
        let _ = libc::kill(pid, libc::SIGTERM);
    }
}

#[cfg(all(not(unix), windows))]
fn send_graceful_signal(pid: u32) {
    use windows_sys::Win32::System::Console::GenerateConsoleCtrlEvent;
    use windows_sys::Win32::System::Console::CTRL_BREAK_EVENT;
    // Windows has no SIGTERM; CTRL_BREAK is the closest console signal.
    unsafe {
        let _ = GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid);
    }
}

#[cfg(all(not(unix), not(windows)))]
fn send_graceful_signal(_pid: u32) {}

//! Version-control synchronization of project source trees.
//!
//! An update shells out to the configured sync command (by default
//! `git pull origin main`) in the project's working directory. The command's
//! output is streamed to the log multiplexer like any child process, and the
//! tail is retained so a failure can be reported with context.

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::info;

use crate::errors::{LaunchError, Result, SupervisorError};
use crate::output::{LogMux, StreamKind, TailBuffer};
use crate::process::Project;

/// Fallback sync command when neither the global config nor the project
/// overrides it.
pub const DEFAULT_UPDATE_CMD: &str = "git pull origin main";

/// How many trailing output lines an `UpdateFailed` error carries.
const TAIL_LINES: usize = 20;

/// Runs the sync command for `project` and waits for it to finish.
///
/// The caller (the registry) is responsible for holding the project's
/// operation gate and for the `Updating` phase around this call; update and
/// run never overlap.
pub async fn run_update(project: &Project, default_cmd: &str, mux: &LogMux) -> Result<()> {
    let command_text = project.update_cmd.as_deref().unwrap_or(default_cmd);
    if !project.dir.is_dir() {
        return Err(LaunchError::MissingWorkdir(project.dir.clone()).into());
    }
    let mut parts = shell_words::split(command_text)
        .map_err(|_| LaunchError::InvalidCommand(command_text.to_string()))?;
    if parts.is_empty() {
        return Err(LaunchError::InvalidCommand(command_text.to_string()).into());
    }
    let program = parts.remove(0);

    info!(project = %project.id, command = command_text, "updating");
    let mut command = Command::new(&program);
    command.args(&parts);
    command.current_dir(&project.dir);
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    command.kill_on_drop(true);

    let mut child = command.spawn().map_err(|source| LaunchError::Spawn {
        command: command_text.to_string(),
        source,
    })?;

    // Funnel both streams through one channel so the tail sees them in
    // arrival order.
    let (line_tx, mut line_rx) = mpsc::channel::<(StreamKind, String)>(64);
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_lines(stdout, StreamKind::Stdout, line_tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_lines(stderr, StreamKind::Stderr, line_tx.clone()));
    }
    drop(line_tx);

    let mut tail = TailBuffer::new(TAIL_LINES);
    while let Some((stream, line)) = line_rx.recv().await {
        tail.push(line.clone());
        mux.emit(&project.id, command_text, line, stream).await;
    }

    let status = child.wait().await.map_err(|source| LaunchError::Spawn {
        command: command_text.to_string(),
        source,
    })?;

    if status.success() {
        mux.emit(
            &project.id,
            command_text,
            "update complete".to_string(),
            StreamKind::Supervisor,
        )
        .await;
        Ok(())
    } else {
        Err(SupervisorError::UpdateFailed {
            project: project.id.clone(),
            code: status.code().unwrap_or(-1),
            tail: tail.into_lines(),
        })
    }
}

async fn forward_lines<R>(reader: R, stream: StreamKind, tx: mpsc::Sender<(StreamKind, String)>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send((stream, line)).await.is_err() {
            break;
        }
    }
}

//! Crate-wide error types.
//!
//! Every rejected registry operation maps to one named variant here so the
//! caller always learns the specific reason, never a generic failure.

use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by registry operations.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("unknown project '{0}'")]
    UnknownProject(String),

    #[error("project '{0}' is already running or starting")]
    AlreadyRunning(String),

    #[error("project '{0}' has an update in progress")]
    UpdateInProgress(String),

    #[error("project '{0}' must be stopped first")]
    Running(String),

    #[error("start of '{0}' was interrupted by a stop request")]
    StartInterrupted(String),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("update of '{project}' failed with exit code {code}")]
    UpdateFailed {
        project: String,
        code: i32,
        /// Last lines of the sync command's combined output.
        tail: Vec<String>,
    },

    #[error(transparent)]
    Kill(#[from] KillError),
}

/// Failures while launching a single command.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("working directory {0} does not exist")]
    MissingWorkdir(PathBuf),

    #[error("cannot parse command '{0}'")]
    InvalidCommand(String),

    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// A forced kill did not take; the process may be left behind.
#[derive(Debug, Error)]
#[error("failed to kill pid {pid} ('{command}')")]
pub struct KillError {
    pub pid: u32,
    pub command: String,
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

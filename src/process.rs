//! Data structures for projects and their runtime state.
//!
//! A `Project` is the normalized, validated form of one `[[project]]` config
//! entry. `ProjectStatus` is derived from the handles a project currently
//! owns; it is never stored across supervisor restarts.

use std::collections::HashMap;
use std::path::PathBuf;

/// One managed unit of work: a working directory, launch commands, and
/// network/environment configuration.
#[derive(Debug, Clone)]
pub struct Project {
    /// Stable identifier, unique within the registry.
    pub id: String,
    /// Absolute working directory for all of the project's commands.
    pub dir: PathBuf,
    /// Launch commands, spawned in declared order. Never empty.
    pub commands: Vec<String>,
    /// Port injected into the environment.
    pub port: u16,
    /// Name of the environment variable receiving the port.
    pub port_var: String,
    /// Extra environment variables, overlaid last.
    pub env: HashMap<String, String>,
    /// Human label; falls back to `id`.
    pub display_name: String,
    /// Per-project override of the version-control sync command.
    pub update_cmd: Option<String>,
}

/// The derived lifecycle state of a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectStatus {
    /// No live handles; start and update are accepted.
    Stopped,
    /// A start operation is spawning the command sequence.
    Starting,
    /// Every declared command has a live handle.
    Running,
    /// Termination was requested; handles are still exiting.
    Stopping,
    /// The update lock is held; run operations are rejected.
    Updating,
}

impl ProjectStatus {
    /// Short operator-facing label.
    pub fn label(&self) -> &'static str {
        match self {
            ProjectStatus::Stopped => "stopped",
            ProjectStatus::Starting => "starting",
            ProjectStatus::Running => "running",
            ProjectStatus::Stopping => "stopping",
            ProjectStatus::Updating => "updating",
        }
    }
}

/// Terminal or live state of a single spawned command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// The process is alive.
    Running,
    /// The process exited on its own; `None` means it died to a signal.
    Exited(Option<i32>),
    /// The process was forcefully killed by the supervisor.
    Killed,
}

impl HandleState {
    pub fn is_running(&self) -> bool {
        matches!(self, HandleState::Running)
    }
}

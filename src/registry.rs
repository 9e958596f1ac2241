//! The supervisor registry: the single source of truth for project state.
//!
//! Each project gets one `ProjectSlot`. The slot's tokio mutex gate
//! serializes start/stop/update on that project; slots for different
//! projects share nothing, so operations across projects run fully in
//! parallel. The authoritative runtime state (phase + handles) sits behind a
//! plain mutex that is never held across an await point, which keeps status
//! queries non-blocking even while an operation is in flight.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::env;
use crate::errors::{Result, SupervisorError};
use crate::output::{LogMux, StreamKind};
use crate::process::{Project, ProjectStatus};
use crate::runner::{self, ProcessHandle};
use crate::update;

/// Tag used for lines the supervisor itself writes to the multiplexer.
pub const SUPERVISOR_TAG: &str = "supervisor";

/// Registry-wide tunables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Time allowed for graceful shutdown before a forced kill.
    pub grace: Duration,
    /// Default version-control sync command; projects may override it.
    pub update_cmd: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            grace: Duration::from_millis(3000),
            update_cmd: update::DEFAULT_UPDATE_CMD.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Starting,
    Running,
    Stopping,
    Updating,
}

struct SlotState {
    phase: Phase,
    handles: Vec<ProcessHandle>,
    /// Bumped by every start attempt; guards the reaper against clearing a
    /// newer attempt's handles.
    generation: u64,
}

/// Per-project supervision state.
struct ProjectSlot {
    project: Project,
    /// Serializes start/stop/update for this project.
    gate: Mutex<()>,
    state: StdMutex<SlotState>,
    /// Set by `stop` so an in-flight start aborts between spawns.
    stop_requested: AtomicBool,
}

impl ProjectSlot {
    fn new(project: Project) -> Self {
        Self {
            project,
            gate: Mutex::new(()),
            state: StdMutex::new(SlotState {
                phase: Phase::Idle,
                handles: Vec::new(),
                generation: 0,
            }),
            stop_requested: AtomicBool::new(false),
        }
    }

    /// Derives the project status from the current phase and handle states.
    fn status(&self) -> ProjectStatus {
        let state = self.state.lock().unwrap();
        match state.phase {
            Phase::Updating => ProjectStatus::Updating,
            Phase::Starting => ProjectStatus::Starting,
            Phase::Stopping => ProjectStatus::Stopping,
            Phase::Idle | Phase::Running => {
                if state.handles.iter().any(|h| h.state().is_running()) {
                    ProjectStatus::Running
                } else {
                    ProjectStatus::Stopped
                }
            }
        }
    }

    /// Clears handles whose processes have all exited naturally.
    ///
    /// Called with the gate held, before an operation decides whether the
    /// project counts as stopped.
    fn reap_exited(&self) {
        let mut state = self.state.lock().unwrap();
        if matches!(state.phase, Phase::Idle | Phase::Running)
            && !state.handles.is_empty()
            && state.handles.iter().all(|h| !h.state().is_running())
        {
            state.handles.clear();
            state.phase = Phase::Idle;
        }
    }
}

/// Maps project identity to supervision state and routes operations.
pub struct Registry {
    slots: HashMap<String, Arc<ProjectSlot>>,
    mux: LogMux,
    settings: Settings,
}

impl Registry {
    /// Builds a registry over an already-validated project list.
    pub fn new(projects: Vec<Project>, mux: LogMux, settings: Settings) -> Self {
        let slots = projects
            .into_iter()
            .map(|p| (p.id.clone(), Arc::new(ProjectSlot::new(p))))
            .collect();
        Self {
            slots,
            mux,
            settings,
        }
    }

    fn slot(&self, id: &str) -> Result<&Arc<ProjectSlot>> {
        self.slots
            .get(id)
            .ok_or_else(|| SupervisorError::UnknownProject(id.to_string()))
    }

    /// The project definition behind `id`.
    pub fn project(&self, id: &str) -> Result<&Project> {
        self.slot(id).map(|slot| &slot.project)
    }

    /// Current status of one project. Never blocks on in-flight operations.
    pub fn status(&self, id: &str) -> Result<ProjectStatus> {
        self.slot(id).map(|slot| slot.status())
    }

    /// Number of live process handles the project currently owns.
    pub fn live_handles(&self, id: &str) -> Result<usize> {
        self.slot(id).map(|slot| {
            slot.state
                .lock()
                .unwrap()
                .handles
                .iter()
                .filter(|h| h.state().is_running())
                .count()
        })
    }

    /// Status snapshot of every project, sorted by id for stable display.
    pub fn statuses(&self) -> Vec<(String, ProjectStatus)> {
        let mut all: Vec<_> = self
            .slots
            .values()
            .map(|slot| (slot.project.id.clone(), slot.status()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Launches the project's command sequence.
    ///
    /// Rejected with a named error unless the project is `Stopped`. Commands
    /// spawn in declared order; each is spawned once the previous spawn
    /// succeeds (install-then-start). Any spawn failure tears down the
    /// attempt's handles and leaves the project `Stopped`.
    pub async fn start(&self, id: &str) -> Result<()> {
        let slot = Arc::clone(self.slot(id)?);
        reject_start(slot.status(), id)?;
        let _gate = slot.gate.lock().await;
        // Re-check under the gate; a racing operation may have won.
        slot.reap_exited();
        reject_start(slot.status(), id)?;
        slot.stop_requested.store(false, Ordering::SeqCst);

        let generation = {
            let mut state = slot.state.lock().unwrap();
            state.phase = Phase::Starting;
            state.generation += 1;
            state.generation
        };

        let project = &slot.project;
        let resolved = env::resolve(
            std::env::vars(),
            project.port,
            &project.port_var,
            &project.env,
        );
        self.mux
            .emit(
                &project.id,
                SUPERVISOR_TAG,
                format!("starting {}", project.display_name),
                StreamKind::Supervisor,
            )
            .await;

        let mut spawned: Vec<ProcessHandle> = Vec::with_capacity(project.commands.len());
        for command_text in &project.commands {
            if slot.stop_requested.load(Ordering::SeqCst) {
                info!(project = %project.id, "start interrupted by stop");
                teardown(&slot, &spawned, self.settings.grace).await;
                return Err(SupervisorError::StartInterrupted(project.id.clone()));
            }
            match runner::spawn_command(
                &project.id,
                command_text,
                &project.dir,
                &resolved,
                &self.mux,
            )
            .await
            {
                Ok(handle) => {
                    slot.state.lock().unwrap().handles.push(handle.clone());
                    spawned.push(handle);
                }
                Err(err) => {
                    warn!(
                        project = %project.id,
                        command = command_text,
                        error = %err,
                        "spawn failed, aborting start"
                    );
                    teardown(&slot, &spawned, self.settings.grace).await;
                    return Err(err.into());
                }
            }
        }

        slot.state.lock().unwrap().phase = Phase::Running;
        info!(project = %project.id, commands = spawned.len(), "running");
        spawn_reaper(Arc::clone(&slot), spawned, generation, self.mux.clone());
        Ok(())
    }

    /// Stops the project, waiting out the grace period where needed.
    ///
    /// Idempotent; accepted in every state. A stop issued while a start is
    /// mid-sequence cancels the remaining spawns first.
    pub async fn stop(&self, id: &str) -> Result<()> {
        let slot = Arc::clone(self.slot(id)?);
        stop_slot(slot, self.mux.clone(), self.settings.grace).await
    }

    /// Runs the version-control sync command for the project.
    ///
    /// Rejected unless the project is fully `Stopped`; update and run are
    /// mutually exclusive.
    pub async fn update(&self, id: &str) -> Result<()> {
        let slot = Arc::clone(self.slot(id)?);
        reject_update(slot.status(), id)?;
        let _gate = slot.gate.lock().await;
        slot.reap_exited();
        reject_update(slot.status(), id)?;

        slot.state.lock().unwrap().phase = Phase::Updating;
        let result = update::run_update(&slot.project, &self.settings.update_cmd, &self.mux).await;
        slot.state.lock().unwrap().phase = Phase::Idle;
        result
    }

    /// Stops every project concurrently. Used on supervisor shutdown.
    pub async fn stop_all(&self) {
        let mut tasks = Vec::with_capacity(self.slots.len());
        for slot in self.slots.values() {
            let slot = Arc::clone(slot);
            let mux = self.mux.clone();
            let grace = self.settings.grace;
            tasks.push(tokio::spawn(stop_slot(slot, mux, grace)));
        }
        for task in tasks {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(error = %err, "stop failed during shutdown"),
                Err(err) => warn!(error = %err, "stop task panicked during shutdown"),
            }
        }
    }

    /// Replaces the project set after a config reload.
    ///
    /// Slots that are not `Stopped` keep their previous definition (and stay
    /// addressable if they were removed from config) until the operator
    /// stops them; everything else is swapped for the new definition.
    pub fn reload(&mut self, projects: Vec<Project>) {
        let mut next = HashMap::with_capacity(projects.len());
        for project in projects {
            match self.slots.remove(&project.id) {
                Some(slot) if slot.status() != ProjectStatus::Stopped => {
                    warn!(
                        project = %project.id,
                        "not stopped; keeping previous definition until stopped"
                    );
                    next.insert(project.id, slot);
                }
                _ => {
                    next.insert(project.id.clone(), Arc::new(ProjectSlot::new(project)));
                }
            }
        }
        for (id, slot) in self.slots.drain() {
            if slot.status() != ProjectStatus::Stopped {
                warn!(project = %id, "removed from config while running; keeping until stopped");
                next.insert(id, slot);
            }
        }
        self.slots = next;
    }
}

fn reject_start(status: ProjectStatus, id: &str) -> Result<()> {
    match status {
        ProjectStatus::Stopped => Ok(()),
        ProjectStatus::Updating => Err(SupervisorError::UpdateInProgress(id.to_string())),
        _ => Err(SupervisorError::AlreadyRunning(id.to_string())),
    }
}

fn reject_update(status: ProjectStatus, id: &str) -> Result<()> {
    match status {
        ProjectStatus::Stopped => Ok(()),
        ProjectStatus::Updating => Err(SupervisorError::UpdateInProgress(id.to_string())),
        _ => Err(SupervisorError::Running(id.to_string())),
    }
}

async fn stop_slot(slot: Arc<ProjectSlot>, mux: LogMux, grace: Duration) -> Result<()> {
    slot.stop_requested.store(true, Ordering::SeqCst);
    let _gate = slot.gate.lock().await;
    slot.stop_requested.store(false, Ordering::SeqCst);

    let handles: Vec<ProcessHandle> = {
        let mut state = slot.state.lock().unwrap();
        if state.handles.is_empty() {
            state.phase = Phase::Idle;
            return Ok(());
        }
        state.phase = Phase::Stopping;
        state.handles.clone()
    };

    mux.emit(
        &slot.project.id,
        SUPERVISOR_TAG,
        format!("stopping {}", slot.project.display_name),
        StreamKind::Supervisor,
    )
    .await;

    let mut tasks = Vec::with_capacity(handles.len());
    for handle in &handles {
        let handle = handle.clone();
        tasks.push(tokio::spawn(async move { handle.terminate(grace).await }));
    }
    let mut kill_failure = None;
    for task in tasks {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => kill_failure = Some(err),
            Err(err) => warn!(project = %slot.project.id, error = %err, "terminate task panicked"),
        }
    }

    {
        // A handle that survived a failed kill stays tracked; everything
        // else is cleared.
        let mut state = slot.state.lock().unwrap();
        state.handles.retain(|h| h.state().is_running());
        state.phase = Phase::Idle;
    }

    match kill_failure {
        Some(err) => Err(err.into()),
        None => {
            mux.emit(
                &slot.project.id,
                SUPERVISOR_TAG,
                format!("{} stopped", slot.project.display_name),
                StreamKind::Supervisor,
            )
            .await;
            Ok(())
        }
    }
}

/// Terminates the handles of a failed or interrupted start attempt.
async fn teardown(slot: &Arc<ProjectSlot>, spawned: &[ProcessHandle], grace: Duration) {
    for handle in spawned {
        if let Err(err) = handle.terminate(grace).await {
            warn!(project = %slot.project.id, error = %err, "cleanup kill failed");
        }
    }
    let mut state = slot.state.lock().unwrap();
    state.handles.retain(|h| h.state().is_running());
    state.phase = Phase::Idle;
}

/// Waits for every handle of one start attempt to exit, then clears the set.
fn spawn_reaper(
    slot: Arc<ProjectSlot>,
    handles: Vec<ProcessHandle>,
    generation: u64,
    mux: LogMux,
) {
    tokio::spawn(async move {
        for handle in &handles {
            handle.wait().await;
        }
        let reaped = {
            let mut state = slot.state.lock().unwrap();
            if state.generation == generation && state.phase == Phase::Running {
                state.handles.clear();
                state.phase = Phase::Idle;
                true
            } else {
                false
            }
        };
        if reaped {
            info!(project = %slot.project.id, "all processes exited");
            mux.emit(
                &slot.project.id,
                SUPERVISOR_TAG,
                format!("{} stopped (all processes exited)", slot.project.display_name),
                StreamKind::Supervisor,
            )
            .await;
        }
    });
}

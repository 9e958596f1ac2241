//! Nodeyard: a supervisor for locally hosted Node.js project fleets.
//!
//! This is the CLI entry point. It loads the configuration, builds the
//! supervisor registry, and either runs projects in the foreground
//! (streaming their multiplexed output) or performs a one-shot operation
//! (list/update/add/remove).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{error, info};

use nodeyard::config::{self, Config, ProjectConfig};
use nodeyard::logging;
use nodeyard::output::{self, LogRecord};
use nodeyard::{ProjectStatus, Registry, Settings, SupervisorError};

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "nodeyard",
    version,
    about = "Supervise local Node.js projects: run, stop, update"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    /// Path to nodeyard.toml configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Grace period override in milliseconds.
    #[arg(long, global = true)]
    grace_ms: Option<u64>,
    /// Supervisor diagnostic log level (error, warn, info, debug, trace).
    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start projects and stream their output until interrupted (default).
    Run {
        /// Projects to start; all configured projects when omitted.
        projects: Vec<String>,
        /// Strip ANSI escape codes from displayed lines.
        #[arg(long)]
        strip_ansi: bool,
        /// Prepend a timestamp to each displayed line.
        #[arg(long)]
        timestamp: bool,
    },
    /// List configured projects.
    List,
    /// Synchronize a project's source tree (project must be stopped).
    Update {
        /// Project id.
        project: String,
    },
    /// Add a project to the configuration.
    Add {
        /// Project id.
        id: String,
        /// Project working directory.
        #[arg(long)]
        dir: PathBuf,
        /// Port passed to the project's environment.
        #[arg(long, default_value_t = 3000)]
        port: u16,
        /// Launch command; repeat for a sequence. Defaults to "npm start".
        #[arg(long = "command")]
        commands: Vec<String>,
        /// Environment variable name receiving the port.
        #[arg(long)]
        port_var: Option<String>,
        /// Human label for listings and logs.
        #[arg(long)]
        display_name: Option<String>,
        /// Extra environment entries (KEY=VALUE); repeatable.
        #[arg(long)]
        env: Vec<String>,
    },
    /// Remove a project from the configuration.
    Remove {
        /// Project id.
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut cli = Cli::parse();
    let level = match cli.log_level.as_deref() {
        Some(raw) => Some(
            logging::parse_level_str(raw)
                .ok_or_else(|| anyhow!("invalid log level: {}", raw))?,
        ),
        None => None,
    };
    logging::init_logging(level)?;

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from("nodeyard.toml"));

    let command = cli.command.take();
    match command {
        Some(Commands::List) => list_projects(&config_path),
        Some(Commands::Update { project }) => update_project(&config_path, &cli, &project).await,
        Some(Commands::Add {
            id,
            dir,
            port,
            commands,
            port_var,
            display_name,
            env,
        }) => add_project(
            &config_path,
            id,
            dir,
            port,
            commands,
            port_var,
            display_name,
            env,
        ),
        Some(Commands::Remove { id }) => remove_project(&config_path, &id),
        Some(Commands::Run {
            projects,
            strip_ansi,
            timestamp,
        }) => run_projects(&config_path, &cli, projects, strip_ansi, timestamp).await,
        None => run_projects(&config_path, &cli, Vec::new(), false, false).await,
    }
}

/// Loads the config and applies CLI overrides to the registry settings.
fn load(config_path: &Path, cli: &Cli) -> Result<(Config, Settings)> {
    let config = config::load_config(config_path)?;
    let mut settings = config.settings();
    if let Some(grace_ms) = cli.grace_ms {
        settings.grace = Duration::from_millis(grace_ms);
    }
    Ok((config, settings))
}

async fn run_projects(
    config_path: &Path,
    cli: &Cli,
    selected: Vec<String>,
    strip_ansi: bool,
    timestamp: bool,
) -> Result<()> {
    let (config, settings) = load(config_path, cli)?;
    let projects = config.normalized_projects()?;
    if projects.is_empty() {
        bail!("no projects configured (add one with `nodeyard add`)");
    }

    let selected = if selected.is_empty() {
        let mut all: Vec<String> = projects.iter().map(|p| p.id.clone()).collect();
        all.sort();
        all
    } else {
        for id in &selected {
            if !projects.iter().any(|p| p.id == *id) {
                bail!("unknown project '{}'", id);
            }
        }
        selected
    };

    let display = DisplayOptions {
        strip_ansi: strip_ansi || config.strip_ansi.unwrap_or(false),
        timestamp: timestamp || config.timestamp.unwrap_or(false),
        prefix_width: selected.iter().map(String::len).max().unwrap_or(0) + 2,
    };
    let (mux, rx) = output::log_channel(config.log_capacity.unwrap_or(256));
    let mut registry = Registry::new(projects, mux, settings);
    let printer = tokio::spawn(print_records(rx, display));

    info!(projects = selected.len(), "supervisor starting");
    for id in &selected {
        if let Err(err) = registry.start(id).await {
            error!(project = %id, error = %err, "start failed");
            eprintln!("nodeyard: failed to start '{}': {}", id, err);
        }
    }

    #[cfg(unix)]
    let mut hup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()).ok();
    #[cfg(not(unix))]
    let mut hup = ();

    let mut ticker = tokio::time::interval(Duration::from_millis(300));
    loop {
        tokio::select! {
            _ = shutdown_signal() => {
                eprintln!("nodeyard: shutting down");
                break;
            }
            _ = recv_reload(&mut hup) => {
                match config::load_config(config_path)
                    .and_then(|c| c.normalized_projects())
                {
                    Ok(projects) => {
                        registry.reload(projects);
                        eprintln!("nodeyard: configuration reloaded");
                    }
                    Err(err) => error!(error = %err, "config reload failed"),
                }
            }
            _ = ticker.tick() => {
                let all_stopped = selected.iter().all(|id| {
                    matches!(registry.status(id), Ok(ProjectStatus::Stopped))
                });
                if all_stopped {
                    break;
                }
            }
        }
    }

    registry.stop_all().await;
    for (id, status) in registry.statuses() {
        info!(project = %id, status = status.label(), "final state");
    }
    drop(registry);
    let _ = printer.await;
    Ok(())
}

fn list_projects(config_path: &Path) -> Result<()> {
    let config = config::load_config(config_path)?;
    let mut projects = config.normalized_projects()?;
    projects.sort_by(|a, b| a.id.cmp(&b.id));
    if projects.is_empty() {
        println!("no projects configured");
        return Ok(());
    }
    for project in &projects {
        println!(
            "{}  port {}  {}  {}",
            project.id,
            project.port,
            project.dir.display(),
            project.commands.join(" && "),
        );
    }
    Ok(())
}

async fn update_project(config_path: &Path, cli: &Cli, id: &str) -> Result<()> {
    let (config, settings) = load(config_path, cli)?;
    let projects = config.normalized_projects()?;
    let (mux, rx) = output::log_channel(config.log_capacity.unwrap_or(256));
    let registry = Registry::new(projects, mux, settings);
    let display = DisplayOptions {
        strip_ansi: config.strip_ansi.unwrap_or(false),
        timestamp: false,
        prefix_width: id.len() + 2,
    };
    let printer = tokio::spawn(print_records(rx, display));

    let result = registry.update(id).await;
    drop(registry);
    let _ = printer.await;

    match result {
        Ok(()) => Ok(()),
        Err(SupervisorError::UpdateFailed {
            project,
            code,
            tail,
        }) => {
            eprintln!("nodeyard: update of '{}' failed with exit code {}", project, code);
            for line in &tail {
                eprintln!("  {}", line);
            }
            bail!("update failed");
        }
        Err(err) => Err(err.into()),
    }
}

#[allow(clippy::too_many_arguments)]
fn add_project(
    config_path: &Path,
    id: String,
    dir: PathBuf,
    port: u16,
    commands: Vec<String>,
    port_var: Option<String>,
    display_name: Option<String>,
    env: Vec<String>,
) -> Result<()> {
    let mut config = if config_path.exists() {
        config::load_config(config_path)?
    } else {
        Config::default()
    };
    if config.projects.iter().any(|p| p.id == id) {
        bail!("project '{}' already exists", id);
    }
    let dir = dir
        .canonicalize()
        .with_context(|| format!("project directory {} does not exist", dir.display()))?;
    let mut extra = HashMap::new();
    for entry in &env {
        let (key, value) = split_env(entry)?;
        extra.insert(key, value);
    }
    let commands = if commands.is_empty() {
        vec!["npm start".to_string()]
    } else {
        commands
    };
    config.projects.push(ProjectConfig {
        id: id.clone(),
        dir,
        commands,
        port,
        port_var,
        env: if extra.is_empty() { None } else { Some(extra) },
        display_name,
        update_cmd: None,
    });
    // Validate the edited set before persisting it.
    config.normalized_projects()?;
    config::save_config(config_path, &config)?;
    println!("added '{}' on port {}", id, port);
    Ok(())
}

fn remove_project(config_path: &Path, id: &str) -> Result<()> {
    let mut config = config::load_config(config_path)?;
    let before = config.projects.len();
    config.projects.retain(|p| p.id != id);
    if config.projects.len() == before {
        bail!("unknown project '{}'", id);
    }
    config::save_config(config_path, &config)?;
    println!("removed '{}'", id);
    Ok(())
}

#[derive(Debug, Clone, Copy)]
struct DisplayOptions {
    strip_ansi: bool,
    timestamp: bool,
    prefix_width: usize,
}

/// Consumes the multiplexer and renders each record to stdout.
async fn print_records(mut rx: mpsc::Receiver<LogRecord>, opts: DisplayOptions) {
    while let Some(record) = rx.recv().await {
        let line = output::sanitize_text(&record.line, opts.strip_ansi);
        let prefix = format!("[{}]", record.project);
        if opts.timestamp {
            let at = chrono::DateTime::<chrono::Local>::from(record.at).format("%H:%M:%S");
            println!("{} {:<width$} {}", at, prefix, line, width = opts.prefix_width);
        } else {
            println!("{:<width$} {}", prefix, line, width = opts.prefix_width);
        }
    }
}

/// Resolves when the operator asks for a config reload (SIGHUP).
#[cfg(unix)]
async fn recv_reload(hup: &mut Option<tokio::signal::unix::Signal>) {
    match hup {
        Some(signal) => {
            if signal.recv().await.is_none() {
                // Signal stream closed; stop offering reloads.
                *hup = None;
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(not(unix))]
async fn recv_reload(_hup: &mut ()) {
    std::future::pending::<()>().await
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn split_env(value: &str) -> Result<(String, String)> {
    let (key, val) = value
        .split_once('=')
        .ok_or_else(|| anyhow!("invalid env {}, expected KEY=VALUE", value))?;
    Ok((key.to_string(), val.to_string()))
}

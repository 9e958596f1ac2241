//! Configuration management for Nodeyard.
//!
//! This module defines the structure of the `nodeyard.toml` configuration
//! file, loads and validates it into normalized `Project` records, and
//! writes it back when the operator adds or removes projects.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::process::Project;
use crate::registry::Settings;
use crate::update::DEFAULT_UPDATE_CMD;

/// Top-level configuration structure corresponding to `nodeyard.toml`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Grace period in milliseconds before a stop escalates to a kill.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grace_ms: Option<u64>,
    /// Default version-control sync command for `update`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_cmd: Option<String>,
    /// Capacity of the multiplexed log channel.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_capacity: Option<usize>,
    /// Whether to strip ANSI escape codes from displayed lines.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strip_ansi: Option<bool>,
    /// Whether to prepend timestamps to displayed lines.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<bool>,
    /// Managed projects.
    #[serde(rename = "project", default)]
    pub projects: Vec<ProjectConfig>,
}

/// Configuration for a single project.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProjectConfig {
    /// Stable identifier, unique across the file.
    pub id: String,
    /// Absolute working directory.
    pub dir: PathBuf,
    /// Launch commands, run in declared order.
    pub commands: Vec<String>,
    /// Port injected into the environment.
    pub port: u16,
    /// Environment variable name receiving the port (default `PORT`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_var: Option<String>,
    /// Extra environment variables, overlaid last.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
    /// Human label shown in logs and listings (default: `id`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Per-project override of the sync command.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_cmd: Option<String>,
}

impl Config {
    /// Registry settings derived from the global section.
    pub fn settings(&self) -> Settings {
        Settings {
            grace: Duration::from_millis(self.grace_ms.unwrap_or(3000)),
            update_cmd: self
                .update_cmd
                .clone()
                .unwrap_or_else(|| DEFAULT_UPDATE_CMD.to_string()),
        }
    }

    /// Validates and normalizes the project entries.
    pub fn normalized_projects(&self) -> Result<Vec<Project>> {
        let mut seen = HashSet::new();
        let mut projects = Vec::with_capacity(self.projects.len());
        for entry in &self.projects {
            if entry.id.trim().is_empty() {
                bail!("project with empty id");
            }
            if !seen.insert(entry.id.clone()) {
                bail!("duplicate project id: {}", entry.id);
            }
            if !entry.dir.is_absolute() {
                bail!("project {}: dir must be an absolute path", entry.id);
            }
            if entry.commands.is_empty() {
                bail!("project {}: commands must not be empty", entry.id);
            }
            for command in &entry.commands {
                let parts = shell_words::split(command)
                    .with_context(|| format!("project {}: bad command '{}'", entry.id, command))?;
                if parts.is_empty() {
                    bail!("project {}: empty command", entry.id);
                }
            }
            if entry.port == 0 {
                bail!("project {}: port must be between 1 and 65535", entry.id);
            }
            projects.push(Project {
                id: entry.id.clone(),
                dir: entry.dir.clone(),
                commands: entry.commands.clone(),
                port: entry.port,
                port_var: entry
                    .port_var
                    .clone()
                    .unwrap_or_else(|| "PORT".to_string()),
                env: entry.env.clone().unwrap_or_default(),
                display_name: entry
                    .display_name
                    .clone()
                    .unwrap_or_else(|| entry.id.clone()),
                update_cmd: entry.update_cmd.clone(),
            });
        }
        Ok(projects)
    }
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}

/// Persists the configuration, creating the file if needed.
pub fn save_config(path: &Path, config: &Config) -> Result<()> {
    let serialized =
        toml::to_string_pretty(config).context("failed to serialize configuration")?;
    std::fs::write(path, serialized)
        .with_context(|| format!("failed to write config file {}", path.display()))?;
    Ok(())
}

//! Registry-level lifecycle tests: start/stop/update, state conflicts,
//! cleanup of failed starts.

#![cfg(unix)]

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::mpsc;

use nodeyard::output::log_channel;
use nodeyard::{LogRecord, Project, ProjectStatus, Registry, Settings, SupervisorError};

fn project(id: &str, dir: &Path, commands: &[&str], port: u16) -> Project {
    Project {
        id: id.to_string(),
        dir: dir.to_path_buf(),
        commands: commands.iter().map(|c| c.to_string()).collect(),
        port,
        port_var: "PORT".to_string(),
        env: HashMap::new(),
        display_name: id.to_string(),
        update_cmd: None,
    }
}

fn settings() -> Settings {
    Settings {
        grace: Duration::from_millis(500),
        ..Settings::default()
    }
}

async fn wait_for_status(registry: &Registry, id: &str, want: ProjectStatus) {
    for _ in 0..200 {
        if registry.status(id).unwrap() == want {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!(
        "project '{}' never reached {:?} (currently {:?})",
        id,
        want,
        registry.status(id).unwrap()
    );
}

async fn drain(mut rx: mpsc::Receiver<LogRecord>) -> Vec<LogRecord> {
    let mut records = Vec::new();
    while let Some(record) = rx.recv().await {
        records.push(record);
    }
    records
}

#[tokio::test]
async fn start_runs_every_command_and_stop_terminates() {
    let dir = TempDir::new().unwrap();
    let (mux, _rx) = log_channel(256);
    let registry = Registry::new(
        vec![project("app", dir.path(), &["sleep 30", "sleep 30"], 4000)],
        mux,
        settings(),
    );

    registry.start("app").await.unwrap();
    assert_eq!(registry.status("app").unwrap(), ProjectStatus::Running);
    assert_eq!(registry.live_handles("app").unwrap(), 2);

    registry.stop("app").await.unwrap();
    assert_eq!(registry.status("app").unwrap(), ProjectStatus::Stopped);
    assert_eq!(registry.live_handles("app").unwrap(), 0);
}

#[tokio::test]
async fn start_is_rejected_while_running() {
    let dir = TempDir::new().unwrap();
    let (mux, _rx) = log_channel(256);
    let registry = Registry::new(
        vec![project("app", dir.path(), &["sleep 30"], 4000)],
        mux,
        settings(),
    );

    registry.start("app").await.unwrap();
    let err = registry.start("app").await.unwrap_err();
    assert!(matches!(err, SupervisorError::AlreadyRunning(_)));
    // The rejected attempt must not have created handles.
    assert_eq!(registry.live_handles("app").unwrap(), 1);

    registry.stop("app").await.unwrap();
}

#[tokio::test]
async fn stop_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let (mux, _rx) = log_channel(256);
    let registry = Registry::new(
        vec![project("app", dir.path(), &["sleep 30"], 4000)],
        mux,
        settings(),
    );

    registry.stop("app").await.unwrap();
    registry.start("app").await.unwrap();
    registry.stop("app").await.unwrap();
    registry.stop("app").await.unwrap();
    assert_eq!(registry.status("app").unwrap(), ProjectStatus::Stopped);
}

#[tokio::test]
async fn natural_exit_reaps_back_to_stopped() {
    let dir = TempDir::new().unwrap();
    let (mux, _rx) = log_channel(256);
    let registry = Registry::new(
        vec![project("app", dir.path(), &["sh -c 'sleep 0.1'"], 4000)],
        mux,
        settings(),
    );

    registry.start("app").await.unwrap();
    wait_for_status(&registry, "app", ProjectStatus::Stopped).await;
    // A fresh start is accepted once the handles were reaped.
    registry.start("app").await.unwrap();
    registry.stop("app").await.unwrap();
}

#[tokio::test]
async fn failed_spawn_cleans_up_earlier_commands() {
    let dir = TempDir::new().unwrap();
    let (mux, _rx) = log_channel(256);
    let registry = Registry::new(
        vec![project(
            "app",
            dir.path(),
            &["sleep 30", "no-such-binary-0x5f3759df"],
            4000,
        )],
        mux,
        settings(),
    );

    let err = registry.start("app").await.unwrap_err();
    assert!(matches!(err, SupervisorError::Launch(_)));
    assert_eq!(registry.status("app").unwrap(), ProjectStatus::Stopped);
    assert_eq!(registry.live_handles("app").unwrap(), 0);
}

#[tokio::test]
async fn stop_racing_a_start_always_ends_stopped_or_running_never_leaks() {
    let dir = TempDir::new().unwrap();
    let (mux, _rx) = log_channel(256);
    let registry = std::sync::Arc::new(Registry::new(
        vec![project(
            "app",
            dir.path(),
            &["sleep 30", "sleep 30", "sleep 30"],
            4000,
        )],
        mux,
        settings(),
    ));

    let starter = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.start("app").await })
    };
    // Wait until the start attempt is observable (or already done) so the
    // stop below always races a live attempt, never an idle slot.
    while registry.status("app").unwrap() == ProjectStatus::Stopped && !starter.is_finished() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    registry.stop("app").await.unwrap();

    let start_result = starter.await.unwrap();
    match start_result {
        // The stop either interrupted the sequence or landed after the
        // start completed; both must leave zero live handles behind.
        Ok(()) | Err(SupervisorError::StartInterrupted(_)) => {}
        Err(err) => panic!("unexpected start error: {}", err),
    }
    assert_eq!(registry.status("app").unwrap(), ProjectStatus::Stopped);
    assert_eq!(registry.live_handles("app").unwrap(), 0);
}

#[tokio::test]
async fn port_reaches_the_child_environment() {
    let dir = TempDir::new().unwrap();
    let (mux, rx) = log_channel(256);
    let registry = Registry::new(
        vec![project("app", dir.path(), &["sh -c 'echo PORT=$PORT'"], 4000)],
        mux,
        settings(),
    );

    registry.start("app").await.unwrap();
    wait_for_status(&registry, "app", ProjectStatus::Stopped).await;
    drop(registry);

    let records = drain(rx).await;
    assert!(records.iter().any(|r| r.line == "PORT=4000"));
}

#[tokio::test]
async fn extra_env_overrides_the_port_default() {
    let dir = TempDir::new().unwrap();
    let (mux, rx) = log_channel(256);
    let mut p = project("app", dir.path(), &["sh -c 'echo PORT=$PORT'"], 3000);
    p.env.insert("PORT".to_string(), "9999".to_string());
    let registry = Registry::new(vec![p], mux, settings());

    registry.start("app").await.unwrap();
    wait_for_status(&registry, "app", ProjectStatus::Stopped).await;
    drop(registry);

    let records = drain(rx).await;
    assert!(records.iter().any(|r| r.line == "PORT=9999"));
}

#[tokio::test]
async fn update_is_rejected_unless_stopped_and_runs_nothing() {
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join("marker");
    let (mux, _rx) = log_channel(256);
    let mut p = project("app", dir.path(), &["sleep 30"], 4000);
    p.update_cmd = Some("touch marker".to_string());
    let registry = Registry::new(vec![p], mux, settings());

    registry.start("app").await.unwrap();
    let err = registry.update("app").await.unwrap_err();
    assert!(matches!(err, SupervisorError::Running(_)));
    assert!(!marker.exists(), "rejected update must not invoke the sync command");

    registry.stop("app").await.unwrap();
    registry.update("app").await.unwrap();
    assert!(marker.exists());
    assert_eq!(registry.status("app").unwrap(), ProjectStatus::Stopped);
}

#[tokio::test]
async fn failed_update_reports_exit_code_and_tail() {
    let dir = TempDir::new().unwrap();
    let (mux, _rx) = log_channel(256);
    let mut p = project("app", dir.path(), &["sleep 30"], 4000);
    p.update_cmd = Some("sh -c 'echo remote gone; exit 3'".to_string());
    let registry = Registry::new(vec![p], mux, settings());

    let err = registry.update("app").await.unwrap_err();
    match err {
        SupervisorError::UpdateFailed {
            project,
            code,
            tail,
        } => {
            assert_eq!(project, "app");
            assert_eq!(code, 3);
            assert!(tail.iter().any(|l| l.contains("remote gone")));
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(registry.status("app").unwrap(), ProjectStatus::Stopped);
}

#[tokio::test]
async fn start_is_rejected_during_update() {
    let dir = TempDir::new().unwrap();
    let (mux, _rx) = log_channel(256);
    let mut p = project("app", dir.path(), &["sleep 30"], 4000);
    p.update_cmd = Some("sleep 1".to_string());
    let registry = std::sync::Arc::new(Registry::new(vec![p], mux, settings()));

    let updater = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.update("app").await })
    };
    // Give the update a moment to take the slot.
    for _ in 0..100 {
        if registry.status("app").unwrap() == ProjectStatus::Updating {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(registry.status("app").unwrap(), ProjectStatus::Updating);

    let err = registry.start("app").await.unwrap_err();
    assert!(matches!(err, SupervisorError::UpdateInProgress(_)));
    let err = registry.update("app").await.unwrap_err();
    assert!(matches!(err, SupervisorError::UpdateInProgress(_)));

    updater.await.unwrap().unwrap();
    assert_eq!(registry.status("app").unwrap(), ProjectStatus::Stopped);
}

#[tokio::test]
async fn stop_all_leaves_every_project_stopped() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let (mux, _rx) = log_channel(256);
    let registry = Registry::new(
        vec![
            project("a", dir_a.path(), &["sleep 30"], 4000),
            project("b", dir_b.path(), &["sleep 30"], 4001),
        ],
        mux,
        settings(),
    );

    registry.start("a").await.unwrap();
    registry.start("b").await.unwrap();
    registry.stop_all().await;
    assert_eq!(registry.status("a").unwrap(), ProjectStatus::Stopped);
    assert_eq!(registry.status("b").unwrap(), ProjectStatus::Stopped);
}

#[tokio::test]
async fn log_records_carry_project_and_command_tags() {
    let dir = TempDir::new().unwrap();
    let (mux, rx) = log_channel(256);
    let registry = Registry::new(
        vec![project("app", dir.path(), &["sh -c 'echo hello'"], 4000)],
        mux,
        settings(),
    );

    registry.start("app").await.unwrap();
    wait_for_status(&registry, "app", ProjectStatus::Stopped).await;
    drop(registry);

    let records = drain(rx).await;
    let hello = records
        .iter()
        .find(|r| r.line == "hello")
        .expect("child output must reach the multiplexer");
    assert_eq!(hello.project, "app");
    assert_eq!(hello.tag, "sh -c 'echo hello'");
}

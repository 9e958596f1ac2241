//! Handle-level tests for the command runner.

#![cfg(unix)]

use std::collections::HashMap;
use std::time::Duration;

use tempfile::TempDir;

use nodeyard::errors::LaunchError;
use nodeyard::output::{log_channel, LogMux, StreamKind};
use nodeyard::runner::spawn_command;
use nodeyard::HandleState;

fn env() -> HashMap<String, String> {
    std::env::vars().collect()
}

fn mux() -> (LogMux, tokio::sync::mpsc::Receiver<nodeyard::LogRecord>) {
    log_channel(256)
}

#[tokio::test]
async fn wait_returns_exit_code() {
    let dir = TempDir::new().unwrap();
    let (mux, _rx) = mux();
    let handle = spawn_command("t", "sh -c 'exit 7'", dir.path(), &env(), &mux)
        .await
        .unwrap();
    assert!(handle.pid() > 0);
    assert_eq!(handle.command(), "sh -c 'exit 7'");
    assert_eq!(handle.wait().await, HandleState::Exited(Some(7)));
    assert_eq!(handle.state(), HandleState::Exited(Some(7)));
    assert!(handle.started_at().elapsed() < Duration::from_secs(60));
}

#[tokio::test]
async fn terminate_is_idempotent_on_exited_handle() {
    let dir = TempDir::new().unwrap();
    let (mux, _rx) = mux();
    let handle = spawn_command("t", "true", dir.path(), &env(), &mux)
        .await
        .unwrap();
    handle.wait().await;
    assert!(handle.terminate(Duration::from_millis(100)).await.is_ok());
    assert!(handle.terminate(Duration::from_millis(100)).await.is_ok());
}

#[tokio::test]
async fn terminate_honors_the_grace_period() {
    let dir = TempDir::new().unwrap();
    let (mux, _rx) = mux();
    let handle = spawn_command("t", "sleep 30", dir.path(), &env(), &mux)
        .await
        .unwrap();
    assert!(handle.state().is_running());
    handle.terminate(Duration::from_secs(2)).await.unwrap();
    // sleep dies to SIGTERM, which reports no exit code.
    assert_eq!(handle.wait().await, HandleState::Exited(None));
}

#[tokio::test]
async fn terminate_escalates_to_kill_when_term_is_ignored() {
    let dir = TempDir::new().unwrap();
    let (mux, _rx) = mux();
    let handle = spawn_command(
        "t",
        "sh -c 'trap \"\" TERM; sleep 30'",
        dir.path(),
        &env(),
        &mux,
    )
    .await
    .unwrap();
    handle.terminate(Duration::from_millis(200)).await.unwrap();
    assert_eq!(handle.wait().await, HandleState::Killed);
}

#[tokio::test]
async fn missing_workdir_is_a_launch_error() {
    let (mux, _rx) = mux();
    let err = spawn_command(
        "t",
        "true",
        std::path::Path::new("/definitely/not/a/dir"),
        &env(),
        &mux,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, LaunchError::MissingWorkdir(_)));
}

#[tokio::test]
async fn unresolvable_executable_is_a_launch_error() {
    let dir = TempDir::new().unwrap();
    let (mux, _rx) = mux();
    let err = spawn_command("t", "no-such-binary-0x5f3759df", dir.path(), &env(), &mux)
        .await
        .unwrap_err();
    assert!(matches!(err, LaunchError::Spawn { .. }));
}

#[tokio::test]
async fn output_lines_keep_per_stream_order() {
    let dir = TempDir::new().unwrap();
    let (mux, mut rx) = mux();
    let handle = spawn_command("t", "sh -c 'echo A; echo B'", dir.path(), &env(), &mux)
        .await
        .unwrap();
    handle.wait().await;
    drop(mux);
    drop(handle);

    let mut stdout_lines = Vec::new();
    while let Some(record) = rx.recv().await {
        if record.stream == StreamKind::Stdout {
            stdout_lines.push(record.line);
        }
    }
    assert_eq!(stdout_lines, vec!["A", "B"]);
}

#[tokio::test]
async fn child_environment_is_exactly_the_resolved_map() {
    let dir = TempDir::new().unwrap();
    let (mux, mut rx) = mux();
    let mut child_env = HashMap::new();
    child_env.insert("PATH".to_string(), std::env::var("PATH").unwrap());
    child_env.insert("ONLY_VAR".to_string(), "yes".to_string());
    let handle = spawn_command(
        "t",
        "sh -c 'echo marker=$ONLY_VAR,home=$HOME'",
        dir.path(),
        &child_env,
        &mux,
    )
    .await
    .unwrap();
    handle.wait().await;
    drop(mux);
    drop(handle);

    let mut seen = false;
    while let Some(record) = rx.recv().await {
        if record.stream == StreamKind::Stdout {
            // HOME is empty because the runner does not inherit implicitly.
            assert_eq!(record.line, "marker=yes,home=");
            seen = true;
        }
    }
    assert!(seen);
}

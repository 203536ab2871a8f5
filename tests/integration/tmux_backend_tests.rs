//! tmux backend tests.
//!
//! Live-session tests return early when `tmux` is not installed. Each test
//! uses its own session prefix so parallel runs cannot collide.

use std::time::Duration;

use agent_shepherd::backend::tmux::{key_sequence, tmux_available, Key};
use agent_shepherd::backend::{OutputEvent, SessionBackend, TmuxBackend};
use agent_shepherd::config::{SpawnConfig, TmuxConfig};
use agent_shepherd::models::session::{
    BackendKind, FailureReason, SessionOptions, SessionState,
};
use serial_test::serial;

fn backend_in(dir: &std::path::Path, prefix: &str) -> TmuxBackend {
    TmuxBackend::new(
        SpawnConfig {
            kill_grace_seconds: 3,
            ..SpawnConfig::default()
        },
        TmuxConfig {
            session_prefix: format!("{prefix}-{}-", std::process::id()),
            poll_interval_ms: 50,
        },
        dir.join("panes"),
    )
}

#[test]
fn targets_carry_the_configured_prefix() {
    let dir = tempfile::tempdir().expect("tempdir");
    let backend = backend_in(dir.path(), "shepherd-test");
    let target = backend.target_for("dev-1");
    assert!(target.starts_with("shepherd-test-"));
    assert!(target.ends_with("-dev-1"));
    assert_eq!(backend.kind(), BackendKind::Tmux);
}

#[test]
fn input_is_split_into_literals_and_enter_presses() {
    assert_eq!(
        key_sequence("status?\r"),
        vec![Key::Literal("status?".into()), Key::Enter]
    );
    assert_eq!(key_sequence("\r\r"), vec![Key::Enter, Key::Enter]);
    assert!(key_sequence("").is_empty());
}

#[tokio::test]
#[serial]
async fn pane_output_reaches_subscribers() {
    if !tmux_available().await {
        return;
    }
    let dir = tempfile::tempdir().expect("tempdir");
    let backend = backend_in(dir.path(), "shepherd-echo");

    let session = backend
        .create("echo-1", SessionOptions::new("cat", dir.path()))
        .await
        .expect("create");
    assert_eq!(session.state, SessionState::Running);
    assert_eq!(session.backend_kind, BackendKind::Tmux);
    assert!(backend.exists("echo-1").await.expect("exists"));

    let mut rx = backend.subscribe("echo-1").await.expect("subscribe");
    backend.write("echo-1", b"tmux-ping\r").await.expect("write");

    let mut seen = String::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !seen.contains("tmux-ping") {
        match tokio::time::timeout_at(deadline, rx.recv())
            .await
            .expect("output before deadline")
            .expect("output stream open")
        {
            OutputEvent::Data(bytes) => seen.push_str(&String::from_utf8_lossy(&bytes)),
            OutputEvent::Exited(exit) => panic!("session exited early: {exit:?}"),
        }
    }

    let exit = backend.kill("echo-1").await.expect("kill");
    assert_eq!(exit.reason, FailureReason::Killed);
    assert!(!backend.exists("echo-1").await.expect("exists"));
}

#[tokio::test]
#[serial]
async fn exited_pane_is_reported_as_a_crash() {
    if !tmux_available().await {
        return;
    }
    let dir = tempfile::tempdir().expect("tempdir");
    let backend = backend_in(dir.path(), "shepherd-crash");

    backend
        .create(
            "crash-1",
            SessionOptions::new("sh", dir.path()).with_args(["-c", "sleep 0.5; exit 4"]),
        )
        .await
        .expect("create");
    let mut rx = backend.subscribe("crash-1").await.expect("subscribe");

    let exit = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let OutputEvent::Exited(exit) = rx.recv().await.expect("event") {
                break exit;
            }
        }
    })
    .await
    .expect("exit observed");
    assert_eq!(exit.reason, FailureReason::Crashed);
    assert_eq!(exit.exit_code, Some(4));

    let session = backend.get("crash-1").await.expect("get").expect("known");
    assert_eq!(session.state, SessionState::Terminated);
}

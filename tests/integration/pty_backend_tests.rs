//! PTY backend tests against real processes.
//!
//! Spawns small shell utilities behind pseudo-terminals. Serialized so
//! process-heavy tests do not compete for the blocking pool.

use std::time::Duration;

use agent_shepherd::backend::{OutputEvent, PtyBackend, SessionBackend};
use agent_shepherd::config::SpawnConfig;
use agent_shepherd::models::session::{FailureReason, Session, SessionOptions, SessionState};
use agent_shepherd::AppError;
use serial_test::serial;
use tokio::sync::broadcast;

fn backend() -> PtyBackend {
    PtyBackend::new(SpawnConfig {
        kill_grace_seconds: 2,
        ..SpawnConfig::default()
    })
}

fn shell(script: &str) -> SessionOptions {
    SessionOptions::new("sh", std::env::temp_dir()).with_args(["-c", script])
}

/// Read output until `needle` shows up or the deadline passes.
async fn read_until(rx: &mut broadcast::Receiver<OutputEvent>, needle: &str) -> String {
    let mut seen = String::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !seen.contains(needle) {
        let event = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .expect("output before deadline")
            .expect("output stream open");
        match event {
            OutputEvent::Data(bytes) => seen.push_str(&String::from_utf8_lossy(&bytes)),
            OutputEvent::Exited(exit) => panic!("session exited early: {exit:?}"),
        }
    }
    seen
}

/// Poll until the session is terminated.
async fn wait_terminated(backend: &PtyBackend, name: &str) -> Session {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let session = backend.get(name).await.expect("get").expect("known session");
        if session.state == SessionState::Terminated {
            return session;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "session {name} never terminated"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
#[serial]
async fn written_lines_are_echoed_back() {
    let backend = backend();
    let session = backend
        .create("echo-1", SessionOptions::new("cat", std::env::temp_dir()))
        .await
        .expect("create");
    assert_eq!(session.state, SessionState::Running);
    assert!(session.pid.is_some());
    assert!(backend.exists("echo-1").await.expect("exists"));

    let mut rx = backend.subscribe("echo-1").await.expect("subscribe");
    backend.write("echo-1", b"ping-pong\r").await.expect("write");
    let seen = read_until(&mut rx, "ping-pong").await;
    assert!(seen.contains("ping-pong"));

    backend.resize("echo-1", 120, 40).await.expect("resize");
    let exit = backend.kill("echo-1").await.expect("kill");
    assert_eq!(exit.reason, FailureReason::Killed);
}

#[tokio::test]
#[serial]
async fn unexpected_exit_is_a_crash() {
    let backend = backend();
    backend
        .create("crash-1", shell("exit 3"))
        .await
        .expect("create");

    let session = wait_terminated(&backend, "crash-1").await;
    assert_eq!(session.failure, Some(FailureReason::Crashed));
    assert_eq!(session.exit_code, Some(3));
    assert!(!backend.exists("crash-1").await.expect("exists"));

    let err = backend.write("crash-1", b"hi\r").await.expect_err("write after exit");
    assert!(matches!(err, AppError::SessionUnavailable(_)));
}

#[tokio::test]
#[serial]
async fn kill_stops_a_running_process() {
    let backend = backend();
    backend
        .create("sleeper", SessionOptions::new("sleep", std::env::temp_dir()).with_args(["30"]))
        .await
        .expect("create");
    let mut rx = backend.subscribe("sleeper").await.expect("subscribe");

    let exit = backend.kill("sleeper").await.expect("kill");
    assert_eq!(exit.reason, FailureReason::Killed);

    let again = backend.kill("sleeper").await.expect("kill again");
    assert_eq!(again, exit);

    let last = loop {
        match rx.recv().await.expect("exit event") {
            OutputEvent::Exited(info) => break info,
            OutputEvent::Data(_) => {}
        }
    };
    assert_eq!(last.reason, FailureReason::Killed);
}

#[tokio::test]
#[serial]
async fn missing_program_never_starts() {
    let backend = backend();
    let session = backend
        .create(
            "ghost",
            SessionOptions::new("/nonexistent/agent-binary", std::env::temp_dir()),
        )
        .await
        .expect("spawn failure is not an error");

    assert_eq!(session.state, SessionState::Terminated);
    assert_eq!(session.failure, Some(FailureReason::NeverStarted));
    assert!(!backend.exists("ghost").await.expect("exists"));
}

#[tokio::test]
#[serial]
async fn live_names_are_exclusive_but_terminated_names_are_reusable() {
    let backend = backend();
    let opts = SessionOptions::new("sleep", std::env::temp_dir()).with_args(["30"]);
    backend.create("dup", opts.clone()).await.expect("create");

    let err = backend.create("dup", opts.clone()).await.expect_err("duplicate");
    assert!(matches!(err, AppError::AlreadyExists(_)));

    backend.kill("dup").await.expect("kill");
    let session = backend.create("dup", opts).await.expect("reuse name");
    assert_eq!(session.state, SessionState::Running);
    backend.kill("dup").await.expect("kill reused");
}

#[tokio::test]
#[serial]
async fn unknown_sessions_are_not_found() {
    let backend = backend();
    let err = backend.write("nobody", b"hi\r").await.expect_err("unknown");
    assert!(matches!(err, AppError::NotFound(_)));

    let err = backend.kill("nobody").await.expect_err("unknown");
    assert!(matches!(err, AppError::NotFound(_)));

    assert!(backend.get("nobody").await.expect("get").is_none());
    assert!(!backend.exists("nobody").await.expect("exists"));
}

#[tokio::test]
#[serial]
async fn subscribing_after_exit_yields_only_the_exit() {
    let backend = backend();
    backend
        .create("short", shell("echo bye; exit 0"))
        .await
        .expect("create");
    wait_terminated(&backend, "short").await;

    let mut rx = backend.subscribe("short").await.expect("subscribe");
    match rx.recv().await.expect("event") {
        OutputEvent::Exited(exit) => assert_eq!(exit.exit_code, Some(0)),
        OutputEvent::Data(bytes) => panic!("unexpected output after exit: {bytes:?}"),
    }
}

#[tokio::test]
#[serial]
async fn invalid_names_are_rejected() {
    let backend = backend();
    let err = backend
        .create("bad name", SessionOptions::new("cat", std::env::temp_dir()))
        .await
        .expect_err("invalid name");
    assert!(matches!(err, AppError::Backend(_)));
    assert!(backend.list().await.expect("list").is_empty());
}

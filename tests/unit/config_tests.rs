use std::path::PathBuf;
use std::time::Duration;

use agent_shepherd::config::GlobalConfig;
use agent_shepherd::models::session::BackendKind;
use agent_shepherd::orchestrator::patterns::ErrorKind;
use agent_shepherd::AppError;

fn sample_toml() -> &'static str {
    r#"
state_dir = "/var/lib/shepherd"
backend = "tmux"
ipc_name = "shepherd-test"

[spawn]
startup_timeout_seconds = 3
cols = 120
rows = 40

[tmux]
session_prefix = "ci-"

[scheduler]
tick_seconds = 5

[detection]
idle_threshold_seconds = 90
nudge_cooldown_seconds = 600
max_nudges = 2
output_window_chars = 2000
idle_nudge_message = "keep going"

[detection.error_messages]
test = "tests are red, fix them"

[validation]
max_retries = 4
max_output_bytes = 1024

[[agents]]
name = "dev-1"
role = "dev"
project = "web"
command = "claude"
args = ["--dangerously-skip-permissions"]
cwd = "/srv/web"

[agents.env]
TERM = "xterm-256color"

[[agents]]
name = "qa-1"
role = "qa"
project = "web"
command = "codex"
"#
}

#[test]
fn full_config_parses() {
    let config = GlobalConfig::from_toml_str(sample_toml()).expect("config should parse");

    assert_eq!(config.state_dir, PathBuf::from("/var/lib/shepherd"));
    assert_eq!(config.backend, BackendKind::Tmux);
    assert_eq!(config.ipc_name, "shepherd-test");
    assert_eq!(config.spawn.startup_timeout(), Duration::from_secs(3));
    assert_eq!(config.spawn.cols, 120);
    assert_eq!(config.tmux.session_prefix, "ci-");
    assert_eq!(config.scheduler.tick_seconds, 5);
    assert_eq!(config.detection.idle_threshold(), Duration::from_secs(90));
    assert_eq!(config.detection.nudge_cooldown(), Duration::from_secs(600));
    assert_eq!(config.detection.max_nudges, 2);
    assert_eq!(config.validation.max_retries, 4);
    assert_eq!(config.agents.len(), 2);
    assert_eq!(config.agents[0].env.get("TERM").map(String::as_str), Some("xterm-256color"));
    assert_eq!(config.agents[1].cwd, None);
}

#[test]
fn minimal_config_uses_defaults() {
    let config = GlobalConfig::from_toml_str("state_dir = \"/tmp/shepherd\"").expect("minimal config");

    assert_eq!(config.backend, BackendKind::Pty);
    assert_eq!(config.ipc_name, "agent-shepherd");
    assert_eq!(config.spawn.startup_timeout_seconds, 10);
    assert_eq!(config.spawn.kill_grace_seconds, 5);
    assert_eq!(config.tmux.session_prefix, "shepherd-");
    assert_eq!(config.scheduler.tick_seconds, 30);
    assert_eq!(config.detection.idle_threshold_seconds, 60);
    assert_eq!(config.detection.nudge_cooldown_seconds, 300);
    assert_eq!(config.detection.output_window_chars, 4000);
    assert_eq!(config.validation.max_retries, 2);
    assert_eq!(config.validation.max_output_bytes, 262_144);
    assert!(config.agents.is_empty());
}

#[test]
fn derived_paths_live_under_state_dir() {
    let config = GlobalConfig::from_toml_str("state_dir = \"/tmp/shepherd\"").expect("config");
    assert_eq!(config.documents_dir(), PathBuf::from("/tmp/shepherd/documents"));
    assert_eq!(config.journal_dir(), PathBuf::from("/tmp/shepherd/journal"));
    assert_eq!(config.pane_log_dir(), PathBuf::from("/tmp/shepherd/panes"));
    assert_eq!(config.ipc_token_path(), PathBuf::from("/tmp/shepherd/ipc.token"));
}

#[test]
fn error_messages_fall_back_to_builtins() {
    let config = GlobalConfig::from_toml_str(sample_toml()).expect("config");
    assert_eq!(config.detection.error_message(ErrorKind::Test), "tests are red, fix them");
    assert_eq!(
        config.detection.error_message(ErrorKind::Compile),
        ErrorKind::Compile.default_nudge()
    );
}

#[test]
fn missing_state_dir_is_rejected() {
    let err = GlobalConfig::from_toml_str("backend = \"pty\"").expect_err("state_dir is required");
    assert!(matches!(err, AppError::Config(_)), "got {err:?}");
}

#[test]
fn zero_values_are_rejected() {
    for body in [
        "[scheduler]\ntick_seconds = 0",
        "[detection]\nidle_threshold_seconds = 0",
        "[detection]\noutput_window_chars = 0",
    ] {
        let raw = format!("state_dir = \"/tmp/s\"\n{body}\n");
        let err = GlobalConfig::from_toml_str(&raw).expect_err("zero value must fail");
        assert!(matches!(err, AppError::Config(_)), "{body}: got {err:?}");
    }
}

#[test]
fn duplicate_agent_names_are_rejected() {
    let raw = r#"
state_dir = "/tmp/s"

[[agents]]
name = "dev-1"
role = "dev"
project = "p"
command = "a"

[[agents]]
name = "dev-1"
role = "qa"
project = "p"
command = "b"
"#;
    let err = GlobalConfig::from_toml_str(raw).expect_err("duplicate names");
    assert!(err.to_string().contains("duplicate agent name"), "got {err}");
}

#[test]
fn empty_agent_command_is_rejected() {
    let raw = r#"
state_dir = "/tmp/s"

[[agents]]
name = "dev-1"
role = "dev"
project = "p"
command = "  "
"#;
    let err = GlobalConfig::from_toml_str(raw).expect_err("empty command");
    assert!(err.to_string().contains("empty command"), "got {err}");
}

#[test]
fn agent_names_must_be_usable_as_session_names() {
    let raw = r#"
state_dir = "/tmp/s"

[[agents]]
name = "dev 1"
role = "dev"
project = "p"
command = "claude"
"#;
    let err = GlobalConfig::from_toml_str(raw).expect_err("space in name");
    assert!(err.to_string().contains("invalid agent name"), "got {err}");
}

#[test]
fn unknown_backend_is_rejected() {
    let err = GlobalConfig::from_toml_str("state_dir = \"/tmp/s\"\nbackend = \"screen\"")
        .expect_err("unknown backend");
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn load_from_path_reads_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "state_dir = \"/tmp/from-file\"\n").expect("write config");

    let config = GlobalConfig::load_from_path(&path).expect("load");
    assert_eq!(config.state_dir, PathBuf::from("/tmp/from-file"));

    let err = GlobalConfig::load_from_path(dir.path().join("missing.toml")).expect_err("missing file");
    assert!(matches!(err, AppError::Config(_)));
}

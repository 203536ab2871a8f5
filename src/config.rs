//! Global configuration parsing and validation.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::models::session::BackendKind;
use crate::orchestrator::patterns::ErrorKind;
use crate::{AppError, Result};

/// Process spawn and terminal I/O settings shared by both backends.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SpawnConfig {
    /// Bounded wait for a session to start before it counts as a spawn failure.
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_seconds: u64,
    /// Initial terminal width.
    #[serde(default = "default_cols")]
    pub cols: u16,
    /// Initial terminal height.
    #[serde(default = "default_rows")]
    pub rows: u16,
    /// How long `kill` waits for the exit to be observed.
    #[serde(default = "default_kill_grace")]
    pub kill_grace_seconds: u64,
    /// How long a write may wait in a session's writer queue.
    #[serde(default = "default_write_timeout")]
    pub write_timeout_seconds: u64,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            startup_timeout_seconds: default_startup_timeout(),
            cols: default_cols(),
            rows: default_rows(),
            kill_grace_seconds: default_kill_grace(),
            write_timeout_seconds: default_write_timeout(),
        }
    }
}

impl SpawnConfig {
    /// Startup wait as a [`Duration`].
    #[must_use]
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_seconds)
    }

    /// Kill grace period as a [`Duration`].
    #[must_use]
    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_seconds)
    }

    /// Writer queue timeout as a [`Duration`].
    #[must_use]
    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_seconds)
    }
}

fn default_startup_timeout() -> u64 {
    10
}

fn default_cols() -> u16 {
    200
}

fn default_rows() -> u16 {
    50
}

fn default_kill_grace() -> u64 {
    5
}

fn default_write_timeout() -> u64 {
    10
}

/// Settings for the tmux-backed session implementation.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TmuxConfig {
    /// Prefix applied to every tmux session name.
    #[serde(default = "default_session_prefix")]
    pub session_prefix: String,
    /// How often the pane log and pane state are polled.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for TmuxConfig {
    fn default() -> Self {
        Self {
            session_prefix: default_session_prefix(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_session_prefix() -> String {
    "shepherd-".into()
}

fn default_poll_interval_ms() -> u64 {
    250
}

/// Control-loop cadence.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SchedulerConfig {
    /// Period of the scheduling tick.
    #[serde(default = "default_tick_seconds")]
    pub tick_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_seconds: default_tick_seconds(),
        }
    }
}

fn default_tick_seconds() -> u64 {
    30
}

/// Idle detection and nudge policy.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct DetectionConfig {
    /// Output silence after which a session counts as idle.
    #[serde(default = "default_idle_threshold")]
    pub idle_threshold_seconds: u64,
    /// Minimum spacing between two nudges to the same session.
    #[serde(default = "default_nudge_cooldown")]
    pub nudge_cooldown_seconds: u64,
    /// Nudges without genuine progress before the session is escalated.
    #[serde(default = "default_max_nudges")]
    pub max_nudges: u32,
    /// Size of the classified output tail, in characters.
    #[serde(default = "default_output_window_chars")]
    pub output_window_chars: usize,
    /// Message written to an idle agent that holds a task.
    #[serde(default = "default_idle_nudge_message")]
    pub idle_nudge_message: String,
    /// Per-error-kind nudge messages; missing kinds fall back to built-ins.
    #[serde(default)]
    pub error_messages: BTreeMap<ErrorKind, String>,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            idle_threshold_seconds: default_idle_threshold(),
            nudge_cooldown_seconds: default_nudge_cooldown(),
            max_nudges: default_max_nudges(),
            output_window_chars: default_output_window_chars(),
            idle_nudge_message: default_idle_nudge_message(),
            error_messages: BTreeMap::new(),
        }
    }
}

impl DetectionConfig {
    /// Idle threshold as a [`Duration`].
    #[must_use]
    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.idle_threshold_seconds)
    }

    /// Nudge cool-down as a [`Duration`].
    #[must_use]
    pub fn nudge_cooldown(&self) -> Duration {
        Duration::from_secs(self.nudge_cooldown_seconds)
    }

    /// Nudge text for an error sub-kind.
    #[must_use]
    pub fn error_message(&self, kind: ErrorKind) -> String {
        self.error_messages
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| kind.default_nudge().to_owned())
    }
}

fn default_idle_threshold() -> u64 {
    60
}

fn default_nudge_cooldown() -> u64 {
    300
}

fn default_max_nudges() -> u32 {
    3
}

fn default_output_window_chars() -> usize {
    4000
}

fn default_idle_nudge_message() -> String {
    "Continue working on the current task. Pick up where you left off.".into()
}

/// Output validation bounds.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ValidationConfig {
    /// Failed validations allowed before a task is blocked.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Upper bound on a serialized deliverable.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

fn default_max_retries() -> u32 {
    2
}

fn default_max_output_bytes() -> usize {
    256 * 1024
}

/// An agent launched and supervised at daemon start.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AgentConfig {
    /// Unique session name.
    pub name: String,
    /// Role used for task matching (e.g. `dev`, `qa`).
    pub role: String,
    /// Project whose queue this agent pulls from.
    pub project: String,
    /// Agent binary.
    pub command: String,
    /// Arguments passed to the agent binary.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory; defaults to the daemon's working directory.
    pub cwd: Option<PathBuf>,
    /// Extra environment for the agent process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_ipc_name() -> String {
    "agent-shepherd".into()
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Directory holding persisted documents, journals, and pane logs.
    pub state_dir: PathBuf,
    /// Which terminal backend runs the sessions.
    #[serde(default)]
    pub backend: BackendKind,
    /// Named pipe / Unix socket identifier.
    #[serde(default = "default_ipc_name")]
    pub ipc_name: String,
    /// Spawn and terminal I/O settings.
    #[serde(default)]
    pub spawn: SpawnConfig,
    /// Tmux backend settings.
    #[serde(default)]
    pub tmux: TmuxConfig,
    /// Scheduling tick settings.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Idle detection and nudge policy.
    #[serde(default)]
    pub detection: DetectionConfig,
    /// Output validation settings.
    #[serde(default)]
    pub validation: ValidationConfig,
    /// Agents to launch at start.
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Directory for persisted JSON documents.
    #[must_use]
    pub fn documents_dir(&self) -> PathBuf {
        self.state_dir.join("documents")
    }

    /// Directory for the JSONL decision journal.
    #[must_use]
    pub fn journal_dir(&self) -> PathBuf {
        self.state_dir.join("journal")
    }

    /// Directory for tmux pane capture logs.
    #[must_use]
    pub fn pane_log_dir(&self) -> PathBuf {
        self.state_dir.join("panes")
    }

    /// File holding the per-run IPC auth token.
    #[must_use]
    pub fn ipc_token_path(&self) -> PathBuf {
        self.state_dir.join("ipc.token")
    }

    fn validate(&self) -> Result<()> {
        if self.scheduler.tick_seconds == 0 {
            return Err(AppError::Config(
                "scheduler.tick_seconds must be greater than zero".into(),
            ));
        }

        if self.detection.idle_threshold_seconds == 0 {
            return Err(AppError::Config(
                "detection.idle_threshold_seconds must be greater than zero".into(),
            ));
        }

        if self.detection.output_window_chars == 0 {
            return Err(AppError::Config(
                "detection.output_window_chars must be greater than zero".into(),
            ));
        }

        if self.spawn.cols == 0 || self.spawn.rows == 0 {
            return Err(AppError::Config(
                "spawn.cols and spawn.rows must be greater than zero".into(),
            ));
        }

        let mut seen = HashSet::new();
        for agent in &self.agents {
            crate::backend::validate_session_name(&agent.name)
                .map_err(|_| AppError::Config(format!("invalid agent name: {:?}", agent.name)))?;
            if agent.command.trim().is_empty() {
                return Err(AppError::Config(format!(
                    "agent {} has an empty command",
                    agent.name
                )));
            }
            if !seen.insert(agent.name.as_str()) {
                return Err(AppError::Config(format!(
                    "duplicate agent name: {}",
                    agent.name
                )));
            }
        }

        Ok(())
    }
}

//! Session model and lifecycle helpers.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which terminal mechanism backs a session.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Process spawned directly behind a pseudo-terminal.
    #[default]
    Pty,
    /// Named session inside an external tmux server.
    Tmux,
}

/// Lifecycle state owned by the backend.
///
/// Idle/busy is not a backend state; it is an annotation computed by the
/// activity tracker for `Running` sessions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Spawn in progress.
    Starting,
    /// Process is alive and accepting input.
    Running,
    /// Process is gone; the session cannot be written to or resumed.
    Terminated,
}

/// Why a session reached `Terminated`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The process exited without being asked to.
    Crashed,
    /// The process was stopped through `kill`.
    Killed,
    /// The process never came up (spawn error or startup timeout).
    NeverStarted,
}

/// Exit information recorded when a session terminates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExitInfo {
    /// Process exit code, when the platform reports one.
    pub exit_code: Option<i32>,
    /// Classified termination reason.
    pub reason: FailureReason,
}

/// Parameters for launching a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionOptions {
    /// Program to run.
    pub command: String,
    /// Program arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory.
    pub cwd: PathBuf,
    /// Extra environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Terminal width.
    pub cols: u16,
    /// Terminal height.
    pub rows: u16,
}

impl SessionOptions {
    /// Options for `command` in `cwd` with an 80x24 terminal.
    #[must_use]
    pub fn new(command: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: BTreeMap::new(),
            cols: 80,
            rows: 24,
        }
    }

    /// Append arguments.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Override the terminal size.
    #[must_use]
    pub fn with_size(mut self, cols: u16, rows: u16) -> Self {
        self.cols = cols;
        self.rows = rows;
        self
    }

    /// The command line as a single display string.
    #[must_use]
    pub fn command_line(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// A supervised terminal-bound process running one agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    /// Process-wide unique name.
    pub name: String,
    /// Backend that owns the process.
    pub backend_kind: BackendKind,
    /// Current lifecycle state.
    pub state: SessionState,
    /// Working directory of the process.
    pub cwd: PathBuf,
    /// Command line used to start the process.
    pub spawn_command: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Operating-system process id, once known.
    pub pid: Option<u32>,
    /// Termination reason; set exactly when `state` is `Terminated`.
    pub failure: Option<FailureReason>,
    /// Exit code reported by the platform.
    pub exit_code: Option<i32>,
    /// Time the termination was observed.
    pub terminated_at: Option<DateTime<Utc>>,
    /// The process was already running when this daemon attached to it.
    #[serde(default)]
    pub reattached: bool,
}

impl Session {
    /// Construct a session in `Starting` state.
    #[must_use]
    pub fn starting(name: &str, backend_kind: BackendKind, opts: &SessionOptions) -> Self {
        Self {
            name: name.to_owned(),
            backend_kind,
            state: SessionState::Starting,
            cwd: opts.cwd.clone(),
            spawn_command: opts.command_line(),
            created_at: Utc::now(),
            pid: None,
            failure: None,
            exit_code: None,
            terminated_at: None,
            reattached: false,
        }
    }

    /// Whether the session still counts against name uniqueness.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.state != SessionState::Terminated
    }

    /// Exit information, if the session has terminated.
    #[must_use]
    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.failure.map(|reason| ExitInfo {
            exit_code: self.exit_code,
            reason,
        })
    }

    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        matches!(
            (self.state, next),
            (SessionState::Starting, SessionState::Running | SessionState::Terminated)
                | (SessionState::Running, SessionState::Terminated)
        )
    }

    /// Mark the session running with its process id.
    pub fn mark_running(&mut self, pid: Option<u32>) {
        if self.can_transition_to(SessionState::Running) {
            self.state = SessionState::Running;
            self.pid = pid;
        }
    }

    /// Record termination. A second call keeps the first recorded exit.
    pub fn mark_terminated(&mut self, exit: ExitInfo) {
        if self.can_transition_to(SessionState::Terminated) {
            self.state = SessionState::Terminated;
            self.failure = Some(exit.reason);
            self.exit_code = exit.exit_code;
            self.terminated_at = Some(Utc::now());
        }
    }
}

//! Terminal session backends.
//!
//! Callers depend only on [`SessionBackend`]. The PTY and tmux
//! implementations are selected by configuration and share one registry so
//! naming, lifecycle and write serialization behave the same in both.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::broadcast;

use crate::config::GlobalConfig;
use crate::models::session::{BackendKind, ExitInfo, Session, SessionOptions};
use crate::{AppError, Result};

pub mod ansi;
pub mod pty;
mod registry;
pub mod tmux;

pub use pty::PtyBackend;
pub use tmux::TmuxBackend;

/// Boxed future returned by [`SessionBackend`] methods.
pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Shared handle to the configured backend.
pub type SharedBackend = Arc<dyn SessionBackend>;

/// One event on a session's output stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    /// Raw bytes read from the terminal.
    Data(Bytes),
    /// The process terminated. Always the last event.
    Exited(ExitInfo),
}

/// Creates and controls terminal-bound processes.
///
/// Spawn failures never surface as errors: `create` returns a session in
/// `Terminated` state carrying `FailureReason::NeverStarted`.
pub trait SessionBackend: Send + Sync {
    /// Which mechanism backs the sessions.
    fn kind(&self) -> BackendKind;

    /// Start a session named `name`.
    ///
    /// Fails with `AppError::AlreadyExists` only when a live session holds
    /// the name; a terminated name may be reused.
    fn create<'a>(&'a self, name: &'a str, opts: SessionOptions) -> BackendFuture<'a, Session>;

    /// Write bytes to the session's terminal. Resolves once flushed.
    ///
    /// Fails with `AppError::SessionUnavailable` for starting or terminated
    /// sessions and `AppError::NotFound` for unknown names.
    fn write<'a>(&'a self, name: &'a str, bytes: &'a [u8]) -> BackendFuture<'a, ()>;

    /// Subscribe to the output stream.
    ///
    /// Subscribing to a terminated session yields a stream holding only its
    /// `Exited` event.
    fn subscribe<'a>(&'a self, name: &'a str)
        -> BackendFuture<'a, broadcast::Receiver<OutputEvent>>;

    /// Resize the terminal.
    fn resize<'a>(&'a self, name: &'a str, cols: u16, rows: u16) -> BackendFuture<'a, ()>;

    /// Stop the session and return its exit information.
    ///
    /// Idempotent on terminated sessions.
    fn kill<'a>(&'a self, name: &'a str) -> BackendFuture<'a, ExitInfo>;

    /// Whether a live session holds `name`.
    fn exists<'a>(&'a self, name: &'a str) -> BackendFuture<'a, bool>;

    /// Snapshot of one session.
    fn get<'a>(&'a self, name: &'a str) -> BackendFuture<'a, Option<Session>>;

    /// Snapshots of every known session, sorted by name.
    fn list(&self) -> BackendFuture<'_, Vec<Session>>;
}

/// Reject names that cannot be used as tmux targets or document keys.
///
/// # Errors
///
/// Returns `AppError::Backend` if the name is empty or contains characters
/// other than ASCII letters, digits, `-` and `_`.
pub fn validate_session_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'));
    if valid {
        Ok(())
    } else {
        Err(AppError::Backend(format!("invalid session name: {name:?}")))
    }
}

/// Build the backend selected by `config.backend`.
///
/// # Errors
///
/// Returns `AppError::Config` if the tmux backend is selected and `tmux`
/// is not installed.
pub async fn from_config(config: &GlobalConfig) -> Result<SharedBackend> {
    match config.backend {
        BackendKind::Pty => Ok(Arc::new(PtyBackend::new(config.spawn.clone()))),
        BackendKind::Tmux => {
            if !tmux::tmux_available().await {
                return Err(AppError::Config(
                    "backend = \"tmux\" but tmux is not installed".into(),
                ));
            }
            Ok(Arc::new(TmuxBackend::new(
                config.spawn.clone(),
                config.tmux.clone(),
                config.pane_log_dir(),
            )))
        }
    }
}

/// Write `text` followed by a carriage return, submitting it as one line.
///
/// # Errors
///
/// Propagates the backend's write error.
pub async fn send_line(backend: &dyn SessionBackend, name: &str, text: &str) -> Result<()> {
    let line = format!("{text}\r");
    backend.write(name, line.as_bytes()).await
}

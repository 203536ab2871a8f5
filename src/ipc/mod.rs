//! Local IPC layer for `agent-shepherd-ctl`.
//!
//! Provides a named pipe (Windows) or Unix domain socket (Linux/macOS)
//! server that accepts JSON-line commands from the companion CLI.

pub mod server;

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use crate::backend::SharedBackend;
use crate::orchestrator::auto_assign::AutoAssignService;
use crate::orchestrator::scheduler::Scheduler;
use crate::orchestrator::supervisor::Supervisor;
use crate::{AppError, Result};

/// Everything the IPC commands operate on.
pub struct IpcState {
    /// Socket name to listen on.
    pub ipc_name: String,
    /// Session backend.
    pub backend: SharedBackend,
    /// Task queue.
    pub assign: Arc<AutoAssignService>,
    /// Scheduled checks and messages.
    pub scheduler: Arc<Scheduler>,
    /// Supervisor of configured agents.
    pub supervisor: Arc<Supervisor>,
    /// Shared secret every request must carry, when set.
    pub auth_token: Option<String>,
}

/// Generate a fresh auth token and write it to `path`.
///
/// On Unix the file is readable by the owner only.
///
/// # Errors
///
/// Returns `AppError::Io` if the file cannot be written.
pub fn write_auth_token(path: &Path) -> Result<String> {
    let token = uuid::Uuid::new_v4().to_string();
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .map_err(|err| AppError::Io(format!("failed to create {}: {err}", path.display())))?;
    file.write_all(token.as_bytes())
        .map_err(|err| AppError::Io(format!("failed to write {}: {err}", path.display())))?;
    Ok(token)
}

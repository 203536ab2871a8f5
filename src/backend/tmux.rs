//! Sessions hosted inside an external tmux server.
//!
//! Each session maps to a tmux session named `<prefix><name>`, so operators
//! can `tmux attach -t <prefix><name>` while the daemon keeps driving it.
//! Output is captured with `pipe-pane` into a per-session log that is tailed
//! asynchronously; input is sent with `send-keys`.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::process::Command;
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::{SpawnConfig, TmuxConfig};
use crate::models::session::{BackendKind, ExitInfo, FailureReason, Session, SessionOptions};
use crate::{AppError, Result};

use super::registry::{Registry, SessionSlot, WriteRequest};
use super::{validate_session_name, BackendFuture, OutputEvent, SessionBackend};

/// Read buffer for the pane log.
const READ_CHUNK: usize = 8192;

/// Pane logs are emptied once the tail has consumed this much.
const LOG_ROTATE_BYTES: u64 = 4 * 1024 * 1024;

pub(crate) struct TmuxHandle {
    target: String,
}

/// Whether the `tmux` binary can be executed.
pub async fn tmux_available() -> bool {
    Command::new("tmux")
        .arg("-V")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .is_ok_and(|status| status.success())
}

/// Run one tmux command and return its trimmed stdout.
async fn tmux<I, S>(args: I) -> Result<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<std::ffi::OsStr>,
{
    let output = Command::new("tmux")
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|err| AppError::Backend(format!("failed to run tmux: {err}")))?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
    } else {
        Err(AppError::Backend(format!(
            "tmux exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

/// Exact-match session target.
fn session_target(target: &str) -> String {
    format!("={target}")
}

/// Active pane of an exact-match session.
fn pane_target(target: &str) -> String {
    format!("={target}:")
}

/// Single-quote `value` for `sh`.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Shell line that exports the environment and execs the agent.
fn shell_command(opts: &SessionOptions) -> String {
    let mut line = String::new();
    for (key, value) in &opts.env {
        line.push_str(&format!("export {key}={}; ", shell_quote(value)));
    }
    line.push_str("exec ");
    line.push_str(&shell_quote(&opts.command));
    for arg in &opts.args {
        line.push(' ');
        line.push_str(&shell_quote(arg));
    }
    line
}

/// One unit of input for `send-keys`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Key {
    /// Text sent with `send-keys -l`.
    Literal(String),
    /// The Enter key.
    Enter,
}

/// Split input into literal runs and Enter presses.
///
/// `\n`, `\r` and `\r\n` each become one Enter.
#[must_use]
pub fn key_sequence(text: &str) -> Vec<Key> {
    let mut keys = Vec::new();
    let mut literal = String::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\r' | '\n' => {
                if c == '\r' && chars.peek() == Some(&'\n') {
                    chars.next();
                }
                if !literal.is_empty() {
                    keys.push(Key::Literal(std::mem::take(&mut literal)));
                }
                keys.push(Key::Enter);
            }
            other => literal.push(other),
        }
    }
    if !literal.is_empty() {
        keys.push(Key::Literal(literal));
    }
    keys
}

async fn send_keys(target: &str, bytes: &[u8]) -> Result<()> {
    let pane = pane_target(target);
    for key in key_sequence(&String::from_utf8_lossy(bytes)) {
        match key {
            Key::Literal(text) => tmux(["send-keys", "-t", pane.as_str(), "-l", text.as_str()]).await?,
            Key::Enter => tmux(["send-keys", "-t", pane.as_str(), "Enter"]).await?,
        };
    }
    Ok(())
}

async fn write_loop(target: String, mut writes: mpsc::Receiver<WriteRequest>) {
    while let Some(request) = writes.recv().await {
        let result = send_keys(&target, &request.bytes).await;
        let _ = request.ack.send(result);
    }
}

enum PaneStatus {
    Alive,
    Dead(Option<i32>),
    Gone,
}

async fn pane_status(target: &str) -> PaneStatus {
    let pane = pane_target(target);
    match tmux([
        "display-message",
        "-p",
        "-t",
        pane.as_str(),
        "#{pane_dead} #{pane_dead_status}",
    ])
    .await
    {
        Ok(line) => {
            let mut fields = line.split_whitespace();
            match fields.next() {
                Some("1") => PaneStatus::Dead(fields.next().and_then(|code| code.parse().ok())),
                _ => PaneStatus::Alive,
            }
        }
        Err(_) => PaneStatus::Gone,
    }
}

async fn drain(file: &mut File, slot: &SessionSlot<TmuxHandle>, buf: &mut [u8]) {
    loop {
        match file.read(buf).await {
            Ok(0) => break,
            Ok(n) => slot.publish(Bytes::copy_from_slice(&buf[..n])),
            Err(err) => {
                debug!(%err, "pane log read failed");
                break;
            }
        }
    }
}

/// Empty the pane log once the reader has consumed `limit` bytes.
///
/// `pipe-pane` appends, so after truncation new output lands at offset zero
/// where the rewound reader picks it up. Output written between the last
/// drain and the truncation is dropped.
async fn rotate_if_full(file: &mut File, log_path: &Path, limit: u64) -> std::io::Result<bool> {
    if file.stream_position().await? < limit {
        return Ok(false);
    }
    OpenOptions::new().write(true).open(log_path).await?.set_len(0).await?;
    file.seek(SeekFrom::Start(0)).await?;
    Ok(true)
}

/// Tail the pane log and watch for the pane to die.
async fn monitor(slot: Arc<SessionSlot<TmuxHandle>>, target: String, log_path: PathBuf, poll: Duration) {
    let mut log = match File::open(&log_path).await {
        Ok(file) => Some(file),
        Err(err) => {
            warn!(path = %log_path.display(), %err, "cannot open pane log; output will not be captured");
            None
        }
    };
    let mut buf = vec![0_u8; READ_CHUNK];
    let mut ticker = tokio::time::interval(poll);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let exit_code = loop {
        ticker.tick().await;
        if let Some(file) = log.as_mut() {
            drain(file, &slot, &mut buf).await;
            match rotate_if_full(file, &log_path, LOG_ROTATE_BYTES).await {
                Ok(true) => debug!(path = %log_path.display(), "pane log rotated"),
                Ok(false) => {}
                Err(err) => warn!(path = %log_path.display(), %err, "pane log rotation failed"),
            }
        }
        match pane_status(&target).await {
            PaneStatus::Alive => {}
            PaneStatus::Dead(code) => {
                // remain-on-exit keeps the dead pane around; clean it up.
                let _ = tmux(["kill-session", "-t", session_target(&target).as_str()]).await;
                break code;
            }
            PaneStatus::Gone => break None,
        }
    };

    if let Some(file) = log.as_mut() {
        drain(file, &slot, &mut buf).await;
    }
    let exit = slot.finish(ExitInfo {
        exit_code,
        reason: slot.exit_reason(),
    });
    info!(
        session = %slot.name(),
        reason = ?exit.reason,
        exit_code = ?exit.exit_code,
        "session terminated"
    );
}

struct PaneStart {
    pid: Option<u32>,
    reattached: bool,
}

/// Route pane output into a fresh log and return the pane's pid.
async fn capture_pane(target: &str, created: bool, log_path: &Path) -> Result<Option<u32>> {
    if created {
        tmux([
            "set-option",
            "-t",
            session_target(target).as_str(),
            "remain-on-exit",
            "on",
        ])
        .await?;
    }

    tokio::fs::write(log_path, b"").await?;
    let pipe = format!("cat >> {}", shell_quote(&log_path.to_string_lossy()));
    tmux(["pipe-pane", "-t", pane_target(target).as_str(), pipe.as_str()]).await?;

    let pid = tmux([
        "display-message",
        "-p",
        "-t",
        pane_target(target).as_str(),
        "#{pane_pid}",
    ])
    .await?;
    Ok(pid.parse().ok())
}

/// [`SessionBackend`] over tmux sessions.
pub struct TmuxBackend {
    spawn: SpawnConfig,
    tmux: TmuxConfig,
    log_dir: PathBuf,
    registry: Registry<TmuxHandle>,
}

impl TmuxBackend {
    /// Create a backend writing pane captures under `log_dir`.
    #[must_use]
    pub fn new(spawn: SpawnConfig, tmux: TmuxConfig, log_dir: PathBuf) -> Self {
        Self {
            spawn,
            tmux,
            log_dir,
            registry: Registry::default(),
        }
    }

    /// tmux session name for a session.
    #[must_use]
    pub fn target_for(&self, name: &str) -> String {
        format!("{}{name}", self.tmux.session_prefix)
    }

    /// Attach to or create the tmux session and start output capture.
    ///
    /// A session created here is killed again if capture cannot be set up.
    async fn start_pane(&self, target: &str, opts: &SessionOptions, log_path: &Path) -> Result<PaneStart> {
        tokio::fs::create_dir_all(&self.log_dir).await?;

        let reattached = tmux(["has-session", "-t", session_target(target).as_str()])
            .await
            .is_ok();
        if reattached {
            info!(tmux_session = target, "attaching to existing tmux session");
        } else {
            let cols = opts.cols.to_string();
            let rows = opts.rows.to_string();
            let cwd = opts.cwd.to_string_lossy().into_owned();
            let line = shell_command(opts);
            tmux([
                "new-session",
                "-d",
                "-s",
                target,
                "-x",
                cols.as_str(),
                "-y",
                rows.as_str(),
                "-c",
                cwd.as_str(),
                line.as_str(),
            ])
            .await?;
        }

        match capture_pane(target, !reattached, log_path).await {
            Ok(pid) => Ok(PaneStart { pid, reattached }),
            Err(err) => {
                if !reattached {
                    let _ = tmux(["kill-session", "-t", session_target(target).as_str()]).await;
                }
                Err(err)
            }
        }
    }

    async fn create_session(&self, name: &str, opts: SessionOptions) -> Result<Session> {
        validate_session_name(name)?;
        let session = Session::starting(name, BackendKind::Tmux, &opts);
        let (slot, writes) = self.registry.reserve(session).await?;
        let target = self.target_for(name);
        let log_path = self.log_dir.join(format!("{name}.log"));

        let started =
            tokio::time::timeout(self.spawn.startup_timeout(), self.start_pane(&target, &opts, &log_path)).await;
        let pane = match started {
            Ok(Ok(pane)) => pane,
            Ok(Err(err)) => {
                warn!(%err, "session failed to start");
                return Ok(slot.never_started());
            }
            Err(_) => {
                warn!(
                    timeout_seconds = self.spawn.startup_timeout_seconds,
                    "session startup timed out"
                );
                let _ = tmux(["kill-session", "-t", session_target(&target).as_str()]).await;
                return Ok(slot.never_started());
            }
        };

        slot.attach(TmuxHandle {
            target: target.clone(),
        });
        slot.mark_running(pane.pid);
        if pane.reattached {
            slot.mark_reattached();
        }
        tokio::spawn(write_loop(target.clone(), writes));
        tokio::spawn(monitor(
            Arc::clone(&slot),
            target.clone(),
            log_path,
            Duration::from_millis(self.tmux.poll_interval_ms.max(10)),
        ));

        if slot.kill_requested() {
            let _ = tmux(["kill-session", "-t", session_target(&target).as_str()]).await;
        }

        let session = slot.snapshot();
        info!(tmux_session = %target, pid = ?session.pid, "session running");
        Ok(session)
    }

    async fn kill_session(&self, name: &str) -> Result<ExitInfo> {
        let slot = self.registry.slot(name).await?;
        if let Some(info) = slot.exit_info() {
            return Ok(info);
        }

        slot.request_kill();
        if let Some(handle) = slot.handle() {
            if let Err(err) = tmux(["kill-session", "-t", session_target(&handle.target).as_str()]).await {
                debug!(%err, "kill-session failed");
            }
        }

        if let Some(info) = slot.wait_exit(self.spawn.kill_grace()).await {
            return Ok(info);
        }
        Ok(slot.finish(ExitInfo {
            exit_code: None,
            reason: FailureReason::Killed,
        }))
    }
}

impl SessionBackend for TmuxBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Tmux
    }

    fn create<'a>(&'a self, name: &'a str, opts: SessionOptions) -> BackendFuture<'a, Session> {
        let span = info_span!("session_create", session = name, backend = "tmux");
        Box::pin(self.create_session(name, opts).instrument(span))
    }

    fn write<'a>(&'a self, name: &'a str, bytes: &'a [u8]) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let slot = self.registry.slot(name).await?;
            slot.write(Bytes::copy_from_slice(bytes), self.spawn.write_timeout())
                .await
        })
    }

    fn subscribe<'a>(
        &'a self,
        name: &'a str,
    ) -> BackendFuture<'a, broadcast::Receiver<OutputEvent>> {
        Box::pin(async move { Ok(self.registry.slot(name).await?.subscribe()) })
    }

    fn resize<'a>(&'a self, name: &'a str, cols: u16, rows: u16) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let slot = self.registry.slot(name).await?;
            let handle = slot
                .handle()
                .filter(|_| slot.is_live())
                .ok_or_else(|| AppError::SessionUnavailable(format!("session {name} is not running")))?;
            let cols = cols.to_string();
            let rows = rows.to_string();
            tmux([
                "resize-window",
                "-t",
                session_target(&handle.target).as_str(),
                "-x",
                cols.as_str(),
                "-y",
                rows.as_str(),
            ])
            .await
            .map(|_| ())
        })
    }

    fn kill<'a>(&'a self, name: &'a str) -> BackendFuture<'a, ExitInfo> {
        let span = info_span!("session_kill", session = name, backend = "tmux");
        Box::pin(self.kill_session(name).instrument(span))
    }

    fn exists<'a>(&'a self, name: &'a str) -> BackendFuture<'a, bool> {
        Box::pin(async move { Ok(self.registry.exists(name).await) })
    }

    fn get<'a>(&'a self, name: &'a str) -> BackendFuture<'a, Option<Session>> {
        Box::pin(async move { Ok(self.registry.get(name).await) })
    }

    fn list(&self) -> BackendFuture<'_, Vec<Session>> {
        Box::pin(async move { Ok(self.registry.list().await) })
    }
}

//! Sessions spawned directly behind a pseudo-terminal.
//!
//! Each session gets three OS threads: a reader that publishes raw output,
//! a writer that drains the session's write queue, and a waiter that reaps
//! the child and records the exit.

use std::io::{Read, Write};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::SpawnConfig;
use crate::models::session::{BackendKind, ExitInfo, FailureReason, Session, SessionOptions};
use crate::{AppError, Result};

use super::registry::{Registry, SessionSlot, WriteRequest};
use super::{validate_session_name, BackendFuture, OutputEvent, SessionBackend};

/// Read buffer per session.
const READ_CHUNK: usize = 8192;

/// How long the waiter lets the reader drain after the child exits.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Wait after a forced kill before the exit is recorded without the child.
const FORCE_KILL_WAIT: Duration = Duration::from_secs(1);

pub(crate) struct PtyHandle {
    master: Mutex<Box<dyn MasterPty + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
}

impl PtyHandle {
    fn force_kill(&self) {
        let mut killer = self.killer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(err) = killer.kill() {
            debug!(%err, "force kill failed");
        }
    }
}

struct Spawned {
    master: Box<dyn MasterPty + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    child: Box<dyn Child + Send + Sync>,
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
    pid: Option<u32>,
}

fn spawn_pty(opts: &SessionOptions) -> Result<Spawned> {
    let pair = native_pty_system()
        .openpty(PtySize {
            rows: opts.rows,
            cols: opts.cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|err| AppError::Backend(format!("failed to open pty: {err}")))?;

    let mut cmd = CommandBuilder::new(&opts.command);
    cmd.args(&opts.args);
    cmd.cwd(&opts.cwd);
    for (key, value) in &opts.env {
        cmd.env(key, value);
    }

    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|err| AppError::Backend(format!("failed to spawn {}: {err}", opts.command)))?;
    // The child holds its own copy; keeping ours would hide EOF on exit.
    drop(pair.slave);

    let killer = child.clone_killer();
    let pid = child.process_id();
    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|err| AppError::Backend(format!("failed to clone pty reader: {err}")))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|err| AppError::Backend(format!("failed to take pty writer: {err}")))?;

    Ok(Spawned {
        master: pair.master,
        killer,
        child,
        reader,
        writer,
        pid,
    })
}

#[cfg(unix)]
fn terminate(pid: u32) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    i32::try_from(pid).is_ok_and(|raw| kill(Pid::from_raw(raw), Signal::SIGTERM).is_ok())
}

#[cfg(not(unix))]
fn terminate(_pid: u32) -> bool {
    false
}

/// Start the reader, writer and waiter threads for a spawned child.
fn start_io(
    name: &str,
    slot: &Arc<SessionSlot<PtyHandle>>,
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
    child: Box<dyn Child + Send + Sync>,
    writes: mpsc::Receiver<WriteRequest>,
) -> std::io::Result<()> {
    let (drained_tx, drained_rx) = std_mpsc::channel::<()>();

    let read_slot = Arc::clone(slot);
    std::thread::Builder::new()
        .name(format!("pty-read-{name}"))
        .spawn(move || {
            read_loop(reader, &read_slot);
            let _ = drained_tx.send(());
        })?;

    std::thread::Builder::new()
        .name(format!("pty-write-{name}"))
        .spawn(move || write_loop(writer, writes))?;

    let wait_slot = Arc::clone(slot);
    std::thread::Builder::new()
        .name(format!("pty-wait-{name}"))
        .spawn(move || {
            let mut child = child;
            let exit_code = match child.wait() {
                Ok(status) => i32::try_from(status.exit_code()).ok(),
                Err(err) => {
                    debug!(%err, "wait on pty child failed");
                    None
                }
            };
            let _ = drained_rx.recv_timeout(DRAIN_GRACE);
            let exit = wait_slot.finish(ExitInfo {
                exit_code,
                reason: wait_slot.exit_reason(),
            });
            info!(
                session = %wait_slot.name(),
                reason = ?exit.reason,
                exit_code = ?exit.exit_code,
                "session terminated"
            );
        })?;

    Ok(())
}

fn read_loop(mut reader: Box<dyn Read + Send>, slot: &SessionSlot<PtyHandle>) {
    let mut buf = vec![0_u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => slot.publish(Bytes::copy_from_slice(&buf[..n])),
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
            Err(err) => {
                // Linux reports EIO once the slave side is fully closed.
                debug!(%err, "pty read ended");
                break;
            }
        }
    }
}

fn write_loop(mut writer: Box<dyn Write + Send>, mut writes: mpsc::Receiver<WriteRequest>) {
    while let Some(request) = writes.blocking_recv() {
        let result = writer
            .write_all(&request.bytes)
            .and_then(|()| writer.flush())
            .map_err(|err| AppError::Backend(format!("pty write failed: {err}")));
        let _ = request.ack.send(result);
    }
}

/// [`SessionBackend`] over native pseudo-terminals.
pub struct PtyBackend {
    spawn: SpawnConfig,
    registry: Registry<PtyHandle>,
}

impl PtyBackend {
    /// Create a backend with the given spawn settings.
    #[must_use]
    pub fn new(spawn: SpawnConfig) -> Self {
        Self {
            spawn,
            registry: Registry::default(),
        }
    }

    async fn create_session(&self, name: &str, opts: SessionOptions) -> Result<Session> {
        validate_session_name(name)?;
        let session = Session::starting(name, BackendKind::Pty, &opts);
        let (slot, writes) = self.registry.reserve(session).await?;

        let mut spawn = tokio::task::spawn_blocking(move || spawn_pty(&opts));
        let spawned = match tokio::time::timeout(self.spawn.startup_timeout(), &mut spawn).await {
            Ok(Ok(Ok(spawned))) => spawned,
            Ok(Ok(Err(err))) => {
                warn!(%err, "session failed to start");
                return Ok(slot.never_started());
            }
            Ok(Err(err)) => {
                warn!(%err, "spawn task failed");
                return Ok(slot.never_started());
            }
            Err(_) => {
                warn!(
                    timeout_seconds = self.spawn.startup_timeout_seconds,
                    "session startup timed out"
                );
                tokio::spawn(async move {
                    if let Ok(Ok(mut late)) = spawn.await {
                        let _ = late.killer.kill();
                    }
                });
                return Ok(slot.never_started());
            }
        };

        let Spawned {
            master,
            mut killer,
            child,
            reader,
            writer,
            pid,
        } = spawned;

        if let Err(err) = start_io(name, &slot, reader, writer, child, writes) {
            warn!(%err, "failed to start pty io threads");
            let _ = killer.kill();
            return Ok(slot.never_started());
        }

        slot.attach(PtyHandle {
            master: Mutex::new(master),
            killer: Mutex::new(killer),
        });
        slot.mark_running(pid);

        if slot.kill_requested() {
            if let Some(handle) = slot.handle() {
                handle.force_kill();
            }
        }

        let session = slot.snapshot();
        info!(pid = ?session.pid, command = %session.spawn_command, "session running");
        Ok(session)
    }

    async fn kill_session(&self, name: &str) -> Result<ExitInfo> {
        let slot = self.registry.slot(name).await?;
        if let Some(info) = slot.exit_info() {
            return Ok(info);
        }

        slot.request_kill();
        let signalled = slot.snapshot().pid.is_some_and(terminate);
        if !signalled {
            if let Some(handle) = slot.handle() {
                handle.force_kill();
            }
        }

        if let Some(info) = slot.wait_exit(self.spawn.kill_grace()).await {
            return Ok(info);
        }

        warn!("session ignored termination; forcing kill");
        if let Some(handle) = slot.handle() {
            handle.force_kill();
        }
        if let Some(info) = slot.wait_exit(FORCE_KILL_WAIT).await {
            return Ok(info);
        }

        Ok(slot.finish(ExitInfo {
            exit_code: None,
            reason: FailureReason::Killed,
        }))
    }
}

impl SessionBackend for PtyBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Pty
    }

    fn create<'a>(&'a self, name: &'a str, opts: SessionOptions) -> BackendFuture<'a, Session> {
        let span = info_span!("session_create", session = name, backend = "pty");
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
            let result = handle
                .master
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .resize(PtySize {
                    rows,
                    cols,
                    pixel_width: 0,
                    pixel_height: 0,
                })
                .map_err(|err| AppError::Backend(format!("resize failed: {err}")));
            result
        })
    }

    fn kill<'a>(&'a self, name: &'a str) -> BackendFuture<'a, ExitInfo> {
        let span = info_span!("session_kill", session = name, backend = "pty");
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

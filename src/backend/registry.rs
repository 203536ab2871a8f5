//! Session bookkeeping shared by the backend implementations.
//!
//! A slot owns the lifecycle record, the output broadcast, the single writer
//! queue and the exit latch of one session. Backends attach their own
//! process handle once the spawn succeeds.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, oneshot, watch, RwLock};

use crate::models::session::{ExitInfo, FailureReason, Session, SessionState};
use crate::{AppError, Result};

use super::OutputEvent;

/// Buffered output events per session before slow subscribers lag.
const EVENT_CAPACITY: usize = 1024;

/// Pending writes per session.
const WRITE_QUEUE: usize = 64;

/// Terminated slots kept for inspection; older ones are dropped on reserve.
const RETAINED_TERMINATED: usize = 32;

/// A queued write, acknowledged after the bytes are flushed.
pub(crate) struct WriteRequest {
    pub bytes: Bytes,
    pub ack: oneshot::Sender<Result<()>>,
}

pub(crate) struct SessionSlot<H> {
    record: Mutex<Session>,
    events: broadcast::Sender<OutputEvent>,
    writer: Mutex<Option<mpsc::Sender<WriteRequest>>>,
    kill_requested: AtomicBool,
    exit: watch::Sender<Option<ExitInfo>>,
    handle: OnceLock<H>,
}

impl<H> SessionSlot<H> {
    fn new(session: Session) -> (Self, mpsc::Receiver<WriteRequest>) {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (writer, writes) = mpsc::channel(WRITE_QUEUE);
        let (exit, _) = watch::channel(None);
        let slot = Self {
            record: Mutex::new(session),
            events,
            writer: Mutex::new(Some(writer)),
            kill_requested: AtomicBool::new(false),
            exit,
            handle: OnceLock::new(),
        };
        (slot, writes)
    }

    fn record(&self) -> MutexGuard<'_, Session> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> Session {
        self.record().clone()
    }

    pub fn name(&self) -> String {
        self.record().name.clone()
    }

    pub fn is_live(&self) -> bool {
        self.record().is_live()
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.record().exit_info()
    }

    /// Attach the backend handle. Only the first call has effect.
    pub fn attach(&self, handle: H) {
        let _ = self.handle.set(handle);
    }

    pub fn handle(&self) -> Option<&H> {
        self.handle.get()
    }

    pub fn mark_running(&self, pid: Option<u32>) {
        self.record().mark_running(pid);
    }

    pub fn mark_reattached(&self) {
        self.record().reattached = true;
    }

    /// Fan raw output out to subscribers. Having none is not an error.
    pub fn publish(&self, bytes: Bytes) {
        let _ = self.events.send(OutputEvent::Data(bytes));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OutputEvent> {
        let record = self.record();
        match record.exit_info() {
            Some(info) => {
                let (tx, rx) = broadcast::channel(1);
                let _ = tx.send(OutputEvent::Exited(info));
                rx
            }
            None => self.events.subscribe(),
        }
    }

    pub fn request_kill(&self) {
        self.kill_requested.store(true, Ordering::SeqCst);
    }

    pub fn kill_requested(&self) -> bool {
        self.kill_requested.load(Ordering::SeqCst)
    }

    /// Reason for an exit observed now: `Killed` if a kill was requested.
    pub fn exit_reason(&self) -> FailureReason {
        if self.kill_requested() {
            FailureReason::Killed
        } else {
            FailureReason::Crashed
        }
    }

    /// Record termination, close the writer queue and notify subscribers.
    ///
    /// Returns the recorded exit; a second call keeps the first one.
    pub fn finish(&self, exit: ExitInfo) -> ExitInfo {
        let mut record = self.record();
        if let Some(existing) = record.exit_info() {
            return existing;
        }
        record.mark_terminated(exit);
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let _ = self.events.send(OutputEvent::Exited(exit));
        self.exit.send_replace(Some(exit));
        exit
    }

    /// Record a spawn failure and return the terminated snapshot.
    pub fn never_started(&self) -> Session {
        self.finish(ExitInfo {
            exit_code: None,
            reason: FailureReason::NeverStarted,
        });
        self.snapshot()
    }

    /// Queue a write and wait for it to be flushed.
    pub async fn write(&self, bytes: Bytes, timeout: Duration) -> Result<()> {
        let sender = {
            let record = self.record();
            if record.state != SessionState::Running {
                return Err(AppError::SessionUnavailable(format!(
                    "session {} is not running",
                    record.name
                )));
            }
            self.writer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
                .ok_or_else(|| {
                    AppError::SessionUnavailable(format!("session {} is not running", record.name))
                })?
        };

        let (ack, done) = oneshot::channel();
        let request = WriteRequest { bytes, ack };
        tokio::time::timeout(timeout, async {
            sender
                .send(request)
                .await
                .map_err(|_| AppError::SessionUnavailable("writer closed".into()))?;
            done.await
                .map_err(|_| AppError::SessionUnavailable("writer closed".into()))?
        })
        .await
        .map_err(|_| AppError::Backend(format!("write timed out after {timeout:?}")))?
    }

    /// Wait up to `grace` for the exit to be recorded.
    pub async fn wait_exit(&self, grace: Duration) -> Option<ExitInfo> {
        let mut rx = self.exit.subscribe();
        let waited = tokio::time::timeout(grace, rx.wait_for(Option::is_some)).await;
        match waited {
            Ok(Ok(info)) => *info,
            _ => self.exit_info(),
        }
    }
}

/// Name-keyed map of session slots.
pub(crate) struct Registry<H> {
    slots: RwLock<HashMap<String, Arc<SessionSlot<H>>>>,
    retained: usize,
}

impl<H> Default for Registry<H> {
    fn default() -> Self {
        Self::with_retention(RETAINED_TERMINATED)
    }
}

impl<H> Registry<H> {
    fn with_retention(retained: usize) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            retained,
        }
    }

    /// Reserve `session.name` for a new `Starting` session.
    ///
    /// A terminated slot with the same name is replaced, and terminated
    /// slots beyond the retention limit are dropped oldest first.
    pub async fn reserve(
        &self,
        session: Session,
    ) -> Result<(Arc<SessionSlot<H>>, mpsc::Receiver<WriteRequest>)> {
        let mut slots = self.slots.write().await;
        if let Some(existing) = slots.get(&session.name) {
            if existing.is_live() {
                return Err(AppError::AlreadyExists(format!(
                    "session {} is already live",
                    session.name
                )));
            }
        }
        let name = session.name.clone();
        let (slot, writes) = SessionSlot::new(session);
        let slot = Arc::new(slot);
        slots.insert(name, Arc::clone(&slot));
        prune_terminated(&mut slots, self.retained);
        Ok((slot, writes))
    }

    pub async fn slot(&self, name: &str) -> Result<Arc<SessionSlot<H>>> {
        self.slots
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("session {name} not found")))
    }

    pub async fn get(&self, name: &str) -> Option<Session> {
        self.slots.read().await.get(name).map(|slot| slot.snapshot())
    }

    pub async fn exists(&self, name: &str) -> bool {
        self.slots
            .read()
            .await
            .get(name)
            .is_some_and(|slot| slot.is_live())
    }

    pub async fn list(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .slots
            .read()
            .await
            .values()
            .map(|slot| slot.snapshot())
            .collect();
        sessions.sort_by(|a, b| a.name.cmp(&b.name));
        sessions
    }
}

fn prune_terminated<H>(slots: &mut HashMap<String, Arc<SessionSlot<H>>>, keep: usize) {
    let mut terminated: Vec<(Option<DateTime<Utc>>, String)> = slots
        .iter()
        .filter_map(|(name, slot)| {
            let record = slot.record();
            (!record.is_live()).then(|| (record.terminated_at, name.clone()))
        })
        .collect();
    if terminated.len() <= keep {
        return;
    }
    terminated.sort();
    let excess = terminated.len() - keep;
    for (_, name) in terminated.into_iter().take(excess) {
        slots.remove(&name);
    }
}

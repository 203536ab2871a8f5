//! Time-driven delivery of recurring checks and one-shot messages.
//!
//! Entries live in memory behind one async mutex and are persisted as whole
//! documents. A tick holds the mutex for one entry at a time, from the
//! presence check through the write and the follow-up save, so a concurrent
//! `cancel` either lands before the write or after the entry has fired.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::backend::{send_line, validate_session_name, SharedBackend};
use crate::models::schedule::{render_template, ScheduledCheck, ScheduledMessage};
use crate::persistence::schedule_repo::ScheduleRepo;
use crate::persistence::SharedStore;
use crate::{AppError, Result};

use super::supervisor::Supervisor;

/// A scheduled entry of either kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleEntry {
    /// Recurring check-in.
    Check(ScheduledCheck),
    /// One-shot message.
    Message(ScheduledMessage),
}

impl ScheduleEntry {
    /// Entry id.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Check(check) => &check.id,
            Self::Message(message) => &message.id,
        }
    }

    /// Session the entry writes to.
    #[must_use]
    pub fn target_session(&self) -> &str {
        match self {
            Self::Check(check) => &check.target_session,
            Self::Message(message) => &message.target_session,
        }
    }

    /// Next due time.
    #[must_use]
    pub fn next_run_at(&self) -> DateTime<Utc> {
        match self {
            Self::Check(check) => check.next_run_at,
            Self::Message(message) => message.next_run_at,
        }
    }

    /// Whether the entry is enabled and due at `now`.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self {
            Self::Check(check) => check.is_due(now),
            Self::Message(message) => message.is_due(now),
        }
    }

    fn template(&self) -> &str {
        match self {
            Self::Check(check) => &check.message_template,
            Self::Message(message) => &message.message_template,
        }
    }

    fn disable(&mut self) {
        match self {
            Self::Check(check) => check.enabled = false,
            Self::Message(message) => message.enabled = false,
        }
    }
}

/// What one tick did, by entry id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Entries written to their session.
    pub fired: Vec<String>,
    /// Entries disabled because their session is gone.
    pub failed: Vec<String>,
    /// Entries left due for the next tick.
    pub deferred: Vec<String>,
}

impl TickReport {
    /// Whether the tick touched nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fired.is_empty() && self.failed.is_empty() && self.deferred.is_empty()
    }
}

enum Dispatch {
    Fired,
    Failed,
    Deferred,
}

/// Owns scheduled entries and delivers them when due.
pub struct Scheduler {
    backend: SharedBackend,
    repo: ScheduleRepo,
    entries: Mutex<HashMap<String, ScheduleEntry>>,
}

impl Scheduler {
    /// Create an empty scheduler.
    #[must_use]
    pub fn new(store: SharedStore, backend: SharedBackend) -> Self {
        Self {
            backend,
            repo: ScheduleRepo::new(store),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the in-memory entries with the persisted ones.
    ///
    /// Overdue entries fire once on the next tick.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if a collection cannot be read.
    pub async fn load(&self) -> Result<usize> {
        let checks = self.repo.load_checks().await?;
        let messages = self.repo.load_messages().await?;

        let mut entries = self.entries.lock().await;
        entries.clear();
        for check in checks {
            entries.insert(check.id.clone(), ScheduleEntry::Check(check));
        }
        for message in messages {
            entries.insert(message.id.clone(), ScheduleEntry::Message(message));
        }
        info!(entries = entries.len(), "schedule loaded");
        Ok(entries.len())
    }

    /// Add a recurring check that first fires one interval from now.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidInput` for a zero or out-of-range interval
    /// or an invalid target name, or `AppError::Store` if the entry cannot be saved.
    pub async fn add_check(
        &self,
        target_session: &str,
        interval_seconds: u64,
        template: &str,
    ) -> Result<ScheduledCheck> {
        check_target(target_session)?;
        let check = ScheduledCheck::new(
            target_session.to_owned(),
            interval_seconds,
            template.to_owned(),
            Utc::now(),
        )?;

        let mut entries = self.entries.lock().await;
        self.repo.save_check(&check).await?;
        entries.insert(check.id.clone(), ScheduleEntry::Check(check.clone()));
        info!(entry_id = %check.id, session = target_session, interval_seconds, "check scheduled");
        Ok(check)
    }

    /// Add a one-shot message due at `run_at`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidInput` for an invalid target name, or
    /// `AppError::Store` if the entry cannot be saved.
    pub async fn add_message(
        &self,
        target_session: &str,
        run_at: DateTime<Utc>,
        text: &str,
    ) -> Result<ScheduledMessage> {
        check_target(target_session)?;
        let message = ScheduledMessage::new(
            target_session.to_owned(),
            run_at,
            text.to_owned(),
            Utc::now(),
        );

        let mut entries = self.entries.lock().await;
        self.repo.save_message(&message).await?;
        entries.insert(message.id.clone(), ScheduleEntry::Message(message.clone()));
        info!(entry_id = %message.id, session = target_session, %run_at, "message scheduled");
        Ok(message)
    }

    /// Remove an entry. Returns `false` for unknown ids.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the entry cannot be deleted; it then
    /// stays scheduled.
    pub async fn cancel(&self, id: &str) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get(id) else {
            return Ok(false);
        };
        match entry {
            ScheduleEntry::Check(_) => self.repo.delete_check(id).await?,
            ScheduleEntry::Message(_) => self.repo.delete_message(id).await?,
        };
        entries.remove(id);
        info!(entry_id = id, "schedule entry cancelled");
        Ok(true)
    }

    /// Every entry, soonest first.
    pub async fn list(&self) -> Vec<ScheduleEntry> {
        let mut list: Vec<ScheduleEntry> = self.entries.lock().await.values().cloned().collect();
        list.sort_by(|a, b| {
            a.next_run_at()
                .cmp(&b.next_run_at())
                .then_with(|| a.id().cmp(b.id()))
        });
        list
    }

    /// Deliver every entry due at `now`.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> TickReport {
        let span = info_span!("scheduler_tick", %now);
        async {
            let due: Vec<String> = self
                .list()
                .await
                .into_iter()
                .filter(|entry| entry.is_due(now))
                .map(|entry| entry.id().to_owned())
                .collect();

            let mut report = TickReport::default();
            for id in due {
                match self.dispatch(&id, now).await {
                    Some(Dispatch::Fired) => report.fired.push(id),
                    Some(Dispatch::Failed) => report.failed.push(id),
                    Some(Dispatch::Deferred) => report.deferred.push(id),
                    None => debug!(entry_id = %id, "entry cancelled before dispatch"),
                }
            }
            report
        }
        .instrument(span)
        .await
    }

    async fn dispatch(&self, id: &str, now: DateTime<Utc>) -> Option<Dispatch> {
        let mut entries = self.entries.lock().await;
        let entry = entries.get(id).filter(|entry| entry.is_due(now))?.clone();
        let session = entry.target_session().to_owned();
        let text = render_template(entry.template(), &session, now);

        match send_line(self.backend.as_ref(), &session, &text).await {
            Ok(()) => {}
            Err(AppError::NotFound(_) | AppError::SessionUnavailable(_)) => {
                let mut disabled = entry;
                disabled.disable();
                if let Err(err) = self.persist(&disabled).await {
                    warn!(entry_id = id, %err, "failed to persist disabled entry");
                }
                entries.insert(id.to_owned(), disabled);
                warn!(entry_id = id, session = %session, "target session gone; entry disabled");
                return Some(Dispatch::Failed);
            }
            Err(err) => {
                warn!(entry_id = id, session = %session, %err, "delivery failed; will retry");
                return Some(Dispatch::Deferred);
            }
        }

        match entry {
            ScheduleEntry::Check(mut check) => {
                check.advance(now);
                if let Err(err) = self.repo.save_check(&check).await {
                    error!(entry_id = id, %err, "failed to persist fired check; it stays due");
                    return Some(Dispatch::Deferred);
                }
                info!(entry_id = id, session = %session, next_run_at = %check.next_run_at, "check fired");
                entries.insert(id.to_owned(), ScheduleEntry::Check(check));
            }
            ScheduleEntry::Message(_) => {
                if let Err(err) = self.repo.delete_message(id).await {
                    error!(entry_id = id, %err, "failed to remove fired message; it stays due");
                    return Some(Dispatch::Deferred);
                }
                info!(entry_id = id, session = %session, "message fired");
                entries.remove(id);
            }
        }
        Some(Dispatch::Fired)
    }

    async fn persist(&self, entry: &ScheduleEntry) -> Result<()> {
        match entry {
            ScheduleEntry::Check(check) => self.repo.save_check(check).await,
            ScheduleEntry::Message(message) => self.repo.save_message(message).await,
        }
    }
}

fn check_target(name: &str) -> Result<()> {
    validate_session_name(name).map_err(|_| AppError::InvalidInput(format!("invalid target session: {name:?}")))
}

/// Spawn the control loop: a scheduler tick followed by a supervisor sweep.
///
/// The first tick runs immediately so overdue entries catch up once at
/// startup. Ticks missed while a slow iteration runs are skipped.
#[must_use]
pub fn spawn_tick_loop(
    scheduler: Arc<Scheduler>,
    supervisor: Arc<Supervisor>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("control loop shutting down");
                    break;
                }
                _ = ticker.tick() => {}
            }

            let report = scheduler.tick_at(Utc::now()).await;
            if !report.is_empty() {
                info!(
                    fired = report.fired.len(),
                    failed = report.failed.len(),
                    deferred = report.deferred.len(),
                    "scheduler tick"
                );
            }
            supervisor.sweep().await;
        }
    })
}

//! Recurring check-ins and one-shot scheduled messages.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{AppError, Result};

/// Longest accepted check interval or reminder delay: ten years.
pub const MAX_SCHEDULE_SECONDS: u64 = 10 * 365 * 24 * 60 * 60;

/// `now` moved forward by `seconds`, or `None` past [`MAX_SCHEDULE_SECONDS`].
#[must_use]
pub fn offset_from(now: DateTime<Utc>, seconds: u64) -> Option<DateTime<Utc>> {
    if seconds > MAX_SCHEDULE_SECONDS {
        return None;
    }
    let delta = TimeDelta::try_seconds(i64::try_from(seconds).ok()?)?;
    now.checked_add_signed(delta)
}

/// A message written to a session at a fixed interval.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduledCheck {
    /// Unique identifier.
    pub id: String,
    /// Session the message is written to.
    pub target_session: String,
    /// Interval between fires, in seconds.
    pub interval_seconds: u64,
    /// Message text; supports `{session}` and `{now}` placeholders.
    pub message_template: String,
    /// Disabled entries are kept but never fire.
    pub enabled: bool,
    /// Next due time. Never moves backwards.
    pub next_run_at: DateTime<Utc>,
    /// Last successful dispatch.
    pub last_run_at: Option<DateTime<Utc>>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl ScheduledCheck {
    /// Create a check whose first fire is one interval from `now`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidInput` for a zero interval or one longer
    /// than [`MAX_SCHEDULE_SECONDS`].
    pub fn new(
        target_session: String,
        interval_seconds: u64,
        message_template: String,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        if interval_seconds == 0 {
            return Err(AppError::InvalidInput("interval must be at least one second".into()));
        }
        let next_run_at = offset_from(now, interval_seconds).ok_or_else(|| {
            AppError::InvalidInput(format!(
                "interval {interval_seconds}s exceeds the maximum of {MAX_SCHEDULE_SECONDS}s"
            ))
        })?;
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            target_session,
            interval_seconds,
            message_template,
            enabled: true,
            next_run_at,
            last_run_at: None,
            created_at: now,
        })
    }

    /// Whether the check should fire at `now`.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run_at <= now
    }

    /// Advance after a fire at `now`, skipping any missed intervals.
    ///
    /// An interval that no longer fits the calendar parks the check at the
    /// latest representable time.
    pub fn advance(&mut self, now: DateTime<Utc>) {
        let candidate = offset_from(now, self.interval_seconds).unwrap_or(DateTime::<Utc>::MAX_UTC);
        if candidate > self.next_run_at {
            self.next_run_at = candidate;
        }
        self.last_run_at = Some(now);
    }
}

/// A message written to a session once, at an explicit time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduledMessage {
    /// Unique identifier.
    pub id: String,
    /// Session the message is written to.
    pub target_session: String,
    /// Requested delivery time.
    pub run_at: DateTime<Utc>,
    /// Message text; supports `{session}` and `{now}` placeholders.
    pub message_template: String,
    /// Disabled entries are kept but never fire.
    pub enabled: bool,
    /// Due time; equal to `run_at` for one-shot messages.
    pub next_run_at: DateTime<Utc>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl ScheduledMessage {
    /// Create a one-shot message due at `run_at`.
    #[must_use]
    pub fn new(
        target_session: String,
        run_at: DateTime<Utc>,
        message_template: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            target_session,
            run_at,
            message_template,
            enabled: true,
            next_run_at: run_at,
            created_at: now,
        }
    }

    /// Whether the message should fire at `now`.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run_at <= now
    }
}

/// Expand `{session}` and `{now}` in a message template.
#[must_use]
pub fn render_template(template: &str, session: &str, now: DateTime<Utc>) -> String {
    template
        .replace("{session}", session)
        .replace("{now}", &now.to_rfc3339())
}

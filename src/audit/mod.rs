//! Decision journal for orchestration events.
//!
//! Every decision the supervisor takes on behalf of an agent (assigning a
//! task, nudging, escalating, accepting or rejecting output) is appended as
//! one JSON line by [`JsonlAuditWriter`] to a daily file under the state
//! directory.

pub mod writer;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of journaled decision.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// A task was claimed for an agent and its prompt delivered.
    Assignment,
    /// An idle or error nudge was written to an agent.
    Nudge,
    /// Nudging stopped; a human should look at the agent.
    Escalation,
    /// Submitted output failed validation.
    ValidationFailed,
    /// A task was completed with accepted output.
    Completion,
    /// A task ran out of retries.
    Blocked,
    /// A held task went back to the queue.
    Release,
    /// A supervised session terminated.
    SessionExit,
}

/// One journal line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    /// When the decision was taken.
    pub timestamp: DateTime<Utc>,
    /// Event classification.
    pub event_type: AuditEventType,
    /// Session the decision concerns.
    pub session_name: Option<String>,
    /// Task the decision concerns.
    pub task_id: Option<String>,
    /// Matched pattern category, as `group/name`.
    pub category: Option<String>,
    /// Short human-readable description.
    pub detail: Option<String>,
    /// Validation errors, in evaluation order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl AuditEntry {
    /// Construct an entry stamped now.
    #[must_use]
    pub fn new(event_type: AuditEventType) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            session_name: None,
            task_id: None,
            category: None,
            detail: None,
            errors: Vec::new(),
        }
    }

    /// Set the session.
    #[must_use]
    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session_name = Some(session.into());
        self
    }

    /// Set the task.
    #[must_use]
    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    /// Set the pattern category.
    #[must_use]
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Set the description.
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Attach validation errors.
    #[must_use]
    pub fn with_errors(mut self, errors: Vec<String>) -> Self {
        self.errors = errors;
        self
    }
}

/// Sink for journal entries.
///
/// Implementations are shared across tasks behind an `Arc`.
pub trait AuditLogger: Send + Sync {
    /// Record a single entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying write fails.
    fn log_entry(&self, entry: AuditEntry) -> crate::Result<()>;
}

/// Record `entry`, logging instead of failing when the journal is unwritable.
pub fn record(journal: &dyn AuditLogger, entry: AuditEntry) {
    if let Err(err) = journal.log_entry(entry) {
        tracing::warn!(%err, "failed to write decision journal");
    }
}

pub use writer::JsonlAuditWriter;

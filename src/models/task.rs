//! Queued work items and their state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::validation::{OutputSchema, ValidatedOutput};

/// Lifecycle status of a task. Exactly one holds at any instant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting in the queue.
    Open,
    /// Claimed by exactly one session.
    InProgress,
    /// Finished with a validated deliverable. Terminal.
    Done,
    /// Failed validation past its retry budget. Terminal until reopened by an operator.
    Blocked,
}

impl TaskStatus {
    /// Whether automation may no longer move this task.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Blocked)
    }
}

/// Scheduling priority; higher sorts first.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    /// Background work.
    Low,
    /// Default priority.
    #[default]
    Normal,
    /// Ahead of normal work.
    High,
    /// Ahead of everything else.
    Critical,
}

/// Input for enqueuing a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NewTask {
    /// Project queue the task belongs to.
    pub queue_key: String,
    /// Short title shown to the agent.
    pub title: String,
    /// Full instructions.
    #[serde(default)]
    pub description: String,
    /// Role that may take the task; `None` means any role.
    #[serde(default)]
    pub required_role: Option<String>,
    /// Scheduling priority.
    #[serde(default)]
    pub priority: TaskPriority,
    /// Declared structure of the deliverable.
    #[serde(default)]
    pub output_schema: Option<OutputSchema>,
    /// Deliverable file, relative to the session working directory.
    #[serde(default)]
    pub output_path: Option<String>,
    /// Override of the configured validation retry budget.
    #[serde(default)]
    pub max_retries: Option<u32>,
}

/// A unit of work queued for an agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    /// Unique identifier.
    pub id: String,
    /// Project queue the task belongs to.
    pub queue_key: String,
    /// Short title shown to the agent.
    pub title: String,
    /// Full instructions.
    pub description: String,
    /// Role that may take the task; `None` means any role.
    pub required_role: Option<String>,
    /// Scheduling priority.
    pub priority: TaskPriority,
    /// Current status.
    pub status: TaskStatus,
    /// Session holding the task while `InProgress`.
    pub assigned_session_name: Option<String>,
    /// When the current assignment was made.
    pub assigned_at: Option<DateTime<Utc>>,
    /// Failed validations so far.
    pub retry_count: u32,
    /// Failed validations allowed before blocking.
    pub max_retries: u32,
    /// Position in the queue; breaks priority ties FIFO.
    pub enqueue_seq: u64,
    /// Declared structure of the deliverable.
    pub output_schema: Option<OutputSchema>,
    /// Deliverable file, relative to the session working directory.
    pub output_path: Option<String>,
    /// Turns spent on the current assignment (deliveries, nudges, feedback).
    pub iterations: u32,
    /// Most recent validation errors, shown to the agent on its next turn.
    pub feedback: Vec<String>,
    /// Accepted deliverable.
    pub output: Option<ValidatedOutput>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last transition timestamp.
    pub updated_at: DateTime<Utc>,
    /// Completion timestamp.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Build an open task from enqueue input.
    #[must_use]
    pub fn from_new(new: NewTask, enqueue_seq: u64, default_max_retries: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            queue_key: new.queue_key,
            title: new.title,
            description: new.description,
            required_role: new.required_role,
            priority: new.priority,
            status: TaskStatus::Open,
            assigned_session_name: None,
            assigned_at: None,
            retry_count: 0,
            max_retries: new.max_retries.unwrap_or(default_max_retries),
            enqueue_seq,
            output_schema: new.output_schema,
            output_path: new.output_path,
            iterations: 0,
            feedback: Vec::new(),
            output: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Determine whether a status transition is permitted.
    #[must_use]
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self.status, next),
            (TaskStatus::Open, TaskStatus::InProgress)
                | (
                    TaskStatus::InProgress,
                    TaskStatus::Done | TaskStatus::Blocked | TaskStatus::Open
                )
                | (TaskStatus::Blocked, TaskStatus::Open)
        )
    }

    /// Whether an agent with `role` working on `project` may take this task.
    #[must_use]
    pub fn matches(&self, role: &str, project: &str) -> bool {
        self.queue_key == project && self.required_role.as_deref().is_none_or(|r| r == role)
    }

    /// Whether this task is held by `session`.
    #[must_use]
    pub fn is_held_by(&self, session: &str) -> bool {
        self.status == TaskStatus::InProgress
            && self.assigned_session_name.as_deref() == Some(session)
    }
}

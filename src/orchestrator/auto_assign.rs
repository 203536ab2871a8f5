//! Task queue, assignment and workload bookkeeping.
//!
//! All task transitions go through one async mutex over an in-memory index.
//! Each transition is persisted before it is applied to the index, so a
//! failed save leaves the previous state in place and surfaces the error.

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{info, info_span, warn, Instrument};

use crate::models::task::{NewTask, Task, TaskStatus};
use crate::models::validation::ValidatedOutput;
use crate::models::workload::AgentWorkload;
use crate::persistence::task_repo::TaskRepo;
use crate::persistence::workload_repo::WorkloadRepo;
use crate::persistence::SharedStore;
use crate::{AppError, Result};

/// Result of trying to take a specific task.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// The task is now `in_progress` for the caller.
    Claimed(Task),
    /// Someone else took it first, or it is no longer open.
    Lost,
    /// The session already holds a task.
    AgentBusy,
}

/// What happened to a task after a failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// The agent gets another attempt.
    Retry {
        /// Failures recorded so far.
        retry_count: u32,
        /// Failures still allowed before blocking.
        remaining: u32,
    },
    /// The retry budget is spent; the task is `blocked`.
    Blocked,
}

#[derive(Debug, Default)]
struct Index {
    tasks: HashMap<String, Task>,
    workloads: HashMap<String, AgentWorkload>,
    next_seq: u64,
}

impl Index {
    fn held_by(&self, session: &str) -> Option<&Task> {
        self.tasks.values().find(|t| t.is_held_by(session))
    }

    fn task(&self, task_id: &str) -> Result<&Task> {
        self.tasks
            .get(task_id)
            .ok_or_else(|| AppError::NotFound(format!("task {task_id} not found")))
    }

    fn best_open(&self, role: &str, project: &str) -> Option<&Task> {
        self.tasks
            .values()
            .filter(|t| t.status == TaskStatus::Open && t.matches(role, project))
            .max_by_key(|t| (t.priority, Reverse(t.enqueue_seq)))
    }
}

fn transition(task: &Task, next: TaskStatus) -> Result<Task> {
    if !task.can_transition_to(next) {
        return Err(AppError::InvalidTransition(format!(
            "task {} cannot move from {:?} to {next:?}",
            task.id, task.status
        )));
    }
    let mut updated = task.clone();
    updated.status = next;
    updated.updated_at = Utc::now();
    Ok(updated)
}

/// Matches idle agents to queued tasks and tracks their workload.
pub struct AutoAssignService {
    tasks: TaskRepo,
    workloads: WorkloadRepo,
    default_max_retries: u32,
    index: Mutex<Index>,
}

impl AutoAssignService {
    /// Create an empty service backed by `store`.
    #[must_use]
    pub fn new(store: SharedStore, default_max_retries: u32) -> Self {
        Self {
            tasks: TaskRepo::new(store.clone()),
            workloads: WorkloadRepo::new(store),
            default_max_retries,
            index: Mutex::new(Index::default()),
        }
    }

    /// Reload tasks and workloads from the store.
    ///
    /// `current_tasks` is recomputed from the task records.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if a collection cannot be read.
    pub async fn load(&self) -> Result<()> {
        let tasks = self.tasks.load_all().await?;
        let workloads = self.workloads.load_all().await?;

        let mut index = self.index.lock().await;
        index.next_seq = tasks.iter().map(|t| t.enqueue_seq + 1).max().unwrap_or(0);
        index.tasks = tasks.into_iter().map(|t| (t.id.clone(), t)).collect();
        index.workloads = workloads
            .into_iter()
            .map(|w| (w.session_name.clone(), w))
            .collect();

        let held: HashSet<String> = index
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::InProgress)
            .filter_map(|t| t.assigned_session_name.clone())
            .collect();
        for workload in index.workloads.values_mut() {
            workload.current_tasks = u32::from(held.contains(&workload.session_name));
        }

        info!(
            tasks = index.tasks.len(),
            workloads = index.workloads.len(),
            "task index loaded"
        );
        Ok(())
    }

    /// Make sure `session` has a workload record for `role`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if a new record cannot be saved.
    pub async fn register_agent(&self, session: &str, role: &str) -> Result<AgentWorkload> {
        let mut index = self.index.lock().await;
        if let Some(existing) = index.workloads.get(session) {
            if existing.role == role {
                return Ok(existing.clone());
            }
        }
        let mut workload = index
            .workloads
            .get(session)
            .cloned()
            .unwrap_or_else(|| AgentWorkload::new(session.to_owned(), role.to_owned()));
        workload.role = role.to_owned();
        workload.current_tasks = u32::from(index.held_by(session).is_some());
        self.workloads.save(&workload).await?;
        index.workloads.insert(session.to_owned(), workload.clone());
        Ok(workload)
    }

    /// Queue a new task.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidInput` for an empty title or queue key, or
    /// `AppError::Store` if the task cannot be saved.
    pub async fn enqueue(&self, new: NewTask) -> Result<Task> {
        if new.title.trim().is_empty() {
            return Err(AppError::InvalidInput("task title must not be empty".into()));
        }
        if new.queue_key.trim().is_empty() {
            return Err(AppError::InvalidInput("task queue key must not be empty".into()));
        }

        let mut index = self.index.lock().await;
        let task = Task::from_new(new, index.next_seq, self.default_max_retries);
        self.tasks.save(&task).await?;
        index.next_seq += 1;
        index.tasks.insert(task.id.clone(), task.clone());
        info!(
            task_id = %task.id,
            queue = %task.queue_key,
            priority = ?task.priority,
            "task enqueued"
        );
        Ok(task)
    }

    /// Highest-priority open task `session` could take, oldest first on ties.
    ///
    /// Returns `None` when the session already holds a task.
    pub async fn next_candidate(&self, session: &str, role: &str, project: &str) -> Option<Task> {
        let index = self.index.lock().await;
        if index.held_by(session).is_some() {
            return None;
        }
        index.best_open(role, project).cloned()
    }

    /// Atomically move `task_id` from `open` to `in_progress` for `session`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the transition cannot be persisted.
    pub async fn claim(&self, task_id: &str, session: &str) -> Result<ClaimOutcome> {
        let mut index = self.index.lock().await;
        if index.held_by(session).is_some() {
            return Ok(ClaimOutcome::AgentBusy);
        }
        let Some(task) = index.tasks.get(task_id) else {
            return Ok(ClaimOutcome::Lost);
        };
        if task.status != TaskStatus::Open {
            return Ok(ClaimOutcome::Lost);
        }

        let mut updated = transition(task, TaskStatus::InProgress)?;
        updated.assigned_session_name = Some(session.to_owned());
        updated.assigned_at = Some(updated.updated_at);
        updated.iterations = 0;
        self.tasks.save(&updated).await?;
        index.tasks.insert(updated.id.clone(), updated.clone());

        if let Some(workload) = index.workloads.get_mut(session) {
            workload.current_tasks = 1;
        }
        info!(task_id, session, "task claimed");
        Ok(ClaimOutcome::Claimed(updated))
    }

    /// Claim the best open task for an idle, unassigned agent.
    ///
    /// Lost races re-search the queue; the caller never sees them.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if a claim cannot be persisted.
    pub async fn assign_next(&self, session: &str, role: &str, project: &str) -> Result<Option<Task>> {
        let span = info_span!("assign_next", session, role, project);
        async {
            loop {
                let Some(candidate) = self.next_candidate(session, role, project).await else {
                    return Ok(None);
                };
                match self.claim(&candidate.id, session).await? {
                    ClaimOutcome::Claimed(task) => return Ok(Some(task)),
                    ClaimOutcome::AgentBusy => return Ok(None),
                    ClaimOutcome::Lost => {
                        info!(task_id = %candidate.id, "claim lost; searching again");
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    /// The task `session` currently holds.
    pub async fn current_task(&self, session: &str) -> Option<Task> {
        self.index.lock().await.held_by(session).cloned()
    }

    /// Look up a task by id.
    pub async fn get(&self, task_id: &str) -> Option<Task> {
        self.index.lock().await.tasks.get(task_id).cloned()
    }

    /// Mark a held task `done` with its validated output.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` if `session` does not hold the
    /// task, or `AppError::Store` if the transition cannot be persisted.
    pub async fn complete(&self, task_id: &str, session: &str, output: ValidatedOutput) -> Result<Task> {
        let mut index = self.index.lock().await;
        let task = index.task(task_id)?;
        if !task.is_held_by(session) {
            return Err(AppError::InvalidTransition(format!(
                "task {task_id} is not held by {session}"
            )));
        }

        let mut updated = transition(task, TaskStatus::Done)?;
        updated.completed_at = Some(updated.updated_at);
        updated.output = Some(output);
        updated.feedback.clear();
        self.tasks.save(&updated).await?;
        index.tasks.insert(updated.id.clone(), updated.clone());

        let today = Utc::now().date_naive();
        if let Some(workload) = index.workloads.get_mut(session) {
            workload.current_tasks = 0;
            workload.record_completion(updated.iterations, today);
            let snapshot = workload.clone();
            if let Err(err) = self.workloads.save(&snapshot).await {
                warn!(session, %err, "failed to persist workload");
            }
        }
        info!(task_id, session, iterations = updated.iterations, "task done");
        Ok(updated)
    }

    /// Record a failed validation on a held task.
    ///
    /// `retry_count` grows by one and never exceeds `max_retries`; reaching
    /// it blocks the task.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` if the task is not in progress,
    /// or `AppError::Store` if the transition cannot be persisted.
    pub async fn record_validation_failure(
        &self,
        task_id: &str,
        errors: Vec<String>,
    ) -> Result<FailureDisposition> {
        let mut index = self.index.lock().await;
        let task = index.task(task_id)?;
        if task.status != TaskStatus::InProgress {
            return Err(AppError::InvalidTransition(format!(
                "task {task_id} is not in progress"
            )));
        }

        let retry_count = (task.retry_count + 1).min(task.max_retries);
        let blocked = retry_count >= task.max_retries;
        let mut updated = if blocked {
            transition(task, TaskStatus::Blocked)?
        } else {
            let mut same = task.clone();
            same.updated_at = Utc::now();
            same
        };
        updated.retry_count = retry_count;
        updated.feedback = errors;
        self.tasks.save(&updated).await?;

        let session = updated.assigned_session_name.clone();
        let remaining = updated.max_retries - retry_count;
        index.tasks.insert(updated.id.clone(), updated);

        if blocked {
            if let Some(workload) = session.as_deref().and_then(|s| index.workloads.get_mut(s)) {
                workload.current_tasks = 0;
            }
            warn!(task_id, retry_count, "task blocked after repeated validation failures");
            Ok(FailureDisposition::Blocked)
        } else {
            info!(task_id, retry_count, remaining, "validation failed; retry allowed");
            Ok(FailureDisposition::Retry {
                retry_count,
                remaining,
            })
        }
    }

    /// Return a held task to the queue.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` if the task is not in progress,
    /// or `AppError::Store` if the transition cannot be persisted.
    pub async fn release(&self, task_id: &str) -> Result<Task> {
        let mut index = self.index.lock().await;
        let task = index.task(task_id)?;
        if task.status != TaskStatus::InProgress {
            return Err(AppError::InvalidTransition(format!(
                "task {task_id} is not in progress"
            )));
        }
        let mut updated = transition(task, TaskStatus::Open)?;
        let session = updated.assigned_session_name.take();
        updated.assigned_at = None;
        self.tasks.save(&updated).await?;
        index.tasks.insert(updated.id.clone(), updated.clone());

        if let Some(workload) = session.as_deref().and_then(|s| index.workloads.get_mut(s)) {
            workload.current_tasks = 0;
        }
        info!(task_id, session = ?session, "task released");
        Ok(updated)
    }

    /// Release every in-progress task whose session is not in `live`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if a release cannot be persisted.
    pub async fn release_orphans(&self, live: &HashSet<String>) -> Result<Vec<Task>> {
        let orphaned: Vec<String> = {
            let index = self.index.lock().await;
            index
                .tasks
                .values()
                .filter(|t| t.status == TaskStatus::InProgress)
                .filter(|t| {
                    t.assigned_session_name
                        .as_ref()
                        .is_none_or(|s| !live.contains(s))
                })
                .map(|t| t.id.clone())
                .collect()
        };

        let mut released = Vec::with_capacity(orphaned.len());
        for task_id in orphaned {
            match self.release(&task_id).await {
                Ok(task) => released.push(task),
                Err(AppError::InvalidTransition(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(released)
    }

    /// Move a blocked task back to the queue with a fresh retry budget.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` if the task is not blocked, or
    /// `AppError::Store` if the transition cannot be persisted.
    pub async fn reopen(&self, task_id: &str) -> Result<Task> {
        let mut index = self.index.lock().await;
        let task = index.task(task_id)?;
        if task.status != TaskStatus::Blocked {
            return Err(AppError::InvalidTransition(format!(
                "task {task_id} is not blocked"
            )));
        }
        let mut updated = transition(task, TaskStatus::Open)?;
        updated.retry_count = 0;
        updated.feedback.clear();
        updated.assigned_session_name = None;
        updated.assigned_at = None;
        self.tasks.save(&updated).await?;
        index.tasks.insert(updated.id.clone(), updated.clone());
        info!(task_id, "task reopened");
        Ok(updated)
    }

    /// Count one more turn spent on a held task.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` if the task is not in progress,
    /// or `AppError::Store` if the update cannot be persisted.
    pub async fn record_iteration(&self, task_id: &str) -> Result<u32> {
        let mut index = self.index.lock().await;
        let task = index.task(task_id)?;
        if task.status != TaskStatus::InProgress {
            return Err(AppError::InvalidTransition(format!(
                "task {task_id} is not in progress"
            )));
        }
        let mut updated = task.clone();
        updated.iterations += 1;
        updated.updated_at = Utc::now();
        self.tasks.save(&updated).await?;
        let iterations = updated.iterations;
        index.tasks.insert(updated.id.clone(), updated);
        Ok(iterations)
    }

    /// Workload record of one session.
    pub async fn workload(&self, session: &str) -> Option<AgentWorkload> {
        self.index.lock().await.workloads.get(session).cloned()
    }

    /// Every workload record, sorted by session name.
    pub async fn workloads(&self) -> Vec<AgentWorkload> {
        let mut all: Vec<_> = self.index.lock().await.workloads.values().cloned().collect();
        all.sort_by(|a, b| a.session_name.cmp(&b.session_name));
        all
    }

    /// Every task, in queue order.
    pub async fn list_tasks(&self) -> Vec<Task> {
        let mut all: Vec<_> = self.index.lock().await.tasks.values().cloned().collect();
        all.sort_by_key(|t| t.enqueue_seq);
        all
    }
}

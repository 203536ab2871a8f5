//! Per-agent supervision: output pumps and the decision sweep.
//!
//! Each supervised session gets a pump task that feeds the activity tracker
//! and a bounded output window. The sweep, run once per control-loop tick,
//! looks at every idle session and decides whether to hand it work, nudge
//! it, escalate it or validate what it produced. The per-agent decision
//! state sits behind its own async mutex so reading the idle state,
//! deciding and acting happen as one step for that session.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::audit::{self, AuditEntry, AuditEventType, AuditLogger};
use crate::backend::{send_line, OutputEvent, SharedBackend};
use crate::config::{AgentConfig, DetectionConfig, SpawnConfig};
use crate::models::session::{ExitInfo, Session, SessionOptions};
use crate::models::task::Task;
use crate::{AppError, Result};

use super::activity::ActivityTracker;
use super::auto_assign::AutoAssignService;
use super::continuation::{ContinuationDetector, NudgePolicy, RecommendedAction};
use super::output_window::OutputWindow;
use super::patterns::{CompletionKind, PatternCategory};
use super::validator::{SubmissionOutcome, TaskOutputValidator};

/// Output arriving this long after a nudge counts as a genuine response
/// rather than the terminal echoing the nudge back.
const ECHO_GRACE: Duration = Duration::from_secs(2);

/// Identity of a supervised agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentProfile {
    /// Session name.
    pub name: String,
    /// Role used for task matching.
    pub role: String,
    /// Project (queue key) used for task matching.
    pub project: String,
    /// Working directory; deliverable paths resolve against it.
    pub cwd: PathBuf,
}

impl AgentProfile {
    /// Profile for a configured agent.
    #[must_use]
    pub fn from_config(agent: &AgentConfig) -> Self {
        Self {
            name: agent.name.clone(),
            role: agent.role.clone(),
            project: agent.project.clone(),
            cwd: agent.cwd.clone().unwrap_or_else(|| PathBuf::from(".")),
        }
    }
}

/// What one sweep did for one session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "sweep", rename_all = "snake_case")]
pub enum SweepOutcome {
    /// The session produced output within the idle threshold.
    Busy,
    /// Idle with no task and nothing queued for it.
    NoWork,
    /// A task was claimed and its prompt delivered.
    Assigned {
        /// Claimed task.
        task_id: String,
    },
    /// A nudge was written.
    Nudged {
        /// Category that prompted it.
        category: PatternCategory,
    },
    /// Nudging stopped for this session.
    Escalated,
    /// A completion was checked against the task's deliverable.
    Validated {
        /// Result of the check.
        outcome: SubmissionOutcome,
    },
    /// A write to the session failed.
    DeliveryFailed,
    /// Nothing to do.
    Waiting,
}

#[derive(Debug, Default)]
struct NudgeState {
    nudge_count: u32,
    last_nudge_at: Option<Instant>,
    handled_epoch: Option<u64>,
    escalated: bool,
}

struct AgentHandle {
    profile: AgentProfile,
    window: OutputWindow,
    control: Mutex<NudgeState>,
}

/// Collaborators the supervisor drives.
pub struct SupervisorParts {
    /// Session backend.
    pub backend: SharedBackend,
    /// Task queue.
    pub assign: Arc<AutoAssignService>,
    /// Deliverable validator.
    pub validator: Arc<TaskOutputValidator>,
    /// Output classifier.
    pub detector: ContinuationDetector,
    /// Decision journal.
    pub journal: Arc<dyn AuditLogger>,
}

/// Watches supervised sessions and acts on their behalf.
pub struct Supervisor {
    backend: SharedBackend,
    assign: Arc<AutoAssignService>,
    validator: Arc<TaskOutputValidator>,
    detector: ContinuationDetector,
    journal: Arc<dyn AuditLogger>,
    tracker: ActivityTracker,
    detection: DetectionConfig,
    policy: NudgePolicy,
    agents: RwLock<HashMap<String, Arc<AgentHandle>>>,
    cancel: CancellationToken,
}

impl Supervisor {
    /// Create a supervisor with no sessions.
    #[must_use]
    pub fn new(parts: SupervisorParts, detection: DetectionConfig) -> Self {
        Self {
            backend: parts.backend,
            assign: parts.assign,
            validator: parts.validator,
            detector: parts.detector,
            journal: parts.journal,
            tracker: ActivityTracker::new(),
            policy: NudgePolicy::from_config(&detection),
            detection,
            agents: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Activity stamps of supervised sessions.
    #[must_use]
    pub fn tracker(&self) -> &ActivityTracker {
        &self.tracker
    }

    /// Profiles of supervised sessions, sorted by name.
    pub async fn agents(&self) -> Vec<AgentProfile> {
        let mut profiles: Vec<AgentProfile> = self
            .agents
            .read()
            .await
            .values()
            .map(|agent| agent.profile.clone())
            .collect();
        profiles.sort_by(|a, b| a.name.cmp(&b.name));
        profiles
    }

    /// Start a configured agent and supervise it.
    ///
    /// A session that never started is returned as-is and not supervised.
    ///
    /// # Errors
    ///
    /// Returns `AppError::AlreadyExists` if a live session holds the name,
    /// or the error from registering the agent's workload.
    pub async fn launch(self: &Arc<Self>, agent: &AgentConfig, spawn: &SpawnConfig) -> Result<Session> {
        let profile = AgentProfile::from_config(agent);
        let mut opts = SessionOptions::new(agent.command.clone(), profile.cwd.clone())
            .with_args(agent.args.iter().cloned())
            .with_size(spawn.cols, spawn.rows);
        opts.env = agent.env.clone();

        let session = self.backend.create(&agent.name, opts).await?;
        if !session.is_live() {
            warn!(session = %agent.name, failure = ?session.failure, "agent did not start");
            return Ok(session);
        }
        self.supervise(profile).await?;
        Ok(session)
    }

    /// Launch every configured agent, then release tasks whose holder did
    /// not survive the restart.
    ///
    /// Launch failures are logged and skipped. Only reattached sessions keep
    /// the tasks they held; a freshly started process knows nothing of them.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if a release cannot be persisted.
    pub async fn start_agents(self: &Arc<Self>, agents: &[AgentConfig], spawn: &SpawnConfig) -> Result<Vec<Task>> {
        let mut reattached = HashSet::new();
        for agent in agents {
            match self.launch(agent, spawn).await {
                Ok(session) => {
                    info!(
                        session = %session.name,
                        state = ?session.state,
                        reattached = session.reattached,
                        "agent launched"
                    );
                    if session.reattached && session.is_live() {
                        reattached.insert(session.name);
                    }
                }
                Err(err) => error!(agent = %agent.name, %err, "failed to launch agent"),
            }
        }

        let released = self.assign.release_orphans(&reattached).await?;
        if !released.is_empty() {
            warn!(count = released.len(), "released tasks held before restart");
        }
        Ok(released)
    }

    /// Begin supervising an existing session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session, or the error
    /// from registering the agent's workload.
    pub async fn supervise(self: &Arc<Self>, profile: AgentProfile) -> Result<()> {
        let name = profile.name.clone();
        self.assign.register_agent(&name, &profile.role).await?;
        let events = self.backend.subscribe(&name).await?;

        let agent = Arc::new(AgentHandle {
            profile,
            window: OutputWindow::new(self.detection.output_window_chars),
            control: Mutex::new(NudgeState::default()),
        });
        // A fresh agent gets one full threshold before it counts as idle.
        self.tracker.record_activity(&name);
        self.agents
            .write()
            .await
            .insert(name.clone(), Arc::clone(&agent));

        let supervisor = Arc::clone(self);
        let span = info_span!("output_pump", session = %name);
        tokio::spawn(supervisor.pump(agent, events).instrument(span));
        info!(session = %name, "agent supervised");
        Ok(())
    }

    async fn pump(
        self: Arc<Self>,
        agent: Arc<AgentHandle>,
        mut events: tokio::sync::broadcast::Receiver<OutputEvent>,
    ) {
        let name = agent.profile.name.clone();
        loop {
            let event = tokio::select! {
                () = self.cancel.cancelled() => return,
                event = events.recv() => event,
            };
            match event {
                Ok(OutputEvent::Data(bytes)) => {
                    self.tracker.record_activity(&name);
                    agent.window.push(&bytes);
                }
                Ok(OutputEvent::Exited(exit)) => {
                    self.on_exit(&agent, exit).await;
                    return;
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "output pump lagged");
                    self.tracker.record_activity(&name);
                }
                Err(RecvError::Closed) => {
                    debug!("output stream closed");
                    return;
                }
            }
        }
    }

    async fn on_exit(&self, agent: &Arc<AgentHandle>, exit: ExitInfo) {
        let name = &agent.profile.name;
        info!(session = %name, reason = ?exit.reason, exit_code = ?exit.exit_code, "supervised session exited");

        if let Some(task) = self.assign.current_task(name).await {
            match self.assign.release(&task.id).await {
                Ok(_) => audit::record(
                    self.journal.as_ref(),
                    AuditEntry::new(AuditEventType::Release)
                        .with_session(name.as_str())
                        .with_task(task.id.as_str())
                        .with_detail("session exited"),
                ),
                Err(err) => warn!(task_id = %task.id, %err, "failed to release task of exited session"),
            }
        }

        self.tracker.clear_session(name);
        {
            let mut agents = self.agents.write().await;
            if agents.get(name).is_some_and(|current| Arc::ptr_eq(current, agent)) {
                agents.remove(name);
            }
        }
        audit::record(
            self.journal.as_ref(),
            AuditEntry::new(AuditEventType::SessionExit)
                .with_session(name.as_str())
                .with_detail(format!("{:?} (exit code {:?})", exit.reason, exit.exit_code)),
        );
    }

    /// Evaluate every supervised session once.
    pub async fn sweep(&self) -> Vec<(String, SweepOutcome)> {
        let agents: Vec<Arc<AgentHandle>> = self.agents.read().await.values().cloned().collect();
        let span = info_span!("sweep", agents = agents.len());
        async {
            let mut outcomes = join_all(agents.iter().map(|agent| async move {
                (agent.profile.name.clone(), self.evaluate(agent).await)
            }))
            .await;
            outcomes.sort_by(|a, b| a.0.cmp(&b.0));
            outcomes
        }
        .instrument(span)
        .await
    }

    async fn evaluate(&self, agent: &AgentHandle) -> SweepOutcome {
        let name = agent.profile.name.as_str();
        let mut state = agent.control.lock().await;
        let now = Instant::now();

        if let (Some(nudged), Some(active)) = (state.last_nudge_at, self.tracker.last_activity(name)) {
            if active > nudged + ECHO_GRACE {
                state.nudge_count = 0;
                state.last_nudge_at = None;
                state.escalated = false;
            }
        }

        let idle = self.tracker.idle_time(name);
        if idle < self.policy.idle_threshold {
            return SweepOutcome::Busy;
        }

        let Some(task) = self.assign.current_task(name).await else {
            return self.offer_work(agent, &mut state).await;
        };

        let signal = self.detector.classify(&agent.window.text());
        let action = ContinuationDetector::recommend_action(
            signal,
            idle,
            &self.policy,
            state.last_nudge_at,
            now,
        );
        match action {
            RecommendedAction::Validate(kind) => {
                let epoch = agent.window.epoch();
                if state.handled_epoch == Some(epoch) {
                    return SweepOutcome::Waiting;
                }
                state.handled_epoch = Some(epoch);
                self.validate_deliverable(agent, &task, kind).await
            }
            RecommendedAction::Escalate(kind) => {
                if !self.policy.cooldown_elapsed(state.last_nudge_at, now) {
                    return SweepOutcome::Waiting;
                }
                let message = self.detection.error_message(kind);
                self.nudge(agent, &mut state, &task, PatternCategory::Error(kind), &message)
                    .await
            }
            RecommendedAction::Nudge(kind) => {
                let message = self.detection.idle_nudge_message.clone();
                self.nudge(agent, &mut state, &task, PatternCategory::Idle(kind), &message)
                    .await
            }
            RecommendedAction::Wait => SweepOutcome::Waiting,
        }
    }

    async fn offer_work(&self, agent: &AgentHandle, state: &mut NudgeState) -> SweepOutcome {
        let profile = &agent.profile;
        let task = match self
            .assign
            .assign_next(&profile.name, &profile.role, &profile.project)
            .await
        {
            Ok(Some(task)) => task,
            Ok(None) => return SweepOutcome::NoWork,
            Err(err) => {
                warn!(session = %profile.name, %err, "assignment failed");
                return SweepOutcome::NoWork;
            }
        };

        if let Err(err) = send_line(self.backend.as_ref(), &profile.name, &task_prompt(&task)).await {
            warn!(session = %profile.name, task_id = %task.id, %err, "task prompt not delivered; releasing");
            match self.assign.release(&task.id).await {
                Ok(_) => audit::record(
                    self.journal.as_ref(),
                    AuditEntry::new(AuditEventType::Release)
                        .with_session(profile.name.as_str())
                        .with_task(task.id.as_str())
                        .with_detail(format!("prompt delivery failed: {err}")),
                ),
                Err(release_err) => warn!(task_id = %task.id, %release_err, "failed to release task"),
            }
            return SweepOutcome::DeliveryFailed;
        }

        if let Err(err) = self.assign.record_iteration(&task.id).await {
            warn!(task_id = %task.id, %err, "failed to count iteration");
        }
        agent.window.clear();
        *state = NudgeState::default();
        audit::record(
            self.journal.as_ref(),
            AuditEntry::new(AuditEventType::Assignment)
                .with_session(profile.name.as_str())
                .with_task(task.id.as_str())
                .with_detail(task.title.as_str()),
        );
        info!(session = %profile.name, task_id = %task.id, "task assigned");
        SweepOutcome::Assigned { task_id: task.id }
    }

    async fn nudge(
        &self,
        agent: &AgentHandle,
        state: &mut NudgeState,
        task: &Task,
        category: PatternCategory,
        message: &str,
    ) -> SweepOutcome {
        let name = agent.profile.name.as_str();
        if state.escalated {
            return SweepOutcome::Waiting;
        }
        if state.nudge_count >= self.detection.max_nudges {
            state.escalated = true;
            warn!(session = name, task_id = %task.id, %category, nudges = state.nudge_count, "agent unresponsive; escalating");
            audit::record(
                self.journal.as_ref(),
                AuditEntry::new(AuditEventType::Escalation)
                    .with_session(name)
                    .with_task(task.id.as_str())
                    .with_category(category.to_string())
                    .with_detail(format!("no progress after {} nudges", state.nudge_count)),
            );
            return SweepOutcome::Escalated;
        }

        if let Err(err) = send_line(self.backend.as_ref(), name, message).await {
            warn!(session = name, %err, "nudge not delivered");
            return SweepOutcome::DeliveryFailed;
        }
        state.nudge_count += 1;
        state.last_nudge_at = Some(Instant::now());
        if let Err(err) = self.assign.record_iteration(&task.id).await {
            warn!(task_id = %task.id, %err, "failed to count iteration");
        }
        audit::record(
            self.journal.as_ref(),
            AuditEntry::new(AuditEventType::Nudge)
                .with_session(name)
                .with_task(task.id.as_str())
                .with_category(category.to_string())
                .with_detail(message),
        );
        info!(session = name, %category, nudges = state.nudge_count, "nudge sent");
        SweepOutcome::Nudged { category }
    }

    async fn validate_deliverable(&self, agent: &AgentHandle, task: &Task, kind: CompletionKind) -> SweepOutcome {
        let name = agent.profile.name.as_str();
        let span = info_span!("validate_deliverable", session = name, task_id = %task.id, completion = kind.name());
        async {
            let submitted = match &task.output_path {
                Some(path) => match read_deliverable(&agent.profile.cwd.join(path)).await {
                    Ok(value) => self.validator.submit(&task.id, name, &value).await,
                    Err(problem) => self.validator.reject(&task.id, vec![problem]).await,
                },
                None if task.output_schema.is_none() => self.validator.accept(&task.id, name, None).await,
                None => {
                    warn!("completion seen but the task has no output path; escalating for submission");
                    audit::record(
                        self.journal.as_ref(),
                        AuditEntry::new(AuditEventType::Escalation)
                            .with_session(name)
                            .with_task(task.id.as_str())
                            .with_category(kind.name())
                            .with_detail("completion reported without submitted output"),
                    );
                    return SweepOutcome::Escalated;
                }
            };
            match submitted {
                Ok(outcome) => {
                    self.report_outcome(agent, task, &outcome).await;
                    SweepOutcome::Validated { outcome }
                }
                Err(err) => {
                    warn!(%err, "validation could not be applied");
                    SweepOutcome::Waiting
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Validate output submitted for a held task and tell the agent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown task,
    /// `AppError::InvalidTransition` if `session` does not hold it, or
    /// `AppError::Store` if the transition cannot be persisted.
    pub async fn submit_output(&self, task_id: &str, session: &str, output: &Value) -> Result<SubmissionOutcome> {
        let outcome = self.validator.submit(task_id, session, output).await?;
        let task = self
            .assign
            .get(task_id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("task {task_id} not found")))?;
        let agent = self.agents.read().await.get(session).cloned();
        match agent {
            Some(agent) => self.report_outcome(&agent, &task, &outcome).await,
            None => journal_outcome(self.journal.as_ref(), session, &task, &outcome),
        }
        Ok(outcome)
    }

    async fn report_outcome(&self, agent: &AgentHandle, task: &Task, outcome: &SubmissionOutcome) {
        let name = agent.profile.name.as_str();
        journal_outcome(self.journal.as_ref(), name, task, outcome);
        // The completion line that triggered this check must not be judged twice.
        agent.window.clear();
        let notice = match outcome {
            SubmissionOutcome::Accepted { .. } => return,
            SubmissionOutcome::Rejected {
                errors,
                retry_count,
                ..
            } => rejection_notice(task, errors, *retry_count),
            SubmissionOutcome::Blocked { .. } => blocked_notice(task),
        };
        if let Err(err) = send_line(self.backend.as_ref(), name, &notice).await {
            warn!(session = name, task_id = %task.id, %err, "validation feedback not delivered");
        }
    }

    /// Kill a supervised session. Its pump releases any held task.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session.
    pub async fn kill(&self, name: &str) -> Result<ExitInfo> {
        self.backend.kill(name).await
    }

    /// Stop the pumps and kill every supervised session.
    pub async fn shutdown(&self) {
        let names: Vec<String> = self.agents.read().await.keys().cloned().collect();
        self.cancel.cancel();
        let results = join_all(names.iter().map(|name| self.backend.kill(name))).await;
        for (name, result) in names.iter().zip(results) {
            match result {
                Ok(exit) => info!(session = %name, reason = ?exit.reason, "session stopped"),
                Err(err) => warn!(session = %name, %err, "failed to stop session"),
            }
        }
        self.agents.write().await.clear();
    }
}

fn journal_outcome(journal: &dyn AuditLogger, session: &str, task: &Task, outcome: &SubmissionOutcome) {
    let entry = match outcome {
        SubmissionOutcome::Accepted { .. } => AuditEntry::new(AuditEventType::Completion),
        SubmissionOutcome::Rejected { errors, .. } => {
            AuditEntry::new(AuditEventType::ValidationFailed).with_errors(errors.clone())
        }
        SubmissionOutcome::Blocked { errors } => {
            AuditEntry::new(AuditEventType::Blocked).with_errors(errors.clone())
        }
    };
    audit::record(
        journal,
        entry.with_session(session).with_task(task.id.as_str()),
    );
}

async fn read_deliverable(path: &std::path::Path) -> std::result::Result<Value, String> {
    let raw = tokio::fs::read(path)
        .await
        .map_err(|err| format!("deliverable {} could not be read: {err}", path.display()))?;
    serde_json::from_slice(&raw)
        .map_err(|err| format!("deliverable {} is not valid JSON: {err}", path.display()))
}

fn one_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Prompt written to an agent when it receives a task.
#[must_use]
pub fn task_prompt(task: &Task) -> String {
    let mut prompt = format!("New task [{}]: {}", task.id, one_line(&task.title));
    if !task.description.trim().is_empty() {
        prompt.push_str(" -- ");
        prompt.push_str(&one_line(&task.description));
    }
    if let Some(path) = &task.output_path {
        prompt.push_str(&format!(" Write the result as JSON to {path}."));
    }
    prompt
}

/// Feedback written to an agent whose output was rejected.
#[must_use]
pub fn rejection_notice(task: &Task, errors: &[String], retry_count: u32) -> String {
    let listed: Vec<String> = errors
        .iter()
        .enumerate()
        .map(|(i, err)| format!("{}) {}", i + 1, one_line(err)))
        .collect();
    format!(
        "Output for task [{}] was rejected (attempt {retry_count} of {}): {} Fix these and produce the output again.",
        task.id,
        task.max_retries,
        listed.join("; "),
    )
}

/// Notice written to an agent whose task ran out of retries.
#[must_use]
pub fn blocked_notice(task: &Task) -> String {
    format!(
        "Task [{}] is blocked after {} rejected attempts. Stop working on it; it needs human review.",
        task.id, task.max_retries
    )
}

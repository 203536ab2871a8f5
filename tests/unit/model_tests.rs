//! Task state machine, schedule and schema model tests.

use agent_shepherd::models::schedule::{ScheduledCheck, ScheduledMessage, MAX_SCHEDULE_SECONDS};
use agent_shepherd::models::task::{NewTask, Task, TaskPriority, TaskStatus};
use agent_shepherd::models::validation::{FieldType, OutputSchema};
use agent_shepherd::AppError;
use chrono::{Duration, Utc};
use serde_json::json;

fn open_task() -> Task {
    Task::from_new(
        NewTask {
            queue_key: "web".into(),
            title: "fix login".into(),
            ..NewTask::default()
        },
        7,
        2,
    )
}

#[test]
fn new_task_starts_open() {
    let task = open_task();
    assert_eq!(task.status, TaskStatus::Open);
    assert_eq!(task.enqueue_seq, 7);
    assert_eq!(task.max_retries, 2);
    assert_eq!(task.retry_count, 0);
    assert_eq!(task.priority, TaskPriority::Normal);
    assert!(task.assigned_session_name.is_none());
}

#[test]
fn per_task_retry_budget_overrides_default() {
    let task = Task::from_new(
        NewTask {
            queue_key: "web".into(),
            title: "t".into(),
            max_retries: Some(5),
            ..NewTask::default()
        },
        0,
        2,
    );
    assert_eq!(task.max_retries, 5);
}

#[test]
fn allowed_transitions() {
    let mut task = open_task();
    assert!(task.can_transition_to(TaskStatus::InProgress));
    assert!(!task.can_transition_to(TaskStatus::Done));
    assert!(!task.can_transition_to(TaskStatus::Blocked));

    task.status = TaskStatus::InProgress;
    assert!(task.can_transition_to(TaskStatus::Done));
    assert!(task.can_transition_to(TaskStatus::Blocked));
    assert!(task.can_transition_to(TaskStatus::Open));

    task.status = TaskStatus::Done;
    for next in [
        TaskStatus::Open,
        TaskStatus::InProgress,
        TaskStatus::Blocked,
    ] {
        assert!(!task.can_transition_to(next), "done -> {next:?}");
    }

    task.status = TaskStatus::Blocked;
    assert!(task.can_transition_to(TaskStatus::Open));
    assert!(!task.can_transition_to(TaskStatus::InProgress));
    assert!(!task.can_transition_to(TaskStatus::Done));
}

#[test]
fn terminal_statuses() {
    assert!(TaskStatus::Done.is_terminal());
    assert!(TaskStatus::Blocked.is_terminal());
    assert!(!TaskStatus::Open.is_terminal());
    assert!(!TaskStatus::InProgress.is_terminal());
}

#[test]
fn role_and_project_matching() {
    let mut task = open_task();
    assert!(task.matches("dev", "web"));
    assert!(task.matches("qa", "web"));
    assert!(!task.matches("dev", "api"));

    task.required_role = Some("qa".into());
    assert!(task.matches("qa", "web"));
    assert!(!task.matches("dev", "web"));
}

#[test]
fn held_only_while_in_progress() {
    let mut task = open_task();
    task.assigned_session_name = Some("dev-1".into());
    assert!(!task.is_held_by("dev-1"));
    task.status = TaskStatus::InProgress;
    assert!(task.is_held_by("dev-1"));
    assert!(!task.is_held_by("dev-2"));
}

#[test]
fn priorities_order_low_to_critical() {
    assert!(TaskPriority::Critical > TaskPriority::High);
    assert!(TaskPriority::High > TaskPriority::Normal);
    assert!(TaskPriority::Normal > TaskPriority::Low);
}

#[test]
fn new_task_deserializes_with_defaults() {
    let new: NewTask =
        serde_json::from_value(json!({ "queue_key": "web", "title": "t", "priority": "high" }))
            .expect("minimal task");
    assert_eq!(new.priority, TaskPriority::High);
    assert!(new.description.is_empty());
    assert!(new.output_schema.is_none());
}

#[test]
fn check_skips_missed_intervals_after_downtime() {
    let start = Utc::now();
    let mut check = ScheduledCheck::new("dev-1".into(), 300, "status?".into(), start)
        .expect("valid interval");
    assert_eq!(check.next_run_at, start + Duration::seconds(300));
    assert!(!check.is_due(start));

    let resumed = start + Duration::hours(2);
    assert!(check.is_due(resumed));
    check.advance(resumed);
    assert_eq!(check.next_run_at, resumed + Duration::seconds(300));
    assert_eq!(check.last_run_at, Some(resumed));
    assert!(!check.is_due(resumed));
}

#[test]
fn out_of_range_intervals_are_invalid_input() {
    let now = Utc::now();
    for interval in [0, MAX_SCHEDULE_SECONDS + 1, 10_000_000_000_000, u64::MAX] {
        let err = ScheduledCheck::new("dev-1".into(), interval, "ping".into(), now)
            .expect_err("out of range");
        assert!(matches!(err, AppError::InvalidInput(_)), "{interval}: {err}");
    }
}

#[test]
fn disabled_entries_are_never_due() {
    let now = Utc::now();
    let mut message = ScheduledMessage::new("dev-1".into(), now, "wrap up".into(), now);
    assert!(message.is_due(now));
    message.enabled = false;
    assert!(!message.is_due(now + Duration::days(1)));
}

#[test]
fn schema_reads_json_schema_subset() {
    let schema: OutputSchema = serde_json::from_value(json!({
        "required": ["summary"],
        "properties": {
            "summary": { "type": "string" },
            "files": { "type": "array" }
        },
        "additionalProperties": false
    }))
    .expect("schema");
    assert_eq!(schema.required, ["summary"]);
    assert_eq!(schema.properties["files"].kind, FieldType::Array);
    assert!(!schema.allow_additional);

    let open: OutputSchema = serde_json::from_value(json!({})).expect("empty schema");
    assert!(open.allow_additional);
}

#[test]
fn integer_field_rejects_fractions() {
    assert!(FieldType::Integer.accepts(&json!(3)));
    assert!(!FieldType::Integer.accepts(&json!(3.5)));
    assert!(FieldType::Integer.accepts(&json!(3.0)));
    assert!(FieldType::Integer.accepts(&json!(-2.0)));
    assert!(FieldType::Number.accepts(&json!(3.5)));
    assert!(FieldType::Null.accepts(&json!(null)));
}

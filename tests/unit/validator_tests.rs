//! Deliverable validation and retry budget tests.

use std::sync::Arc;

use agent_shepherd::models::task::{NewTask, TaskStatus};
use agent_shepherd::models::validation::OutputSchema;
use agent_shepherd::orchestrator::auto_assign::AutoAssignService;
use agent_shepherd::orchestrator::validator::{validate, SubmissionOutcome, TaskOutputValidator};
use agent_shepherd::persistence::MemoryStore;
use agent_shepherd::AppError;
use serde_json::{json, Value};

fn summary_schema() -> OutputSchema {
    serde_json::from_value(json!({
        "required": ["summary", "files_changed"],
        "properties": {
            "summary": { "type": "string" },
            "files_changed": { "type": "integer" },
            "notes": { "type": "string" }
        }
    }))
    .expect("schema")
}

#[test]
fn valid_output_passes_with_data() {
    let output = json!({ "summary": "fixed", "files_changed": 2 });
    let result = validate(&summary_schema(), &output, 1024);
    assert!(result.valid);
    assert!(result.errors.is_empty());
    assert_eq!(result.data, Some(output));
}

#[test]
fn errors_follow_evaluation_order() {
    let output = json!({ "files_changed": "two", "notes": 5 });
    let result = validate(&summary_schema(), &output, 1024);
    assert!(!result.valid);
    assert_eq!(
        result.errors,
        [
            "missing required field `summary`",
            "field `files_changed` must be integer, got string",
            "field `notes` must be string, got integer",
        ]
    );
    assert!(result.data.is_none());
}

#[test]
fn whole_floats_count_as_integers() {
    let output = json!({ "summary": "fixed", "files_changed": 1.0 });
    let result = validate(&summary_schema(), &output, 1024);
    assert!(result.valid, "{:?}", result.errors);

    let output = json!({ "summary": "fixed", "files_changed": 1.5 });
    let result = validate(&summary_schema(), &output, 1024);
    assert_eq!(
        result.errors,
        ["field `files_changed` must be integer, got number"]
    );
}

#[test]
fn oversized_output_stops_evaluation() {
    let output = json!({ "notes": "x".repeat(200) });
    let result = validate(&summary_schema(), &output, 64);
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].contains("64-byte limit"), "{:?}", result.errors);
}

#[test]
fn schema_size_bound_overrides_default() {
    let schema = OutputSchema {
        max_bytes: Some(4),
        ..OutputSchema::default()
    };
    assert!(!validate(&schema, &json!("hello"), 1024).valid);
    assert!(validate(&schema, &json!(12), 1024).valid);
}

#[test]
fn non_object_root_is_rejected_when_fields_are_declared() {
    let result = validate(&summary_schema(), &json!(["a"]), 1024);
    assert_eq!(result.errors, ["output must be a JSON object, got array"]);

    let anything = OutputSchema::default();
    assert!(validate(&anything, &json!(["a"]), 1024).valid);
}

#[test]
fn closed_schema_reports_unexpected_fields_sorted() {
    let mut schema = summary_schema();
    schema.allow_additional = false;
    let output = json!({ "summary": "s", "files_changed": 1, "zeta": 1, "alpha": 2 });
    let result = validate(&schema, &output, 1024);
    assert_eq!(
        result.errors,
        ["unexpected field `alpha`", "unexpected field `zeta`"]
    );
}

async fn held_task(schema: Option<OutputSchema>) -> (Arc<AutoAssignService>, TaskOutputValidator, String) {
    let assign = Arc::new(AutoAssignService::new(Arc::new(MemoryStore::new()), 2));
    assign.register_agent("dev-1", "dev").await.expect("register");
    let task = assign
        .enqueue(NewTask {
            queue_key: "web".into(),
            title: "write summary".into(),
            output_schema: schema,
            ..NewTask::default()
        })
        .await
        .expect("enqueue");
    assign
        .assign_next("dev-1", "dev", "web")
        .await
        .expect("assign")
        .expect("task available");
    let validator = TaskOutputValidator::new(Arc::clone(&assign), 1024);
    (assign, validator, task.id)
}

#[tokio::test]
async fn two_rejections_block_the_task() {
    let (assign, validator, task_id) = held_task(Some(summary_schema())).await;

    let first = validator
        .submit(&task_id, "dev-1", &json!({ "summary": "s" }))
        .await
        .expect("first submit");
    assert_eq!(
        first,
        SubmissionOutcome::Rejected {
            errors: vec!["missing required field `files_changed`".into()],
            retry_count: 1,
            remaining: 1,
        }
    );
    let task = assign.get(&task_id).await.expect("task");
    assert_eq!(task.status, TaskStatus::InProgress);
    assert_eq!(task.feedback, ["missing required field `files_changed`"]);

    let second = validator
        .submit(&task_id, "dev-1", &json!({}))
        .await
        .expect("second submit");
    assert!(matches!(second, SubmissionOutcome::Blocked { .. }), "{second:?}");

    let task = assign.get(&task_id).await.expect("task");
    assert_eq!(task.status, TaskStatus::Blocked);
    assert_eq!(task.retry_count, 2);
    assert!(assign.current_task("dev-1").await.is_none());
}

#[tokio::test]
async fn accepted_output_completes_the_task() {
    let (assign, validator, task_id) = held_task(Some(summary_schema())).await;
    let output = json!({ "summary": "done", "files_changed": 3 });

    let outcome = validator.submit(&task_id, "dev-1", &output).await.expect("submit");
    let SubmissionOutcome::Accepted { output: stored } = outcome else {
        panic!("expected acceptance, got {outcome:?}");
    };
    assert_eq!(stored.data, Some(output));
    assert_eq!(stored.session_name, "dev-1");

    let task = assign.get(&task_id).await.expect("task");
    assert_eq!(task.status, TaskStatus::Done);
    assert!(task.completed_at.is_some());
    let workload = assign.workload("dev-1").await.expect("workload");
    assert_eq!(workload.completed_total, 1);
    assert_eq!(workload.current_tasks, 0);
}

#[tokio::test]
async fn tasks_without_schema_accept_any_value() {
    let (_assign, validator, task_id) = held_task(None).await;
    let outcome = validator
        .submit(&task_id, "dev-1", &Value::String("free text".into()))
        .await
        .expect("submit");
    assert!(matches!(outcome, SubmissionOutcome::Accepted { .. }));
}

#[tokio::test]
async fn submissions_from_other_sessions_are_refused() {
    let (_assign, validator, task_id) = held_task(None).await;
    let err = validator
        .submit(&task_id, "dev-2", &json!({}))
        .await
        .expect_err("not the holder");
    assert!(matches!(err, AppError::InvalidTransition(_)), "{err:?}");

    let err = validator
        .submit("missing", "dev-1", &json!({}))
        .await
        .expect_err("unknown task");
    assert!(matches!(err, AppError::NotFound(_)), "{err:?}");
}

#[tokio::test]
async fn unreadable_deliverable_counts_as_a_failure() {
    let (assign, validator, task_id) = held_task(Some(summary_schema())).await;
    let outcome = validator
        .reject(&task_id, vec!["cannot read out.json: not found".into()])
        .await
        .expect("reject");
    assert!(matches!(outcome, SubmissionOutcome::Rejected { retry_count: 1, .. }));
    assert_eq!(assign.get(&task_id).await.expect("task").retry_count, 1);
}

#[test]
fn outcome_serializes_with_status_tag() {
    let value = serde_json::to_value(SubmissionOutcome::Blocked {
        errors: vec!["e".into()],
    })
    .expect("serialize");
    assert_eq!(value, json!({ "status": "blocked", "errors": ["e"] }));
}

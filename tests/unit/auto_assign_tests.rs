//! Task queue and assignment tests.

use std::collections::HashSet;
use std::sync::Arc;

use agent_shepherd::models::task::{NewTask, TaskPriority, TaskStatus};
use agent_shepherd::models::validation::ValidatedOutput;
use agent_shepherd::orchestrator::auto_assign::{AutoAssignService, ClaimOutcome, FailureDisposition};
use agent_shepherd::persistence::{MemoryStore, SharedStore};
use agent_shepherd::AppError;
use chrono::Utc;

fn new_task(project: &str, title: &str, priority: TaskPriority) -> NewTask {
    NewTask {
        queue_key: project.into(),
        title: title.into(),
        priority,
        ..NewTask::default()
    }
}

fn service() -> (SharedStore, AutoAssignService) {
    let store: SharedStore = Arc::new(MemoryStore::new());
    let assign = AutoAssignService::new(Arc::clone(&store), 2);
    (store, assign)
}

#[tokio::test]
async fn higher_priority_first_then_fifo() {
    let (_store, assign) = service();
    let low = assign.enqueue(new_task("web", "low", TaskPriority::Low)).await.expect("low");
    let first = assign.enqueue(new_task("web", "n1", TaskPriority::Normal)).await.expect("n1");
    let second = assign.enqueue(new_task("web", "n2", TaskPriority::Normal)).await.expect("n2");
    let urgent = assign.enqueue(new_task("web", "hi", TaskPriority::Critical)).await.expect("hi");

    let mut order = Vec::new();
    for session in ["a", "b", "c", "d"] {
        let task = assign
            .assign_next(session, "dev", "web")
            .await
            .expect("assign")
            .expect("candidate");
        order.push(task.id);
    }
    assert_eq!(order, [urgent.id, first.id, second.id, low.id]);
    assert!(assign.assign_next("e", "dev", "web").await.expect("assign").is_none());
}

#[tokio::test]
async fn one_task_per_agent() {
    let (_store, assign) = service();
    let a = assign.enqueue(new_task("web", "a", TaskPriority::Normal)).await.expect("a");
    let b = assign.enqueue(new_task("web", "b", TaskPriority::Normal)).await.expect("b");

    assert!(matches!(
        assign.claim(&a.id, "dev-1").await.expect("claim"),
        ClaimOutcome::Claimed(_)
    ));
    assert_eq!(assign.claim(&b.id, "dev-1").await.expect("claim"), ClaimOutcome::AgentBusy);
    assert!(assign.next_candidate("dev-1", "dev", "web").await.is_none());
    assert!(assign.assign_next("dev-1", "dev", "web").await.expect("assign").is_none());
    assert_eq!(assign.current_task("dev-1").await.map(|t| t.id), Some(a.id));
}

#[tokio::test]
async fn concurrent_claims_have_a_single_winner() {
    let (_store, assign) = service();
    let assign = Arc::new(assign);
    let task = assign.enqueue(new_task("web", "only", TaskPriority::Normal)).await.expect("task");

    let mut handles = Vec::new();
    for n in 0..8 {
        let assign = Arc::clone(&assign);
        let id = task.id.clone();
        handles.push(tokio::spawn(async move {
            assign.claim(&id, &format!("dev-{n}")).await.expect("claim")
        }));
    }
    let mut winners = 0;
    for handle in handles {
        match handle.await.expect("join") {
            ClaimOutcome::Claimed(_) => winners += 1,
            ClaimOutcome::Lost => {}
            ClaimOutcome::AgentBusy => panic!("no agent held a task"),
        }
    }
    assert_eq!(winners, 1);
    let task = assign.get(&task.id).await.expect("task");
    assert_eq!(task.status, TaskStatus::InProgress);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_session_racing_for_work_holds_a_single_task() {
    let (_store, assign) = service();
    let assign = Arc::new(assign);
    let mut ids = Vec::new();
    for n in 0..6 {
        let task = assign
            .enqueue(new_task("web", &format!("t{n}"), TaskPriority::Normal))
            .await
            .expect("enqueue");
        ids.push(task.id);
    }

    let mut claims = Vec::new();
    for id in ids.clone() {
        let assign = Arc::clone(&assign);
        claims.push(tokio::spawn(async move {
            assign.claim(&id, "dev-1").await.expect("claim")
        }));
    }
    let mut assigns = Vec::new();
    for _ in 0..6 {
        let assign = Arc::clone(&assign);
        assigns.push(tokio::spawn(async move {
            assign.assign_next("dev-1", "dev", "web").await.expect("assign")
        }));
    }

    let mut held = Vec::new();
    for handle in claims {
        match handle.await.expect("join") {
            ClaimOutcome::Claimed(task) => held.push(task.id),
            ClaimOutcome::AgentBusy | ClaimOutcome::Lost => {}
        }
    }
    for handle in assigns {
        if let Some(task) = handle.await.expect("join") {
            held.push(task.id);
        }
    }
    assert_eq!(held.len(), 1, "{held:?}");

    let mut in_progress = 0;
    for id in &ids {
        let task = assign.get(id).await.expect("task");
        if task.status == TaskStatus::InProgress {
            in_progress += 1;
            assert_eq!(task.assigned_session_name.as_deref(), Some("dev-1"));
        }
    }
    assert_eq!(in_progress, 1);
    assert_eq!(assign.current_task("dev-1").await.map(|t| t.id), held.pop());
}

#[tokio::test]
async fn role_and_project_filter_candidates() {
    let (_store, assign) = service();
    let mut qa_only = new_task("web", "verify", TaskPriority::High);
    qa_only.required_role = Some("qa".into());
    let qa_task = assign.enqueue(qa_only).await.expect("qa task");
    assign.enqueue(new_task("api", "other project", TaskPriority::Critical)).await.expect("api");

    assert!(assign.next_candidate("dev-1", "dev", "web").await.is_none());
    let picked = assign.next_candidate("qa-1", "qa", "web").await.expect("qa candidate");
    assert_eq!(picked.id, qa_task.id);
}

#[tokio::test]
async fn release_and_reopen_return_tasks_to_the_queue() {
    let (_store, assign) = service();
    let task = assign.enqueue(new_task("web", "t", TaskPriority::Normal)).await.expect("task");
    assign.register_agent("dev-1", "dev").await.expect("register");
    assign.assign_next("dev-1", "dev", "web").await.expect("assign");
    assert_eq!(assign.workload("dev-1").await.expect("workload").current_tasks, 1);

    let released = assign.release(&task.id).await.expect("release");
    assert_eq!(released.status, TaskStatus::Open);
    assert!(released.assigned_session_name.is_none());
    assert_eq!(assign.workload("dev-1").await.expect("workload").current_tasks, 0);
    assert!(matches!(
        assign.release(&task.id).await,
        Err(AppError::InvalidTransition(_))
    ));

    assign.assign_next("dev-1", "dev", "web").await.expect("assign again");
    assert!(matches!(
        assign.record_validation_failure(&task.id, vec!["e1".into()]).await.expect("fail 1"),
        FailureDisposition::Retry { retry_count: 1, remaining: 1 }
    ));
    assert_eq!(
        assign.record_validation_failure(&task.id, vec!["e2".into()]).await.expect("fail 2"),
        FailureDisposition::Blocked
    );
    assert!(matches!(
        assign.record_validation_failure(&task.id, vec![]).await,
        Err(AppError::InvalidTransition(_))
    ));

    let reopened = assign.reopen(&task.id).await.expect("reopen");
    assert_eq!(reopened.status, TaskStatus::Open);
    assert_eq!(reopened.retry_count, 0);
    assert!(reopened.feedback.is_empty());
    assert!(matches!(
        assign.reopen(&task.id).await,
        Err(AppError::InvalidTransition(_))
    ));
}

#[tokio::test]
async fn orphaned_tasks_are_released() {
    let (_store, assign) = service();
    let kept = assign.enqueue(new_task("web", "kept", TaskPriority::Normal)).await.expect("kept");
    let lost = assign.enqueue(new_task("web", "lost", TaskPriority::Normal)).await.expect("lost");
    assign.claim(&kept.id, "live-1").await.expect("claim kept");
    assign.claim(&lost.id, "dead-1").await.expect("claim lost");

    let live: HashSet<String> = ["live-1".to_owned()].into_iter().collect();
    let released = assign.release_orphans(&live).await.expect("release orphans");
    assert_eq!(released.len(), 1);
    assert_eq!(released[0].id, lost.id);
    assert_eq!(assign.get(&kept.id).await.expect("kept").status, TaskStatus::InProgress);
}

#[tokio::test]
async fn load_recomputes_current_tasks() {
    let (store, assign) = service();
    assign.register_agent("dev-1", "dev").await.expect("register dev-1");
    assign.register_agent("dev-2", "dev").await.expect("register dev-2");
    let task = assign.enqueue(new_task("web", "t", TaskPriority::Normal)).await.expect("task");
    assign.claim(&task.id, "dev-1").await.expect("claim");

    let restored = AutoAssignService::new(store, 2);
    restored.load().await.expect("load");
    assert_eq!(restored.workload("dev-1").await.expect("dev-1").current_tasks, 1);
    assert_eq!(restored.workload("dev-2").await.expect("dev-2").current_tasks, 0);
    assert_eq!(restored.current_task("dev-1").await.map(|t| t.id), Some(task.id));

    let next = restored.enqueue(new_task("web", "after reload", TaskPriority::Normal)).await.expect("enqueue");
    assert_eq!(next.enqueue_seq, 1);
}

#[tokio::test]
async fn iterations_feed_the_workload_average() {
    let (_store, assign) = service();
    let output = ValidatedOutput {
        data: None,
        produced_at: Utc::now(),
        session_name: "dev-1".into(),
    };
    assign.register_agent("dev-1", "dev").await.expect("register");
    let task = assign.enqueue(new_task("web", "t", TaskPriority::Normal)).await.expect("task");
    assign.assign_next("dev-1", "dev", "web").await.expect("assign");
    assert_eq!(assign.record_iteration(&task.id).await.expect("iteration"), 1);
    assert_eq!(assign.record_iteration(&task.id).await.expect("iteration"), 2);

    let done = assign.complete(&task.id, "dev-1", output).await.expect("complete");
    assert_eq!(done.status, TaskStatus::Done);
    let workload = assign.workload("dev-1").await.expect("workload");
    assert_eq!(workload.completed_today, 1);
    assert!((workload.average_iterations - 2.0).abs() < f64::EPSILON);
    assert!(matches!(
        assign.record_iteration(&task.id).await,
        Err(AppError::InvalidTransition(_))
    ));
}

#[tokio::test]
async fn empty_titles_are_rejected() {
    let (_store, assign) = service();
    let err = assign
        .enqueue(new_task("web", "  ", TaskPriority::Normal))
        .await
        .expect_err("empty title");
    assert!(matches!(err, AppError::InvalidInput(_)));
    assert!(assign.list_tasks().await.is_empty());
}

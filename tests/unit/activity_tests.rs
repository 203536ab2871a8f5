//! Activity tracker tests on paused tokio time.

use std::time::Duration;

use agent_shepherd::orchestrator::activity::{ActivityState, ActivityTracker};

#[tokio::test(start_paused = true)]
async fn idle_time_grows_until_next_activity() {
    let tracker = ActivityTracker::new();
    tracker.record_activity("dev-1");

    tokio::time::advance(Duration::from_secs(45)).await;
    assert_eq!(tracker.idle_time("dev-1"), Duration::from_secs(45));
    assert!(!tracker.is_idle_for("dev-1", Duration::from_secs(60)));

    tokio::time::advance(Duration::from_secs(15)).await;
    assert!(tracker.is_idle_for("dev-1", Duration::from_secs(60)));
    assert_eq!(
        tracker.activity_state("dev-1", Duration::from_secs(60)),
        ActivityState::Idle
    );

    tracker.record_activity("dev-1");
    assert_eq!(tracker.idle_time("dev-1"), Duration::ZERO);
    assert_eq!(
        tracker.activity_state("dev-1", Duration::from_secs(60)),
        ActivityState::Busy
    );
}

#[tokio::test(start_paused = true)]
async fn unseen_sessions_are_unknown_not_idle() {
    let tracker = ActivityTracker::new();
    assert_eq!(tracker.last_activity("ghost"), None);
    assert_eq!(tracker.idle_time("ghost"), Duration::MAX);
    assert!(!tracker.is_idle_for("ghost", Duration::from_secs(1)));
    assert_eq!(
        tracker.activity_state("ghost", Duration::from_secs(1)),
        ActivityState::Unknown
    );
}

#[tokio::test(start_paused = true)]
async fn sessions_are_tracked_independently() {
    let tracker = ActivityTracker::new();
    tracker.record_activity("dev-1");
    tokio::time::advance(Duration::from_secs(30)).await;
    tracker.record_activity("qa-1");

    assert_eq!(tracker.idle_time("dev-1"), Duration::from_secs(30));
    assert_eq!(tracker.idle_time("qa-1"), Duration::ZERO);

    let mut tracked = tracker.tracked();
    tracked.sort();
    assert_eq!(tracked, ["dev-1", "qa-1"]);
}

#[tokio::test(start_paused = true)]
async fn clearing_forgets_the_session() {
    let tracker = ActivityTracker::new();
    tracker.record_activity("dev-1");
    assert!(tracker.clear_session("dev-1"));
    assert!(!tracker.clear_session("dev-1"));
    assert_eq!(tracker.last_activity("dev-1"), None);
}

#[tokio::test(start_paused = true)]
async fn last_activity_never_moves_backwards() {
    let tracker = ActivityTracker::new();
    tracker.record_activity("dev-1");
    let first = tracker.last_activity("dev-1").expect("recorded");
    tracker.record_activity("dev-1");
    let second = tracker.last_activity("dev-1").expect("recorded");
    assert!(second >= first);
}

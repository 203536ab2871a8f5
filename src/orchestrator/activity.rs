//! Per-session activity timestamps and idle measurement.
//!
//! Timestamps come from [`tokio::time::Instant`], which is monotonic and can
//! be paused in tests. Wall-clock adjustments never change measured idle time.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

/// Busy/idle annotation for a running session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityState {
    /// No output for at least the threshold.
    Idle,
    /// Output seen within the threshold.
    Busy,
    /// Never recorded. Not idle.
    Unknown,
}

/// Tracks the last time each session produced output.
#[derive(Debug, Default)]
pub struct ActivityTracker {
    stamps: Mutex<HashMap<String, Instant>>,
}

impl ActivityTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn stamps(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.stamps.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stamp `name` as active now.
    pub fn record_activity(&self, name: &str) {
        let now = Instant::now();
        let mut stamps = self.stamps();
        match stamps.get_mut(name) {
            Some(last) if *last < now => *last = now,
            Some(_) => {}
            None => {
                stamps.insert(name.to_owned(), now);
            }
        }
    }

    /// Time since the last recorded activity; [`Duration::MAX`] when unseen.
    #[must_use]
    pub fn idle_time(&self, name: &str) -> Duration {
        self.last_activity(name)
            .map_or(Duration::MAX, |last| Instant::now().saturating_duration_since(last))
    }

    /// Whether `name` has been silent for at least `threshold`.
    ///
    /// Unseen sessions are unknown rather than idle and report `false`.
    #[must_use]
    pub fn is_idle_for(&self, name: &str, threshold: Duration) -> bool {
        self.last_activity(name)
            .is_some_and(|last| Instant::now().saturating_duration_since(last) >= threshold)
    }

    /// Instant of the last recorded activity.
    #[must_use]
    pub fn last_activity(&self, name: &str) -> Option<Instant> {
        self.stamps().get(name).copied()
    }

    /// Busy/idle annotation against `threshold`.
    #[must_use]
    pub fn activity_state(&self, name: &str, threshold: Duration) -> ActivityState {
        match self.last_activity(name) {
            None => ActivityState::Unknown,
            Some(last) if Instant::now().saturating_duration_since(last) >= threshold => {
                ActivityState::Idle
            }
            Some(_) => ActivityState::Busy,
        }
    }

    /// Stop tracking `name`. Returns whether it was tracked.
    pub fn clear_session(&self, name: &str) -> bool {
        self.stamps().remove(name).is_some()
    }

    /// Names currently tracked.
    #[must_use]
    pub fn tracked(&self) -> Vec<String> {
        self.stamps().keys().cloned().collect()
    }
}

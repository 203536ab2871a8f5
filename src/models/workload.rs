//! Per-agent workload aggregates derived from task transitions.

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Workload summary for one agent session.
///
/// Derived from task transitions; `current_tasks` is recomputed from the
/// task index on load rather than trusted from disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentWorkload {
    /// Session the aggregate belongs to.
    pub session_name: String,
    /// Role of the agent.
    pub role: String,
    /// In-progress tasks held; 0 or 1.
    pub current_tasks: u32,
    /// Tasks completed on `day`.
    pub completed_today: u32,
    /// Tasks completed since tracking began.
    pub completed_total: u32,
    /// Running mean of iterations per completed task.
    pub average_iterations: f64,
    /// UTC date `completed_today` refers to.
    pub day: NaiveDate,
}

impl AgentWorkload {
    /// Fresh aggregate for a session.
    #[must_use]
    pub fn new(session_name: String, role: String) -> Self {
        Self {
            session_name,
            role,
            current_tasks: 0,
            completed_today: 0,
            completed_total: 0,
            average_iterations: 0.0,
            day: Utc::now().date_naive(),
        }
    }

    /// Fold one completion into the aggregate.
    pub fn record_completion(&mut self, iterations: u32, today: NaiveDate) {
        if self.day != today {
            self.day = today;
            self.completed_today = 0;
        }
        self.completed_today += 1;
        self.completed_total += 1;
        let n = f64::from(self.completed_total);
        self.average_iterations += (f64::from(iterations) - self.average_iterations) / n;
    }
}

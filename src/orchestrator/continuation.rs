//! Output classification and the action policy built on top of it.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::backend::ansi::strip_ansi_str;
use crate::config::DetectionConfig;

use super::patterns::{CompletionKind, ErrorKind, IdleKind, PatternCatalog, PatternCategory};

/// Classification of an output window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    /// The first category, in priority order, with a matching rule.
    Matched(PatternCategory),
    /// Nothing matched. Neither idle nor actionable.
    Unknown,
}

impl Signal {
    /// Matched category, if any.
    #[must_use]
    pub fn category(self) -> Option<PatternCategory> {
        match self {
            Self::Matched(category) => Some(category),
            Self::Unknown => None,
        }
    }
}

/// What the control loop should do about a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    /// Something is failing; send a targeted retry nudge or escalate.
    Escalate(ErrorKind),
    /// Work looks finished; validate the deliverable before completing.
    Validate(CompletionKind),
    /// Idle past the threshold and outside the cool-down.
    Nudge(IdleKind),
    /// Nothing to do right now.
    Wait,
}

/// Timing rules for nudges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NudgePolicy {
    /// Silence required before an idle session may be nudged.
    pub idle_threshold: Duration,
    /// Minimum spacing between nudges to one session.
    pub cooldown: Duration,
}

impl NudgePolicy {
    /// Policy from the detection settings.
    #[must_use]
    pub fn from_config(config: &DetectionConfig) -> Self {
        Self {
            idle_threshold: config.idle_threshold(),
            cooldown: config.nudge_cooldown(),
        }
    }

    /// Whether a new nudge is allowed at `now`.
    #[must_use]
    pub fn cooldown_elapsed(&self, last_nudge: Option<Instant>, now: Instant) -> bool {
        last_nudge.is_none_or(|last| now.saturating_duration_since(last) >= self.cooldown)
    }
}

/// Classifies session output against a compiled pattern catalog.
#[derive(Debug, Clone)]
pub struct ContinuationDetector {
    catalog: Arc<PatternCatalog>,
}

impl ContinuationDetector {
    /// Detector backed by `catalog`.
    #[must_use]
    pub fn new(catalog: Arc<PatternCatalog>) -> Self {
        Self { catalog }
    }

    /// Catalog the detector matches against.
    #[must_use]
    pub fn catalog(&self) -> &PatternCatalog {
        &self.catalog
    }

    /// Classify a window of output. Escape sequences are stripped first.
    #[must_use]
    pub fn classify(&self, window: &str) -> Signal {
        let text = strip_ansi_str(window);
        self.catalog
            .find(&text)
            .map_or(Signal::Unknown, Signal::Matched)
    }

    /// Decide the action for a classified window.
    ///
    /// Errors and completions are reported regardless of timing; idle
    /// categories only produce a nudge once the session has been silent past
    /// the threshold and the cool-down since `last_nudge` has elapsed.
    #[must_use]
    pub fn recommend_action(
        signal: Signal,
        idle: Duration,
        policy: &NudgePolicy,
        last_nudge: Option<Instant>,
        now: Instant,
    ) -> RecommendedAction {
        match signal {
            Signal::Matched(PatternCategory::Error(kind)) => RecommendedAction::Escalate(kind),
            Signal::Matched(PatternCategory::Completion(kind)) => RecommendedAction::Validate(kind),
            Signal::Matched(PatternCategory::Idle(kind))
                if idle >= policy.idle_threshold && policy.cooldown_elapsed(last_nudge, now) =>
            {
                RecommendedAction::Nudge(kind)
            }
            Signal::Matched(PatternCategory::Idle(_)) | Signal::Unknown => RecommendedAction::Wait,
        }
    }
}

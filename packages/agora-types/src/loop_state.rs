//! Loop lifecycle state shared by the agent loop and artifact loop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The six states of the loop state machine (spec §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Starting,
    Running,
    Sleeping,
    Paused,
    Stopping,
    Stopped,
}

impl LoopState {
    /// Whether the loop is doing anything at all -- used by loop managers
    /// to compute `running_count`.
    pub fn is_active(self) -> bool {
        !matches!(self, LoopState::Stopped)
    }
}

/// The reason a sleeping loop should wake.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WakeCondition {
    Time { at: DateTime<Utc> },
    Event { name: String },
    Resource { name: String, threshold: f64 },
}

impl WakeCondition {
    /// Evaluate against the current time; event/resource conditions are
    /// evaluated by the loop driver itself, which has access to the event
    /// bus and ledger respectively, so this only resolves the time case.
    pub fn time_elapsed(&self, now: DateTime<Utc>) -> bool {
        matches!(self, WakeCondition::Time { at } if now >= *at)
    }
}

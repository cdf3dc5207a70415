//! Supervisor bookkeeping carried per agent (spec §3, §4.10).

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The classification the supervisor assigns to a dead or paused loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeathType {
    /// Runtime error or transient failure; restart under backoff.
    Dumb,
    /// Economic failure (scrip exhausted); never restarted.
    Smart,
    /// Loop asked to stop on its own terms; never restarted.
    Voluntary,
    /// Classification could not determine a cause; treated like Dumb.
    Unknown,
}

/// Per-agent restart bookkeeping maintained by the supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartState {
    pub restart_count: u32,
    pub recent_restarts: VecDeque<DateTime<Utc>>,
    pub current_backoff: f64,
    pub last_death_type: Option<DeathType>,
    pub permanently_dead: bool,
}

impl Default for RestartState {
    fn default() -> Self {
        Self {
            restart_count: 0,
            recent_restarts: VecDeque::new(),
            current_backoff: 0.0,
            last_death_type: None,
            permanently_dead: false,
        }
    }
}

impl RestartState {
    /// Drop restart timestamps older than one hour, matching the
    /// `max_restarts_per_hour` window in the restart policy.
    pub fn prune_older_than(&mut self, now: DateTime<Utc>, window: chrono::Duration) {
        let cutoff = now - window;
        while let Some(front) = self.recent_restarts.front() {
            if *front < cutoff {
                self.recent_restarts.pop_front();
            } else {
                break;
            }
        }
    }
}

//! A single rate-limiter usage event (spec §3, §4.3).

use serde::{Deserialize, Serialize};

/// `timestamp` is seconds since the Unix epoch as returned by the injected
/// clock (real or virtual), matching `rate_tracker.py`'s `UsageRecord`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UsageRecord {
    pub timestamp: f64,
    pub amount: f64,
}

impl UsageRecord {
    pub fn new(timestamp: f64, amount: f64) -> Self {
        Self { timestamp, amount }
    }

    pub fn expired(&self, now: f64, window_seconds: f64) -> bool {
        self.timestamp < now - window_seconds
    }
}

//! Rolling-window rate limiter (spec §4.3), ported directly from
//! `world/rate_tracker.py`'s `RateTracker`.
//!
//! Time-based, independent of any simulation tick: usage is tracked per
//! `(principal, resource)` pair within a configurable window, pruned
//! lazily on every access.

pub mod clock;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use agora_types::UsageRecord;
use clock::{Clock, RealClock};
use tokio::sync::Mutex;

struct Usage {
    // resource -> principal -> records
    records: HashMap<String, HashMap<String, VecDeque<UsageRecord>>>,
    limits: HashMap<String, f64>,
}

/// A per-resource rolling-window limiter shared across all loops.
pub struct RateTracker {
    window_seconds: f64,
    clock: Arc<dyn Clock>,
    usage: Mutex<Usage>,
}

impl RateTracker {
    pub fn new(window_seconds: f64) -> Self {
        Self::with_clock(window_seconds, Arc::new(RealClock))
    }

    pub fn with_clock(window_seconds: f64, clock: Arc<dyn Clock>) -> Self {
        Self {
            window_seconds,
            clock,
            usage: Mutex::new(Usage {
                records: HashMap::new(),
                limits: HashMap::new(),
            }),
        }
    }

    /// Set the rate limit for a resource. `max_per_window` must be
    /// non-negative; unconfigured resources behave as unlimited.
    pub async fn configure_limit(&self, resource: &str, max_per_window: f64) -> Result<(), String> {
        if max_per_window < 0.0 {
            return Err(format!("max_per_window must be non-negative, got {max_per_window}"));
        }
        let mut usage = self.usage.lock().await;
        usage.limits.insert(resource.to_string(), max_per_window);
        usage.records.entry(resource.to_string()).or_default();
        Ok(())
    }

    pub async fn get_limit(&self, resource: &str) -> f64 {
        self.usage
            .lock()
            .await
            .limits
            .get(resource)
            .copied()
            .unwrap_or(f64::INFINITY)
    }

    fn clean_old_records_locked(usage: &mut Usage, resource: &str, principal: &str, now: f64, window: f64) {
        if let Some(by_principal) = usage.records.get_mut(resource) {
            if let Some(records) = by_principal.get_mut(principal) {
                while let Some(front) = records.front() {
                    if front.expired(now, window) {
                        records.pop_front();
                    } else {
                        break;
                    }
                }
            }
        }
    }

    pub async fn get_usage(&self, principal: &str, resource: &str) -> f64 {
        let now = self.clock.time();
        let mut usage = self.usage.lock().await;
        Self::clean_old_records_locked(&mut usage, resource, principal, now, self.window_seconds);
        usage
            .records
            .get(resource)
            .and_then(|m| m.get(principal))
            .map(|records| records.iter().map(|r| r.amount).sum())
            .unwrap_or(0.0)
    }

    pub async fn get_remaining(&self, principal: &str, resource: &str) -> f64 {
        let limit = self.get_limit(resource).await;
        let usage = self.get_usage(principal, resource).await;
        (limit - usage).max(0.0)
    }

    pub async fn has_capacity(&self, principal: &str, resource: &str, amount: f64) -> bool {
        if amount < 0.0 {
            return false;
        }
        if amount == 0.0 {
            return true;
        }
        self.get_remaining(principal, resource).await >= amount
    }

    /// Atomic check-and-append. Returns `false` without recording if
    /// capacity is insufficient or `amount < 0`. `amount == 0` always
    /// succeeds without recording.
    ///
    /// The capacity check and the append happen under a single held lock
    /// on `usage` -- never call the separately-locking `has_capacity`
    /// here, or two concurrent callers can both observe capacity in the
    /// gap between check and append and both push.
    pub async fn consume(&self, principal: &str, resource: &str, amount: f64) -> bool {
        if amount < 0.0 {
            return false;
        }
        if amount == 0.0 {
            return true;
        }
        let now = self.clock.time();
        let mut usage = self.usage.lock().await;
        Self::clean_old_records_locked(&mut usage, resource, principal, now, self.window_seconds);
        let limit = usage.limits.get(resource).copied().unwrap_or(f64::INFINITY);
        let current: f64 = usage
            .records
            .get(resource)
            .and_then(|m| m.get(principal))
            .map(|records| records.iter().map(|r| r.amount).sum())
            .unwrap_or(0.0);
        if current + amount > limit {
            return false;
        }
        usage
            .records
            .entry(resource.to_string())
            .or_default()
            .entry(principal.to_string())
            .or_default()
            .push_back(UsageRecord::new(now, amount));
        true
    }

    /// FIFO-order lower-bound estimate of seconds until enough records age
    /// out to admit `amount`. Returns `0.0` if capacity is already there.
    pub async fn time_until_capacity(&self, principal: &str, resource: &str, amount: f64) -> f64 {
        if amount <= 0.0 {
            return 0.0;
        }
        if self.has_capacity(principal, resource, amount).await {
            return 0.0;
        }

        let now = self.clock.time();
        let mut usage = self.usage.lock().await;
        Self::clean_old_records_locked(&mut usage, resource, principal, now, self.window_seconds);

        let limit = usage.limits.get(resource).copied().unwrap_or(f64::INFINITY);
        let records = match usage.records.get(resource).and_then(|m| m.get(principal)) {
            Some(r) if !r.is_empty() => r,
            _ => return 0.0,
        };

        let current_usage: f64 = records.iter().map(|r| r.amount).sum();
        let needed_to_expire = current_usage - (limit - amount);
        if needed_to_expire <= 0.0 {
            return 0.0;
        }

        let mut accumulated = 0.0;
        for record in records.iter() {
            accumulated += record.amount;
            if accumulated >= needed_to_expire {
                let expiry = record.timestamp + self.window_seconds;
                return (expiry - now).max(0.0);
            }
        }
        let last = records.back().expect("checked non-empty above");
        (last.timestamp + self.window_seconds - now).max(0.0)
    }

    /// Cooperative wait: polls `time_until_capacity` bounded by
    /// `poll_interval`, then performs a final atomic `consume`. Returns
    /// `false` on timeout without consuming.
    pub async fn wait_for_capacity(
        &self,
        principal: &str,
        resource: &str,
        amount: f64,
        timeout: Option<f64>,
        poll_interval: f64,
    ) -> bool {
        if amount <= 0.0 {
            return true;
        }

        let start = self.clock.time();
        while !self.has_capacity(principal, resource, amount).await {
            if let Some(timeout) = timeout {
                if self.clock.time() - start >= timeout {
                    return false;
                }
            }
            let wait_estimate = self.time_until_capacity(principal, resource, amount).await;
            let sleep_time = if wait_estimate > 0.0 {
                wait_estimate.min(poll_interval)
            } else {
                poll_interval
            };
            self.clock.sleep(sleep_time).await;
        }
        self.consume(principal, resource, amount).await
    }

    /// Selective reset: both `None` clears everything; either alone
    /// clears all entries for that dimension; both together clears one
    /// `(principal, resource)` pair.
    pub async fn reset(&self, principal: Option<&str>, resource: Option<&str>) {
        let mut usage = self.usage.lock().await;
        match (resource, principal) {
            (Some(resource), Some(principal)) => {
                if let Some(by_principal) = usage.records.get_mut(resource) {
                    if let Some(records) = by_principal.get_mut(principal) {
                        records.clear();
                    }
                }
            }
            (Some(resource), None) => {
                if let Some(by_principal) = usage.records.get_mut(resource) {
                    by_principal.clear();
                }
            }
            (None, Some(principal)) => {
                for by_principal in usage.records.values_mut() {
                    if let Some(records) = by_principal.get_mut(principal) {
                        records.clear();
                    }
                }
            }
            (None, None) => {
                for by_principal in usage.records.values_mut() {
                    by_principal.clear();
                }
            }
        }
    }

    /// Snapshot of all current non-zero usage: resource -> principal -> amount.
    pub async fn get_all_usage(&self) -> HashMap<String, HashMap<String, f64>> {
        let now = self.clock.time();
        let mut usage = self.usage.lock().await;
        let resources: Vec<String> = usage.records.keys().cloned().collect();
        let mut out = HashMap::new();
        for resource in resources {
            let principals: Vec<String> = usage.records[&resource].keys().cloned().collect();
            let mut per_principal = HashMap::new();
            for principal in principals {
                Self::clean_old_records_locked(&mut usage, &resource, &principal, now, self.window_seconds);
                let total: f64 = usage.records[&resource][&principal].iter().map(|r| r.amount).sum();
                if total > 0.0 {
                    per_principal.insert(principal, total);
                }
            }
            if !per_principal.is_empty() {
                out.insert(resource, per_principal);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clock::VirtualClock;

    #[tokio::test]
    async fn scenario_b_rolling_window_admits_after_expiry() {
        let clock = Arc::new(VirtualClock::new(0.0));
        let tracker = RateTracker::with_clock(60.0, clock.clone());
        tracker.configure_limit("llm_calls", 10.0).await.unwrap();

        for _ in 0..10 {
            assert!(tracker.consume("a", "llm_calls", 1.0).await);
        }
        assert!(!tracker.has_capacity("a", "llm_calls", 1.0).await);

        clock.advance(61.0);

        assert_eq!(tracker.get_remaining("a", "llm_calls").await, 10.0);
        assert!(tracker.consume("a", "llm_calls", 1.0).await);
    }

    #[tokio::test]
    async fn consume_is_atomic_at_the_boundary() {
        let tracker = RateTracker::with_clock(60.0, Arc::new(VirtualClock::new(0.0)));
        tracker.configure_limit("tokens", 5.0).await.unwrap();

        assert!(tracker.consume("a", "tokens", 5.0).await);
        assert!(!tracker.consume("a", "tokens", 1.0).await);
    }

    #[tokio::test]
    async fn consume_is_atomic_under_concurrent_interleaving() {
        let tracker = Arc::new(RateTracker::with_clock(60.0, Arc::new(VirtualClock::new(0.0))));
        tracker.configure_limit("tokens", 5.0).await.unwrap();

        let a = tracker.clone();
        let b = tracker.clone();
        let (first, second) = tokio::join!(
            a.consume("x", "tokens", 3.0),
            b.consume("x", "tokens", 3.0),
        );
        assert!(first ^ second, "exactly one of two overlapping consumes whose sum exceeds the limit must succeed");
        assert_eq!(tracker.get_usage("x", "tokens").await, 3.0);
    }

    #[tokio::test]
    async fn unconfigured_resource_is_unlimited() {
        let tracker = RateTracker::new(60.0);
        assert!(tracker.has_capacity("a", "anything", 1_000_000.0).await);
    }

    #[tokio::test]
    async fn wait_for_capacity_times_out_without_consuming() {
        let clock = Arc::new(VirtualClock::new(0.0));
        let tracker = RateTracker::with_clock(60.0, clock.clone());
        tracker.configure_limit("x", 1.0).await.unwrap();
        assert!(tracker.consume("a", "x", 1.0).await);

        let acquired = tracker.wait_for_capacity("a", "x", 1.0, Some(0.5), 0.1).await;
        assert!(!acquired);
    }

    #[tokio::test]
    async fn zero_amount_always_succeeds_without_recording() {
        let tracker = RateTracker::new(60.0);
        assert!(tracker.consume("a", "x", 0.0).await);
        assert_eq!(tracker.get_usage("a", "x").await, 0.0);
    }
}

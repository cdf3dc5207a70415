//! Injectable clock, mirroring `rate_tracker.py`'s `ClockProtocol`.
//!
//! Production code uses [`RealClock`]; tests use [`VirtualClock`] so that
//! a 60-second rolling window can be exercised without an actual 60-second
//! wait (spec seed scenario B).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

#[async_trait]
pub trait Clock: Send + Sync {
    fn time(&self) -> f64;
    async fn sleep(&self, seconds: f64);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RealClock;

#[async_trait]
impl Clock for RealClock {
    fn time(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_secs_f64()
    }

    async fn sleep(&self, seconds: f64) {
        if seconds > 0.0 {
            tokio::time::sleep(std::time::Duration::from_secs_f64(seconds)).await;
        }
    }
}

/// A clock whose `sleep` advances its own `time()` instead of actually
/// waiting, so tests can simulate arbitrary elapsed time deterministically.
#[derive(Debug, Clone)]
pub struct VirtualClock {
    // stored as whole nanoseconds for an atomic, lock-free clock
    nanos: Arc<AtomicU64>,
}

impl VirtualClock {
    pub fn new(start_seconds: f64) -> Self {
        Self {
            nanos: Arc::new(AtomicU64::new((start_seconds * 1e9) as u64)),
        }
    }

    pub fn advance(&self, seconds: f64) {
        self.nanos.fetch_add((seconds * 1e9) as u64, Ordering::SeqCst);
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new(0.0)
    }
}

#[async_trait]
impl Clock for VirtualClock {
    fn time(&self) -> f64 {
        self.nanos.load(Ordering::SeqCst) as f64 / 1e9
    }

    async fn sleep(&self, seconds: f64) {
        self.advance(seconds);
    }
}

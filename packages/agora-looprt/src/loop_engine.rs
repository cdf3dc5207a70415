//! The loop state machine (spec §4.8): six states, shared between agent
//! and artifact loops, driven by a single spawned task per loop.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agora_ratelimit::RateTracker;
use agora_types::{LoopState, WakeCondition};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;

use crate::behavior::AgentBehavior;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceExhaustionPolicy {
    Skip,
    Block,
}

#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub min_loop_delay: f64,
    pub max_loop_delay: f64,
    pub resource_check_interval: f64,
    pub max_consecutive_errors: u32,
    pub resources_to_check: Vec<String>,
    pub resource_exhaustion_policy: ResourceExhaustionPolicy,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            min_loop_delay: 0.1,
            max_loop_delay: 10.0,
            resource_check_interval: 1.0,
            max_consecutive_errors: 5,
            resources_to_check: Vec::new(),
            resource_exhaustion_policy: ResourceExhaustionPolicy::Skip,
        }
    }
}

/// A single long-lived cooperative loop. Shared (`Arc`) because both the
/// [`crate::manager::LoopManager`] and its own spawned task hold a handle
/// to it; the driver task is the only writer of `state` during normal
/// iteration, but `stop()`/`wake()` are called from outside it, hence the
/// `RwLock`/`Notify` rather than a plain cell.
pub struct Loop {
    pub id: String,
    principal_id: String,
    behavior: Arc<dyn AgentBehavior>,
    config: LoopConfig,
    rate_limiter: Option<Arc<RateTracker>>,

    state: RwLock<LoopState>,
    consecutive_errors: AtomicU32,
    iteration_count: AtomicU64,
    current_delay: Mutex<f64>,
    wake_condition: Mutex<Option<WakeCondition>>,
    crash_reason: Mutex<Option<String>>,
    voluntary_shutdown: AtomicBool,
    stop_requested: AtomicBool,

    wake_signal: Arc<Notify>,
    stop_signal: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Loop {
    pub fn new(
        id: impl Into<String>,
        principal_id: impl Into<String>,
        behavior: Arc<dyn AgentBehavior>,
        config: LoopConfig,
        rate_limiter: Option<Arc<RateTracker>>,
    ) -> Arc<Self> {
        let min_delay = config.min_loop_delay;
        Arc::new(Self {
            id: id.into(),
            principal_id: principal_id.into(),
            behavior,
            config,
            rate_limiter,
            state: RwLock::new(LoopState::Stopped),
            consecutive_errors: AtomicU32::new(0),
            iteration_count: AtomicU64::new(0),
            current_delay: Mutex::new(min_delay),
            wake_condition: Mutex::new(None),
            crash_reason: Mutex::new(None),
            voluntary_shutdown: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            wake_signal: Arc::new(Notify::new()),
            stop_signal: Arc::new(Notify::new()),
            task: Mutex::new(None),
        })
    }

    pub async fn state(&self) -> LoopState {
        *self.state.read().await
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors.load(Ordering::SeqCst)
    }

    pub fn iteration_count(&self) -> u64 {
        self.iteration_count.load(Ordering::SeqCst)
    }

    pub async fn crash_reason(&self) -> Option<String> {
        self.crash_reason.lock().await.clone()
    }

    pub fn voluntary_shutdown(&self) -> bool {
        self.voluntary_shutdown.load(Ordering::SeqCst)
    }

    async fn set_state(&self, new: LoopState) {
        *self.state.write().await = new;
    }

    /// Idempotent: a warning is logged, not an error, if already running
    /// (spec §4.8).
    pub async fn start(self: &Arc<Self>) {
        let current = self.state().await;
        if current != LoopState::Stopped {
            tracing::warn!(loop_id = %self.id, ?current, "start() called on an already-running loop");
            return;
        }
        self.stop_requested.store(false, Ordering::SeqCst);
        self.set_state(LoopState::Starting).await;

        let this = self.clone();
        let handle = tokio::spawn(async move { this.drive().await });
        *self.task.lock().await = Some(handle);
    }

    /// Atomically enters SLEEPING with the given wake condition.
    pub async fn sleep(&self, condition: WakeCondition) {
        *self.wake_condition.lock().await = Some(condition);
        self.set_state(LoopState::Sleeping).await;
    }

    /// Immediately wakes a sleeping loop.
    pub async fn wake(&self) {
        *self.wake_condition.lock().await = None;
        if self.state().await == LoopState::Sleeping {
            self.set_state(LoopState::Running).await;
        }
        self.wake_signal.notify_waiters();
    }

    pub fn request_voluntary_shutdown(&self) {
        self.voluntary_shutdown.store(true, Ordering::SeqCst);
    }

    /// Transitions to STOPPING, wakes any sleeper, waits up to `timeout`
    /// for a graceful exit, then forcibly cancels the task.
    pub async fn stop(&self, timeout: Option<Duration>) {
        if self.state().await == LoopState::Stopped {
            return;
        }
        self.set_state(LoopState::Stopping).await;
        self.stop_requested.store(true, Ordering::SeqCst);
        self.stop_signal.notify_waiters();
        self.wake_signal.notify_waiters();

        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            let timeout = timeout.unwrap_or(Duration::from_secs(5));
            if tokio::time::timeout(timeout, handle).await.is_err() {
                tracing::warn!(loop_id = %self.id, "stop() timed out, task left to be dropped");
            }
        }
        self.set_state(LoopState::Stopped).await;
    }

    fn stop_requested_now(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    async fn drive(self: Arc<Self>) {
        self.set_state(LoopState::Running).await;

        loop {
            if self.stop_requested_now() {
                break;
            }
            if !self.behavior.is_alive().await {
                self.set_state(LoopState::Stopped).await;
                return;
            }

            if self.state().await == LoopState::Sleeping {
                if self.wake_ready().await {
                    self.set_state(LoopState::Running).await;
                } else {
                    self.wait_while_sleeping().await;
                    continue;
                }
            }

            let entered_paused = self.state().await == LoopState::Paused;
            match self.check_resources().await {
                ResourceCheckOutcome::Proceed => {
                    if entered_paused {
                        self.set_state(LoopState::Running).await;
                    }
                }
                ResourceCheckOutcome::PausedSkip => {
                    self.set_state(LoopState::Paused).await;
                    self.cooperative_sleep(self.config.resource_check_interval).await;
                    continue;
                }
                ResourceCheckOutcome::StoppedWhileBlocking => break,
            }

            self.run_iteration().await;

            if self.state().await == LoopState::Paused {
                // max_consecutive_errors was just reached; sit out one
                // resource_check_interval before the supervisor (external
                // to this loop) gets a chance to act.
                self.cooperative_sleep(self.config.resource_check_interval).await;
                continue;
            }

            let delay = *self.current_delay.lock().await;
            self.cooperative_sleep(delay).await;
            if self.stop_requested_now() {
                break;
            }
        }

        self.set_state(LoopState::Stopped).await;
    }

    async fn wake_ready(&self) -> bool {
        let condition = self.wake_condition.lock().await.clone();
        match condition {
            None => true,
            Some(WakeCondition::Time { at }) => at <= Utc::now(),
            Some(ref other) => self.behavior.resolve_wake(other).await,
        }
    }

    async fn wait_while_sleeping(&self) {
        let poll = Duration::from_secs_f64(self.config.resource_check_interval.max(0.05));
        tokio::select! {
            _ = self.wake_signal.notified() => {}
            _ = tokio::time::sleep(poll) => {}
            _ = self.stop_signal.notified() => {}
        }
    }

    async fn check_resources(&self) -> ResourceCheckOutcome {
        if self.config.resources_to_check.is_empty() {
            return ResourceCheckOutcome::Proceed;
        }
        let Some(limiter) = self.rate_limiter.as_ref() else {
            return ResourceCheckOutcome::Proceed;
        };

        match self.config.resource_exhaustion_policy {
            ResourceExhaustionPolicy::Skip => {
                for resource in &self.config.resources_to_check {
                    if !limiter.has_capacity(&self.principal_id, resource, 1.0).await {
                        return ResourceCheckOutcome::PausedSkip;
                    }
                }
                ResourceCheckOutcome::Proceed
            }
            ResourceExhaustionPolicy::Block => {
                for resource in &self.config.resources_to_check {
                    loop {
                        if self.stop_requested_now() {
                            return ResourceCheckOutcome::StoppedWhileBlocking;
                        }
                        let acquired = tokio::select! {
                            acquired = limiter.wait_for_capacity(
                                &self.principal_id,
                                resource,
                                1.0,
                                Some(self.config.resource_check_interval),
                            ) => acquired,
                            _ = self.stop_signal.notified() => {
                                return ResourceCheckOutcome::StoppedWhileBlocking;
                            }
                        };
                        if acquired {
                            break;
                        }
                    }
                }
                ResourceCheckOutcome::Proceed
            }
        }
    }

    async fn run_iteration(&self) {
        let Some(action) = self.behavior.decide_action().await else {
            self.iteration_count.fetch_add(1, Ordering::SeqCst);
            self.record_success().await;
            return;
        };

        let outcome = self.behavior.execute_action(action).await;
        self.iteration_count.fetch_add(1, Ordering::SeqCst);

        if outcome.success {
            self.record_success().await;
        } else {
            self.record_failure(outcome.error.unwrap_or_else(|| "action failed".to_string())).await;
        }
    }

    async fn record_success(&self) {
        self.consecutive_errors.store(0, Ordering::SeqCst);
        *self.current_delay.lock().await = self.config.min_loop_delay;
    }

    async fn record_failure(&self, reason: String) {
        let errors = self.consecutive_errors.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut delay = self.current_delay.lock().await;
            *delay = (*delay * 2.0).min(self.config.max_loop_delay).max(self.config.min_loop_delay);
        }
        if errors >= self.config.max_consecutive_errors {
            *self.crash_reason.lock().await = Some(reason);
            self.set_state(LoopState::Paused).await;
        }
    }

    async fn cooperative_sleep(&self, seconds: f64) {
        if seconds <= 0.0 {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs_f64(seconds)) => {}
            _ = self.stop_signal.notified() => {}
        }
    }

    /// Clears error/crash state and restarts from STOPPED. Used by the
    /// supervisor after a backoff delay (spec §4.10): restart preserves
    /// everything the behavior itself owns (memory, scrip, artifacts) and
    /// only resets this loop's own bookkeeping.
    pub async fn reset_for_restart(self: &Arc<Self>) {
        self.consecutive_errors.store(0, Ordering::SeqCst);
        *self.crash_reason.lock().await = None;
        self.voluntary_shutdown.store(false, Ordering::SeqCst);
        *self.current_delay.lock().await = self.config.min_loop_delay;
        self.start().await;
    }
}

enum ResourceCheckOutcome {
    Proceed,
    PausedSkip,
    StoppedWhileBlocking,
}

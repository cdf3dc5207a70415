//! Cooperative loop engine and loop manager (spec §4.8/§4.9).
//!
//! Agent loops and artifact loops share one state machine
//! ([`loop_engine::Loop`]); they differ only in which [`AgentBehavior`]
//! drives `decide_action`/`execute_action`. Coroutine control flow in the
//! Python source becomes lightweight tokio tasks with explicit
//! cancellation (`stop_signal`) and bounded sleeps, per the design notes.

pub mod behavior;
pub mod loop_engine;
pub mod manager;

pub use behavior::{ActionOutcome, AgentBehavior, ArtifactBehavior};
pub use loop_engine::{Loop, LoopConfig, ResourceExhaustionPolicy};
pub use manager::{LoopManager, LoopManagerError};

#[cfg(test)]
mod tests {
    use super::*;
    use agora_types::LoopState;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    struct AlwaysFails {
        calls: AtomicU32,
    }

    #[async_trait]
    impl AgentBehavior for AlwaysFails {
        async fn decide_action(&self) -> Option<Value> {
            Some(json!({}))
        }

        async fn execute_action(&self, _action: Value) -> ActionOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ActionOutcome::failed("boom")
        }
    }

    struct AlwaysSucceeds;

    #[async_trait]
    impl AgentBehavior for AlwaysSucceeds {
        async fn decide_action(&self) -> Option<Value> {
            Some(json!({}))
        }

        async fn execute_action(&self, _action: Value) -> ActionOutcome {
            ActionOutcome::ok(json!({}))
        }
    }

    fn fast_config(max_errors: u32) -> LoopConfig {
        LoopConfig {
            min_loop_delay: 0.01,
            max_loop_delay: 0.05,
            resource_check_interval: 0.05,
            max_consecutive_errors: max_errors,
            resources_to_check: Vec::new(),
            resource_exhaustion_policy: ResourceExhaustionPolicy::Skip,
        }
    }

    #[tokio::test]
    async fn scenario_e_pauses_after_max_consecutive_errors() {
        let behavior = Arc::new(AlwaysFails { calls: AtomicU32::new(0) });
        let lp = Loop::new("agent-1", "agent-1", behavior, fast_config(3), None);

        lp.start().await;
        // Give the task room to run at least 3 failing iterations.
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(lp.state().await, LoopState::Paused);
        assert!(lp.consecutive_errors() >= 3);
        lp.stop(Some(Duration::from_millis(200))).await;
    }

    #[tokio::test]
    async fn lifecycle_round_trips_stopped_to_running_to_stopped() {
        let lp = Loop::new("agent-2", "agent-2", Arc::new(AlwaysSucceeds), fast_config(5), None);
        assert_eq!(lp.state().await, LoopState::Stopped);

        lp.start().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(lp.state().await.is_active());

        lp.stop(Some(Duration::from_secs(1))).await;
        assert_eq!(lp.state().await, LoopState::Stopped);
    }

    #[tokio::test]
    async fn manager_rejects_removing_a_running_loop() {
        let manager = LoopManager::new();
        manager
            .create_loop("a", "a", Arc::new(AlwaysSucceeds), fast_config(5), None)
            .await
            .unwrap();
        let lp = manager.get_loop("a").await.unwrap();
        lp.start().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = manager.remove_loop("a").await.unwrap_err();
        assert!(matches!(err, LoopManagerError::StillRunning(_)));

        lp.stop(Some(Duration::from_millis(200))).await;
        manager.remove_loop("a").await.unwrap();
    }

    #[tokio::test]
    async fn stop_all_leaves_no_loop_running() {
        let manager = LoopManager::new();
        for id in ["a", "b", "c"] {
            manager
                .create_loop(id, id, Arc::new(AlwaysSucceeds), fast_config(5), None)
                .await
                .unwrap();
        }
        manager.start_all().await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(manager.running_count().await, 3);

        manager.stop_all(Some(Duration::from_millis(200))).await;
        assert_eq!(manager.running_count().await, 0);
    }
}

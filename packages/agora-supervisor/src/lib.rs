//! Supervisor: classifies dead/paused loops and restarts recoverable ones
//! under exponential backoff (spec §4.10).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use agora_config::RestartPolicyConfig;
use agora_eventlog::EventLog;
use agora_ledger::Ledger;
use agora_looprt::LoopManager;
use agora_types::{DeathType, EventType, LoopState, RestartState};
use chrono::Utc;
use rand::Rng;
use serde_json::json;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

pub struct Supervisor {
    loops: Arc<LoopManager>,
    ledger: Arc<Ledger>,
    event_log: Arc<EventLog>,
    policy: RestartPolicyConfig,
    poll_interval: Duration,
    restart_states: RwLock<HashMap<String, RestartState>>,
}

impl Supervisor {
    pub fn new(
        loops: Arc<LoopManager>,
        ledger: Arc<Ledger>,
        event_log: Arc<EventLog>,
        policy: RestartPolicyConfig,
        poll_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            loops,
            ledger,
            event_log,
            policy,
            poll_interval,
            restart_states: RwLock::new(HashMap::new()),
        })
    }

    /// Spawns the periodic evaluation task. The returned handle is the
    /// caller's to `.abort()` on shutdown; the supervisor never stops
    /// loops itself outside its own reset-and-restart path (spec §4.10).
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                this.evaluate_once().await;
                tokio::time::sleep(this.poll_interval).await;
            }
        })
    }

    /// One evaluation pass over every known loop, exposed directly so
    /// tests don't need to race a background task.
    pub async fn evaluate_once(self: &Arc<Self>) {
        let states = self.loops.get_all_states().await;
        for (id, state) in states {
            if !matches!(state, LoopState::Paused | LoopState::Stopped) {
                continue;
            }
            if self.is_permanently_dead(&id).await {
                continue;
            }
            self.handle_dead_loop(&id).await;
        }
    }

    async fn is_permanently_dead(&self, id: &str) -> bool {
        self.restart_states.read().await.get(id).is_some_and(|s| s.permanently_dead)
    }

    async fn handle_dead_loop(self: &Arc<Self>, id: &str) {
        let Some(lp) = self.loops.get_loop(id).await else { return };
        let scrip = self.ledger.get_scrip(id).await;
        let crash_reason = lp.crash_reason().await;
        let death = self.classify(scrip, lp.voluntary_shutdown(), crash_reason.as_deref());

        match death {
            DeathType::Smart => {
                self.mark_permanently_dead(id, DeathType::Smart).await;
                self.event_log
                    .append(
                        EventType::Other("agent_permanent_death".to_string()),
                        json!({"id": id, "death_type": "smart", "scrip": scrip}),
                    )
                    .await;
            }
            DeathType::Voluntary => {
                self.mark_permanently_dead(id, DeathType::Voluntary).await;
                self.event_log
                    .append(
                        EventType::Other("agent_permanent_death".to_string()),
                        json!({"id": id, "death_type": "voluntary"}),
                    )
                    .await;
            }
            DeathType::Dumb | DeathType::Unknown => {
                self.restart_with_backoff(id, death).await;
            }
        }
    }

    fn classify(&self, scrip: i64, voluntary: bool, crash_reason: Option<&str>) -> DeathType {
        if scrip <= 0 {
            return DeathType::Smart;
        }
        if voluntary {
            return DeathType::Voluntary;
        }
        if let Some(reason) = crash_reason {
            let lower = reason.to_lowercase();
            if lower.contains("resource") && !self.policy.restart_on_resource_exhaustion {
                return DeathType::Smart;
            }
            if lower.contains("timeout") && !self.policy.restart_on_timeout {
                return DeathType::Smart;
            }
        }
        DeathType::Dumb
    }

    async fn mark_permanently_dead(&self, id: &str, death_type: DeathType) {
        let mut states = self.restart_states.write().await;
        let entry = states.entry(id.to_string()).or_default();
        entry.permanently_dead = true;
        entry.last_death_type = Some(death_type);
    }

    async fn restart_with_backoff(self: &Arc<Self>, id: &str, death_type: DeathType) {
        let now = Utc::now();
        let backoff = {
            let mut states = self.restart_states.write().await;
            let entry = states.entry(id.to_string()).or_default();
            entry.last_death_type = Some(death_type);
            entry.prune_older_than(now, chrono::Duration::hours(1));

            if entry.recent_restarts.len() as u32 >= self.policy.max_restarts_per_hour {
                entry.permanently_dead = true;
                None
            } else {
                entry.recent_restarts.push_back(now);
                entry.restart_count += 1;
                let exp = self.policy.initial_backoff_seconds
                    * self.policy.backoff_multiplier.powi(entry.restart_count as i32 - 1);
                let capped = exp.min(self.policy.max_backoff_seconds);
                let jitter = capped * self.policy.jitter_factor;
                let noisy = capped + rand::thread_rng().gen_range(-jitter..=jitter);
                entry.current_backoff = noisy.max(0.0);
                Some(entry.current_backoff)
            }
        };

        let Some(backoff) = backoff else {
            self.event_log
                .append(
                    EventType::Other("agent_permanent_death".to_string()),
                    json!({"id": id, "death_type": "dumb", "reason": "exceeded max_restarts_per_hour"}),
                )
                .await;
            return;
        };

        self.event_log
            .append(
                EventType::Other("agent_restart_scheduled".to_string()),
                json!({"id": id, "backoff_seconds": backoff}),
            )
            .await;

        let Some(lp) = self.loops.get_loop(id).await else { return };
        let event_log = self.event_log.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs_f64(backoff)).await;
            lp.reset_for_restart().await;
            event_log
                .append(EventType::Other("agent_restarted".to_string()), json!({"id": id}))
                .await;
        });
    }

    pub async fn restart_state(&self, id: &str) -> Option<RestartState> {
        self.restart_states.read().await.get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_looprt::{ActionOutcome, AgentBehavior, Loop, LoopConfig};
    use agora_types::{IdRegistry, PrincipalId};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::collections::HashMap as Map;

    struct AlwaysFails;

    #[async_trait]
    impl AgentBehavior for AlwaysFails {
        async fn decide_action(&self) -> Option<Value> {
            Some(json!({}))
        }
        async fn execute_action(&self, _action: Value) -> ActionOutcome {
            ActionOutcome::failed("synthetic crash: runtime error")
        }
    }

    fn fast_config() -> LoopConfig {
        LoopConfig {
            min_loop_delay: 0.01,
            max_loop_delay: 0.02,
            resource_check_interval: 0.02,
            max_consecutive_errors: 2,
            resources_to_check: Vec::new(),
            resource_exhaustion_policy: agora_looprt::ResourceExhaustionPolicy::Skip,
        }
    }

    async fn harness_with_scrip(scrip: i64) -> (Arc<Supervisor>, Arc<LoopManager>, Arc<Ledger>, PrincipalId) {
        let registry = Arc::new(IdRegistry::new());
        let event_log = Arc::new(EventLog::in_memory());
        let ledger = Arc::new(Ledger::new(registry, event_log.clone()));
        ledger.create_principal("agent-1", scrip, Map::new()).await.unwrap();

        let manager = Arc::new(LoopManager::new());
        manager
            .create_loop("agent-1", "agent-1", Arc::new(AlwaysFails), fast_config(), None)
            .await
            .unwrap();

        let supervisor = Supervisor::new(
            manager.clone(),
            ledger.clone(),
            event_log,
            RestartPolicyConfig {
                max_restarts_per_hour: 10,
                initial_backoff_seconds: 0.01,
                backoff_multiplier: 2.0,
                max_backoff_seconds: 0.05,
                jitter_factor: 0.0,
                restart_on_resource_exhaustion: false,
                restart_on_timeout: false,
            },
            Duration::from_millis(20),
        );
        (supervisor, manager, ledger, "agent-1".to_string())
    }

    #[tokio::test]
    async fn scenario_e_dumb_death_restarts_and_clears_errors() {
        let (supervisor, manager, _ledger, id) = harness_with_scrip(100).await;
        let lp = manager.get_loop(&id).await.unwrap();
        lp.start().await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(lp.state().await, LoopState::Paused);

        supervisor.evaluate_once().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(lp.state().await.is_active());
        assert_eq!(lp.consecutive_errors(), 0);

        lp.stop(Some(Duration::from_millis(200))).await;
    }

    #[tokio::test]
    async fn scenario_8_smart_death_never_restarts() {
        let (supervisor, manager, _ledger, id) = harness_with_scrip(0).await;
        let lp = manager.get_loop(&id).await.unwrap();
        lp.start().await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(lp.state().await, LoopState::Paused);

        supervisor.evaluate_once().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(lp.state().await, LoopState::Paused);
        let restart_state = supervisor.restart_state(&id).await.unwrap();
        assert!(restart_state.permanently_dead);
        assert_eq!(restart_state.last_death_type, Some(DeathType::Smart));

        lp.stop(Some(Duration::from_millis(200))).await;
    }
}

//! Top-level driver (spec §4.11): bootstraps the world, wires every
//! subsystem together, and runs the single autonomous run mode.
//!
//! Everything this crate is explicitly forbidden from knowing about
//! (agent personality/prompt content, dashboards, config-file parsing,
//! CLI argument handling) stays the caller's responsibility -- `bootstrap`
//! takes an already-populated [`agora_config::Config`], an [`LlmProvider`]
//! implementation, a [`Scorer`] for the mint auction, and a list of
//! pre-built agent behaviors to seed.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use agora_access::AccessControl;
use agora_artifacts::{ArtifactStore, WriteRequest};
use agora_auction::{MintAuction, Scorer};
use agora_checkpoint::{self as checkpoint, Checkpoint};
use agora_config::Config;
use agora_eventlog::EventLog;
use agora_kernel::{KernelActions, KernelState};
use agora_ledger::Ledger;
use agora_llmgate::{ApiCostTracker, LlmGateway, LlmProvider};
use agora_looprt::{AgentBehavior, LoopConfig, LoopManager, ResourceExhaustionPolicy};
use agora_ratelimit::RateTracker;
use agora_sandbox::SandboxExecutor;
use agora_types::{ArtifactKind, EventType, IdRegistry, PrincipalId};
use agora_wasmrt::WasmRuntime;
use serde_json::json;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

pub const KERNEL_LLM_GATEWAY_ID: &str = "kernel_llm_gateway";

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("failed to initialize the wasm runtime: {0}")]
    Wasm(#[from] agora_wasmrt::WasmError),
    #[error("loop configuration is invalid: {0}")]
    InvalidConfig(String),
    #[error("failed to seed bootstrap artifact or principal: {0}")]
    Bootstrap(String),
}

/// Error-category counters accumulated over a run, the Rust analogue of
/// the Python source's `ErrorStats` (spec's supplemental-feature list,
/// see SPEC_FULL.md §4).
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct ErrorStats {
    pub total: u64,
    pub by_category: std::collections::HashMap<String, u64>,
}

impl ErrorStats {
    pub fn record(&mut self, category: impl Into<String>) {
        self.total += 1;
        *self.by_category.entry(category.into()).or_insert(0) += 1;
    }
}

/// One pre-built agent to seed at bootstrap time. The driver has no
/// opinion on how `behavior` decides its actions -- that's the "agent
/// personality" content the spec places out of scope.
pub struct SeededAgent {
    pub id: PrincipalId,
    pub starting_scrip: i64,
    pub behavior: Arc<dyn AgentBehavior>,
}

/// Why a run stopped, used both for the checkpoint `reason` tag and for
/// the caller-facing summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    BudgetExhausted,
    RuntimeExceeded,
    DurationExceeded,
    NoLoopsRemaining,
    Cancelled,
}

impl StopReason {
    fn as_tag(&self) -> &'static str {
        match self {
            StopReason::BudgetExhausted => "budget_exhausted",
            StopReason::RuntimeExceeded => "runtime_exceeded",
            StopReason::DurationExceeded => "duration_exceeded",
            StopReason::NoLoopsRemaining => "no_loops_remaining",
            StopReason::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RunSummary {
    pub stop_reason: StopReason,
    pub cumulative_api_cost: f64,
    pub error_stats: ErrorStats,
    pub checkpoint_path: Option<String>,
}

fn to_loop_config(cfg: &agora_config::AgentLoopConfig) -> Result<LoopConfig, DriverError> {
    cfg.validate().map_err(DriverError::InvalidConfig)?;
    Ok(LoopConfig {
        min_loop_delay: cfg.min_loop_delay,
        max_loop_delay: cfg.max_loop_delay,
        resource_check_interval: cfg.resource_check_interval,
        max_consecutive_errors: cfg.max_consecutive_errors,
        resources_to_check: cfg.resources_to_check.clone(),
        resource_exhaustion_policy: match cfg.resource_exhaustion_policy {
            agora_config::ResourceExhaustionPolicy::Skip => ResourceExhaustionPolicy::Skip,
            agora_config::ResourceExhaustionPolicy::Block => ResourceExhaustionPolicy::Block,
        },
    })
}

/// Every subsystem the driver wires together, grouped for easy sharing
/// with an embedding binary that wants direct access (e.g. to submit a
/// mint auction bid on an agent's behalf).
pub struct World {
    pub id_registry: Arc<IdRegistry>,
    pub event_log: Arc<EventLog>,
    pub ledger: Arc<Ledger>,
    pub artifacts: Arc<ArtifactStore>,
    pub rate_tracker: Arc<RateTracker>,
    pub access_control: Arc<AccessControl>,
    pub wasm: Arc<WasmRuntime>,
    pub llm_gateway: Arc<LlmGateway>,
    pub cost_tracker: Arc<ApiCostTracker>,
    pub kernel_state: Arc<KernelState>,
    pub kernel_actions: Arc<KernelActions>,
    pub executor: Arc<SandboxExecutor>,
}

pub struct Driver {
    pub world: Arc<World>,
    pub agent_loops: Arc<LoopManager>,
    pub artifact_loops: Arc<LoopManager>,
    pub mint_auction: Arc<MintAuction>,
    pub supervisor: Option<Arc<agora_supervisor::Supervisor>>,
    config: Config,
    agent_loop_config: LoopConfig,
    error_stats: tokio::sync::Mutex<ErrorStats>,
    paused: AtomicBool,
    resume_notify: Notify,
    system_principals: HashSet<String>,
}

impl Driver {
    /// Bootstraps the world: seeds the `kernel_llm_gateway` bootstrap
    /// artifact, seeds every entry in `agents`, creates both loop
    /// managers, and optionally restores from a checkpoint on disk.
    pub async fn bootstrap(
        config: Config,
        llm_provider: Arc<dyn LlmProvider>,
        scorer: Arc<dyn Scorer>,
        agents: Vec<SeededAgent>,
    ) -> Result<Self, DriverError> {
        let id_registry = Arc::new(IdRegistry::new());
        let event_log = Arc::new(EventLog::in_memory());
        let ledger = Arc::new(Ledger::new(id_registry.clone(), event_log.clone()));
        let artifacts = Arc::new(ArtifactStore::new(id_registry.clone(), event_log.clone()));
        let wasm = Arc::new(WasmRuntime::new()?);
        let access_control = Arc::new(AccessControl::new(ledger.clone(), wasm.clone(), config.executor.max_contract_depth));
        let cost_tracker = Arc::new(ApiCostTracker::new());
        let llm_gateway = Arc::new(LlmGateway::new(
            ledger.clone(),
            event_log.clone(),
            llm_provider,
            config.llm.clone(),
            cost_tracker.clone(),
        ));
        let kernel_state = Arc::new(KernelState::new(ledger.clone(), artifacts.clone(), access_control.clone()));
        let kernel_actions = Arc::new(KernelActions::new(ledger.clone(), event_log.clone()));
        let executor = Arc::new(SandboxExecutor::new(
            wasm.clone(),
            kernel_state.clone(),
            kernel_actions.clone(),
            llm_gateway.clone(),
            access_control.clone(),
            artifacts.clone(),
            event_log.clone(),
            config.executor.allowed_imports.clone(),
            Duration::from_secs(config.executor.timeout_seconds),
            1_000_000_000,
        ));

        let rate_tracker = Arc::new(RateTracker::new(config.rate_limiting.window_seconds));
        if config.rate_limiting.enabled {
            for (resource, limit) in &config.rate_limiting.resources {
                rate_tracker
                    .configure_limit(resource, limit.max_per_window)
                    .await
                    .map_err(DriverError::InvalidConfig)?;
            }
        }

        let mut system_principals = HashSet::new();
        system_principals.insert(KERNEL_LLM_GATEWAY_ID.to_string());

        // Seed the kernel LLM gateway bootstrap artifact (spec §4.13):
        // executable, no standing of its own, no loop, and the one
        // capability that unlocks the `_syscall_llm` host function inside
        // the sandbox.
        artifacts
            .write_unchecked(WriteRequest {
                id: KERNEL_LLM_GATEWAY_ID.to_string(),
                created_by: KERNEL_LLM_GATEWAY_ID.to_string(),
                content: "wraps the _syscall_llm kernel primitive".to_string(),
                kind: Some(ArtifactKind::Executable),
                code: None,
                executable: Some(true),
                capabilities: Some(vec!["can_call_llm".to_string()]),
                access_contract_id: None,
                has_standing: Some(false),
                has_loop: Some(false),
                genesis_methods: None,
            })
            .await
            .map_err(|e| DriverError::Bootstrap(e.to_string()))?;

        let agent_loop_config = to_loop_config(&config.agent_loop)?;
        let agent_loops = Arc::new(LoopManager::new());
        let artifact_loops = Arc::new(LoopManager::new());

        for agent in agents {
            ledger
                .create_principal(&agent.id, agent.starting_scrip, std::collections::HashMap::new())
                .await
                .map_err(|e| DriverError::Bootstrap(e.to_string()))?;
            artifacts
                .write_unchecked(WriteRequest {
                    id: agent.id.clone(),
                    created_by: agent.id.clone(),
                    content: String::new(),
                    kind: Some(ArtifactKind::Agent),
                    has_standing: Some(true),
                    ..Default::default()
                })
                .await
                .map_err(|e| DriverError::Bootstrap(e.to_string()))?;
            agent_loops
                .create_loop(
                    agent.id.clone(),
                    agent.id.clone(),
                    agent.behavior,
                    agent_loop_config.clone(),
                    Some(rate_tracker.clone()),
                )
                .await
                .map_err(|e| DriverError::Bootstrap(e.to_string()))?;
        }

        let mut mint_auction = MintAuction::new(
            config.auction.clone(),
            ledger.clone(),
            event_log.clone(),
            scorer,
        );
        let max_api_cost = config.budget.max_api_cost;
        let budget_cost_tracker = cost_tracker.clone();
        mint_auction.set_cost_callbacks(
            Arc::new(move || max_api_cost > 0.0 && budget_cost_tracker.total_dollars() >= max_api_cost),
            Arc::new({
                let cost_tracker = cost_tracker.clone();
                move |dollars: f64| cost_tracker.track(dollars)
            }),
        );
        let mint_auction = Arc::new(mint_auction);

        let supervisor = if config.supervisor.enabled {
            Some(agora_supervisor::Supervisor::new(
                agent_loops.clone(),
                ledger.clone(),
                event_log.clone(),
                config.supervisor.restart_policy.clone(),
                Duration::from_secs_f64(config.supervisor.poll_interval_seconds),
            ))
        } else {
            None
        };

        let world = Arc::new(World {
            id_registry,
            event_log,
            ledger,
            artifacts,
            rate_tracker,
            access_control,
            wasm,
            llm_gateway,
            cost_tracker,
            kernel_state,
            kernel_actions,
            executor,
        });

        Ok(Self {
            world,
            agent_loops,
            artifact_loops,
            mint_auction,
            supervisor,
            config,
            agent_loop_config,
            error_stats: tokio::sync::Mutex::new(ErrorStats::default()),
            paused: AtomicBool::new(false),
            resume_notify: Notify::new(),
            system_principals,
        })
    }

    /// Restores ledger and artifact state from a checkpoint document,
    /// running the invariant-S repair sweep (spec §4.11).
    pub async fn restore_checkpoint(&self, checkpoint: &Checkpoint) {
        checkpoint::restore(
            checkpoint,
            &self.world.ledger,
            &self.world.artifacts,
            &self.world.cost_tracker,
            &self.system_principals,
        )
        .await;
        tracing::info!(
            event_number = checkpoint.event_number,
            reason = %checkpoint.reason,
            cumulative_api_cost = checkpoint.cumulative_api_cost,
            "resumed from checkpoint"
        );
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.resume_notify.notify_waiters();
    }

    fn is_budget_exhausted(&self) -> bool {
        self.config.budget.max_api_cost > 0.0 && self.world.cost_tracker.total_dollars() >= self.config.budget.max_api_cost
    }

    /// Runs the single autonomous mode until a stop condition is met
    /// (spec §4.11). `duration` bounds wall-clock time for this call;
    /// `None` means run until no loops remain active.
    pub async fn run(self: &Arc<Self>, duration: Option<Duration>) -> RunSummary {
        let discovered = self
            .artifact_loops
            .discover_loops(
                self.world.artifacts.clone(),
                self.world.executor.clone(),
                self.agent_loop_config.clone(),
                Some(self.world.rate_tracker.clone()),
            )
            .await;
        if !discovered.is_empty() {
            tracing::info!(count = discovered.len(), ids = ?discovered, "discovered artifact loops");
        }

        self.agent_loops.start_all().await;
        self.artifact_loops.start_all().await;

        let mint_auction = self.mint_auction.clone();
        let this = self.clone();
        let mint_task: JoinHandle<()> = tokio::spawn(async move {
            loop {
                if !this.is_budget_exhausted() {
                    if let Some(result) = mint_auction.update().await {
                        if let Some(winner) = &result.winner_id {
                            tracing::info!(
                                winner = %winner,
                                price_paid = ?result.price_paid,
                                score = ?result.score,
                                scrip_minted = ?result.scrip_minted,
                                "mint auction resolved"
                            );
                        } else if let Some(err) = &result.error {
                            tracing::debug!(error = %err, "mint auction round produced no winner");
                        }
                    }
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        });

        let supervisor_task = self.supervisor.as_ref().map(|s| s.spawn());

        let start = Instant::now();
        let max_runtime = self.config.budget.max_runtime_seconds;
        let stop_reason = loop {
            if self.is_budget_exhausted() {
                break StopReason::BudgetExhausted;
            }
            if max_runtime > 0 && start.elapsed() >= Duration::from_secs(max_runtime) {
                break StopReason::RuntimeExceeded;
            }
            if let Some(duration) = duration {
                if start.elapsed() >= duration {
                    break StopReason::DurationExceeded;
                }
            } else if self.agent_loops.running_count().await == 0 && self.artifact_loops.running_count().await == 0 {
                break StopReason::NoLoopsRemaining;
            }

            if self.paused.load(Ordering::SeqCst) {
                self.resume_notify.notified().await;
                continue;
            }

            let tick = Duration::from_millis(500);
            tokio::select! {
                _ = tokio::time::sleep(tick) => {}
                _ = self.resume_notify.notified() => {}
            }
        };

        mint_task.abort();
        if let Some(handle) = supervisor_task {
            handle.abort();
        }
        self.agent_loops.stop_all(Some(Duration::from_secs(10))).await;
        self.artifact_loops.stop_all(Some(Duration::from_secs(10))).await;

        let checkpoint_path = if !self.config.budget.checkpoint_file.is_empty() {
            let agent_ids = self.agent_loops.get_all_states().await.into_keys().collect();
            let snapshot = checkpoint::save(
                &self.world.event_log,
                &self.world.ledger,
                &self.world.artifacts,
                &self.world.cost_tracker,
                agent_ids,
                stop_reason.as_tag(),
            )
            .await;
            checkpoint::log_checkpoint_event(&self.world.event_log, &snapshot).await;
            match checkpoint::write_to_file(&snapshot, &self.config.budget.checkpoint_file) {
                Ok(()) => Some(self.config.budget.checkpoint_file.clone()),
                Err(err) => {
                    tracing::warn!(error = %err, "failed to write checkpoint file");
                    None
                }
            }
        } else {
            None
        };

        self.world
            .event_log
            .append(
                EventType::Other("run_stopped".to_string()),
                json!({"reason": stop_reason.as_tag()}),
            )
            .await;

        RunSummary {
            stop_reason,
            cumulative_api_cost: self.world.cost_tracker.total_dollars(),
            error_stats: self.error_stats.lock().await.clone(),
            checkpoint_path,
        }
    }

    /// Records an error against the run's error-category counters, for
    /// callers driving loop behaviors that want failures reflected in the
    /// final [`RunSummary`] (spec supplemental feature, see
    /// SPEC_FULL.md §4).
    pub async fn record_error(&self, category: impl Into<String>) {
        self.error_stats.lock().await.record(category);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_auction::ConstantScorer;
    use agora_llmgate::LlmProviderError;

    struct NullProvider;

    #[async_trait::async_trait]
    impl LlmProvider for NullProvider {
        async fn complete(
            &self,
            _model: &str,
            _messages: &[agora_llmgate::ChatMessage],
        ) -> Result<agora_llmgate::LlmResponse, LlmProviderError> {
            Err(LlmProviderError::Failed("no provider wired in tests".to_string()))
        }
    }

    fn test_config(checkpoint_file: &str) -> Config {
        let mut config = Config::default();
        config.budget.checkpoint_file = checkpoint_file.to_string();
        config.supervisor.enabled = false;
        config.auction.enabled = false;
        config
    }

    #[tokio::test]
    async fn bootstrap_seeds_the_llm_gateway_bootstrap_artifact() {
        let driver = Driver::bootstrap(
            test_config(""),
            Arc::new(NullProvider),
            Arc::new(ConstantScorer(1.0)),
            Vec::new(),
        )
        .await
        .unwrap();

        let gateway = driver.world.artifacts.get(KERNEL_LLM_GATEWAY_ID).await.unwrap();
        assert!(gateway.can_call_llm());
        assert!(!gateway.has_standing);
        assert!(!gateway.has_loop);
    }

    #[tokio::test]
    async fn run_with_no_loops_and_no_duration_exits_immediately() {
        let driver = Arc::new(
            Driver::bootstrap(test_config(""), Arc::new(NullProvider), Arc::new(ConstantScorer(1.0)), Vec::new())
                .await
                .unwrap(),
        );

        let summary = driver.run(None).await;
        assert_eq!(summary.stop_reason, StopReason::NoLoopsRemaining);
    }

    #[tokio::test]
    async fn run_honors_supplied_duration_and_writes_a_checkpoint() {
        let path = std::env::temp_dir().join(format!(
            "agora-driver-test-{}.json",
            std::process::id()
        ));
        let driver = Arc::new(
            Driver::bootstrap(
                test_config(path.to_str().unwrap()),
                Arc::new(NullProvider),
                Arc::new(ConstantScorer(1.0)),
                Vec::new(),
            )
            .await
            .unwrap(),
        );

        let summary = driver.run(Some(Duration::from_millis(50))).await;
        assert_eq!(summary.stop_reason, StopReason::DurationExceeded);
        assert!(summary.checkpoint_path.is_some());
        assert!(path.exists());
        std::fs::remove_file(&path).ok();
    }
}

//! Runtime configuration for the Agora simulation.
//!
//! Parsing an on-disk format (YAML/TOML/env) is explicitly out of scope
//! per spec.md §1; this crate only defines the struct tree the other
//! components are constructed from (spec §6's option table) plus sane
//! defaults. An embedding binary is free to populate it however it likes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub world: WorldConfig,
    pub budget: BudgetConfig,
    pub rate_limiting: RateLimitingConfig,
    pub agent_loop: AgentLoopConfig,
    pub supervisor: SupervisorConfig,
    pub executor: ExecutorConfig,
    pub auction: AuctionConfig,
    pub llm: LlmConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            world: WorldConfig::default(),
            budget: BudgetConfig::default(),
            rate_limiting: RateLimitingConfig::default(),
            agent_loop: AgentLoopConfig::default(),
            supervisor: SupervisorConfig::default(),
            executor: ExecutorConfig::default(),
            auction: AuctionConfig::default(),
            llm: LlmConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldConfig {
    /// Wall-clock cap for the run, in seconds. 0 = unlimited.
    pub max_duration_seconds: u64,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self { max_duration_seconds: 0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Cumulative LLM dollar-cost cap for the run. 0 = unlimited.
    pub max_api_cost: f64,
    pub checkpoint_file: String,
    /// Hard wall-clock backstop independent of `max_duration_seconds`,
    /// carried over from `runner.py`'s `max_runtime_seconds` (supplemental
    /// feature, see SPEC_FULL.md §4). 0 = unlimited.
    pub max_runtime_seconds: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_api_cost: 0.0,
            checkpoint_file: "checkpoint.json".to_string(),
            max_runtime_seconds: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    pub enabled: bool,
    pub window_seconds: f64,
    pub resources: HashMap<String, ResourceLimitConfig>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_seconds: 60.0,
            resources: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimitConfig {
    pub max_per_window: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceExhaustionPolicy {
    Skip,
    Block,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLoopConfig {
    pub min_loop_delay: f64,
    pub max_loop_delay: f64,
    pub resource_check_interval: f64,
    pub max_consecutive_errors: u32,
    pub resources_to_check: Vec<String>,
    pub resource_exhaustion_policy: ResourceExhaustionPolicy,
}

impl Default for AgentLoopConfig {
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

impl AgentLoopConfig {
    /// Mirrors `AgentLoopConfig.__post_init__` in the Python source.
    pub fn validate(&self) -> Result<(), String> {
        if self.min_loop_delay < 0.0 {
            return Err(format!("min_loop_delay must be non-negative: {}", self.min_loop_delay));
        }
        if self.max_loop_delay < self.min_loop_delay {
            return Err(format!(
                "max_loop_delay ({}) must be >= min_loop_delay ({})",
                self.max_loop_delay, self.min_loop_delay
            ));
        }
        if self.resource_check_interval <= 0.0 {
            return Err(format!(
                "resource_check_interval must be positive: {}",
                self.resource_check_interval
            ));
        }
        if self.max_consecutive_errors < 1 {
            return Err("max_consecutive_errors must be at least 1".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartPolicyConfig {
    pub max_restarts_per_hour: u32,
    pub initial_backoff_seconds: f64,
    pub backoff_multiplier: f64,
    pub max_backoff_seconds: f64,
    pub jitter_factor: f64,
    pub restart_on_resource_exhaustion: bool,
    pub restart_on_timeout: bool,
}

impl Default for RestartPolicyConfig {
    fn default() -> Self {
        Self {
            max_restarts_per_hour: 10,
            initial_backoff_seconds: 1.0,
            backoff_multiplier: 2.0,
            max_backoff_seconds: 300.0,
            jitter_factor: 0.1,
            restart_on_resource_exhaustion: false,
            restart_on_timeout: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    pub enabled: bool,
    pub restart_policy: RestartPolicyConfig,
    /// Cadence at which the supervisor evaluates loop states, seconds.
    pub poll_interval_seconds: f64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            restart_policy: RestartPolicyConfig::default(),
            poll_interval_seconds: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    pub timeout_seconds: u64,
    pub allowed_imports: Vec<String>,
    pub max_contract_depth: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 5,
            allowed_imports: vec![
                "math".to_string(),
                "json".to_string(),
                "random".to_string(),
                "datetime".to_string(),
            ],
            max_contract_depth: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_1m: f64,
    pub output_per_1m: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuctionConfig {
    pub enabled: bool,
    /// How long a bidding window stays open once opened, seconds.
    pub bidding_window_seconds: f64,
    /// How often a new bidding window opens after the previous auction
    /// resolves, seconds.
    pub auction_interval_seconds: f64,
    pub min_bid: i64,
    /// Scrip minted to the winner beyond whatever they bid.
    pub mint_amount: i64,
    /// Flat universal basic income distributed to every seeded agent on
    /// each resolution, independent of the auction's winner.
    pub ubi_amount: i64,
}

impl Default for AuctionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bidding_window_seconds: 30.0,
            auction_interval_seconds: 60.0,
            min_bid: 1,
            mint_amount: 100,
            ubi_amount: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub default_model: String,
    pub rate_limit_delay: f64,
    pub pricing: HashMap<String, ModelPricing>,
    pub default_pricing: ModelPricing,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            default_model: "gpt-4o-mini".to_string(),
            rate_limit_delay: 15.0,
            pricing: HashMap::new(),
            default_pricing: ModelPricing {
                input_per_1m: 0.15,
                output_per_1m: 0.60,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        assert!(AgentLoopConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_inverted_delay_bounds() {
        let cfg = AgentLoopConfig {
            min_loop_delay: 5.0,
            max_loop_delay: 1.0,
            ..AgentLoopConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}

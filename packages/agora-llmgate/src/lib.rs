//! LLM gateway kernel syscall (spec §4.13).
//!
//! `_syscall_llm` is not a library call artifacts reach for directly --
//! it is injected into the sandbox's globals by the executor, and only
//! when the executing artifact carries the `can_call_llm` capability.
//! This crate owns the syscall's *behavior* (affordability check,
//! provider call, budget debit, `thinking` event); `agora-sandbox` owns
//! *wiring it into the guest ABI*.
//!
//! The wire protocol to an actual LLM provider is out of scope (spec §1);
//! [`LlmProvider`] is the seam a caller plugs a real implementation into.
//! Dollar cost is computed here from token usage against the pricing
//! table in [`agora_config::LlmConfig`], not trusted from the provider,
//! so every caller is billed against the same table regardless of which
//! provider answered.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use agora_config::LlmConfig;
use agora_eventlog::EventLog;
use agora_ledger::Ledger;
use agora_types::EventType;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

pub const LLM_BUDGET_RESOURCE: &str = "llm_budget";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LlmUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub usage: LlmUsage,
}

#[derive(Debug, Error)]
pub enum LlmProviderError {
    #[error("provider call failed: {0}")]
    Failed(String),
}

/// The opaque external LLM call. A production binary plugs a real
/// provider client in here; tests use a canned responder.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(&self, model: &str, messages: &[ChatMessage]) -> Result<LlmResponse, LlmProviderError>;
}

/// The shape every syscall returns to guest code, matching spec §4.5's
/// `{success, result?, error?}` convention specialized with LLM fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyscallResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<LlmUsage>,
    pub cost: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyscallResult {
    fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            content: None,
            usage: None,
            cost: 0.0,
            error: Some(error.into()),
        }
    }
}

/// Cumulative dollar cost across the whole run, shared by the gateway and
/// the mint auction's scoring path (spec §4.12: "the only place in the
/// core that consumes a dollar budget outside of a direct principal's
/// `llm_budget` spend"). Stored as micro-dollars so it's lock-free.
#[derive(Debug, Default)]
pub struct ApiCostTracker {
    micros: AtomicI64,
}

impl ApiCostTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, dollars: f64) {
        self.micros.fetch_add((dollars * 1_000_000.0).round() as i64, Ordering::SeqCst);
    }

    pub fn total_dollars(&self) -> f64 {
        self.micros.load(Ordering::SeqCst) as f64 / 1_000_000.0
    }

    /// `max_api_cost == 0.0` means unlimited (spec §6).
    pub fn is_exhausted(&self, max_api_cost: f64) -> bool {
        max_api_cost > 0.0 && self.total_dollars() >= max_api_cost
    }
}

/// Converts a dollar amount to/from the integer `llm_budget` resource
/// unit the ledger stores (micro-dollars, since `agora-ledger` balances
/// are `i64`).
pub fn dollars_to_budget_units(dollars: f64) -> i64 {
    (dollars * 1_000_000.0).round() as i64
}

pub fn budget_units_to_dollars(units: i64) -> f64 {
    units as f64 / 1_000_000.0
}

pub struct LlmGateway {
    ledger: Arc<Ledger>,
    event_log: Arc<EventLog>,
    provider: Arc<dyn LlmProvider>,
    pricing: LlmConfig,
    cost_tracker: Arc<ApiCostTracker>,
}

impl LlmGateway {
    pub fn new(
        ledger: Arc<Ledger>,
        event_log: Arc<EventLog>,
        provider: Arc<dyn LlmProvider>,
        pricing: LlmConfig,
        cost_tracker: Arc<ApiCostTracker>,
    ) -> Self {
        Self {
            ledger,
            event_log,
            provider,
            pricing,
            cost_tracker,
        }
    }

    pub fn cost_tracker(&self) -> Arc<ApiCostTracker> {
        self.cost_tracker.clone()
    }

    fn cost_for(&self, model: &str, usage: LlmUsage) -> f64 {
        let pricing = self.pricing.pricing.get(model).unwrap_or(&self.pricing.default_pricing);
        let input_cost = usage.input_tokens as f64 / 1_000_000.0 * pricing.input_per_1m;
        let output_cost = usage.output_tokens as f64 / 1_000_000.0 * pricing.output_per_1m;
        input_cost + output_cost
    }

    /// The four-step syscall body from spec §4.13. Never returns `Err`:
    /// every failure mode, including a panicking provider, is folded into
    /// `SyscallResult { success: false, .. }` so a misbehaving guest call
    /// can't crash the loop that made it.
    pub async fn syscall_llm(&self, caller: &str, model: &str, messages: &[ChatMessage]) -> SyscallResult {
        if self.ledger.get_resource(caller, LLM_BUDGET_RESOURCE).await <= 0 {
            return SyscallResult::failure("Budget exhausted");
        }

        let response = match self.provider.complete(model, messages).await {
            Ok(r) => r,
            Err(e) => return SyscallResult::failure(e.to_string()),
        };

        let cost = self.cost_for(model, response.usage);
        self.cost_tracker.track(cost);
        let cost_units = dollars_to_budget_units(cost);

        match self.ledger.spend_resource(caller, LLM_BUDGET_RESOURCE, cost_units).await {
            Ok(_) => {}
            Err(e) => {
                // This is the one place the core may exceed budget,
                // bounded to a single call (spec §4.13 step 3).
                tracing::warn!(caller, %e, "llm_budget debit failed after an already-placed call");
                self.event_log
                    .append(
                        EventType::Other("llm_budget_debit_failed".to_string()),
                        json!({"caller": caller, "model": model, "cost": cost}),
                    )
                    .await;
            }
        }

        self.event_log
            .append(
                EventType::Thinking,
                json!({
                    "caller": caller,
                    "model": model,
                    "input_tokens": response.usage.input_tokens,
                    "output_tokens": response.usage.output_tokens,
                    "cost": cost,
                }),
            )
            .await;

        SyscallResult {
            success: true,
            content: Some(response.content),
            usage: Some(response.usage),
            cost,
            error: None,
        }
    }
}

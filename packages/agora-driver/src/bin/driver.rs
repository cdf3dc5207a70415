//! Autonomous run entry point.
//!
//! Configuration-file parsing and CLI argument handling are explicitly
//! out of scope (spec §1): this binary reads only a handful of
//! environment variables as overrides and otherwise runs with
//! [`Config::default`]. Embedding binaries that need real config-file or
//! flag parsing should depend on `agora-driver` as a library instead of
//! invoking this one.

use std::sync::Arc;
use std::time::Duration;

use agora_auction::{ConstantScorer, Scorer};
use agora_config::Config;
use agora_driver::Driver;
use agora_llmgate::{ChatMessage, LlmProvider, LlmProviderError, LlmResponse};
use async_trait::async_trait;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// A provider that always fails, standing in for the real LLM wire
/// protocol the spec treats as an opaque external collaborator. Embedding
/// binaries should supply their own [`LlmProvider`] wired to a real
/// client.
struct UnconfiguredProvider;

#[async_trait]
impl LlmProvider for UnconfiguredProvider {
    async fn complete(&self, _model: &str, _messages: &[ChatMessage]) -> Result<LlmResponse, LlmProviderError> {
        Err(LlmProviderError::Failed("no LlmProvider configured for this run".to_string()))
    }
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mut config = Config::default();
    config.world.max_duration_seconds = env_u64("AGORA_MAX_DURATION_SECONDS", config.world.max_duration_seconds);
    config.budget.max_api_cost = env_f64("AGORA_MAX_API_COST", config.budget.max_api_cost);
    config.budget.max_runtime_seconds = env_u64("AGORA_MAX_RUNTIME_SECONDS", config.budget.max_runtime_seconds);

    let duration = if config.world.max_duration_seconds > 0 {
        Some(Duration::from_secs(config.world.max_duration_seconds))
    } else {
        None
    };

    let scorer: Arc<dyn Scorer> = Arc::new(ConstantScorer(0.5));
    let driver = Arc::new(Driver::bootstrap(config, Arc::new(UnconfiguredProvider), scorer, Vec::new()).await?);

    tracing::info!("agora autonomous run starting");
    let summary = driver.run(duration).await;
    tracing::info!(
        stop_reason = ?summary.stop_reason,
        cost = summary.cumulative_api_cost,
        "agora autonomous run finished"
    );
    Ok(())
}

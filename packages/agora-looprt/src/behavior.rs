//! The agent capability: a loop's body, decoupled from the loop engine
//! itself (spec §9's mapping of the Python duck-typed "agent protocol"
//! onto an explicit interface).

use agora_artifacts::ArtifactStore;
use agora_sandbox::SandboxExecutor;
use agora_types::WakeCondition;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

/// The outcome of one `execute_action` call.
#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub success: bool,
    pub payload: Value,
    pub error: Option<String>,
}

impl ActionOutcome {
    pub fn ok(payload: Value) -> Self {
        Self { success: true, payload, error: None }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self { success: false, payload: Value::Null, error: Some(error.into()) }
    }
}

/// Implemented once per agent (decide/execute are owner-supplied
/// callbacks, spec §4.8) or once generically for artifact loops (see
/// [`ArtifactBehavior`] below, which re-invokes the artifact's own code
/// every iteration).
#[async_trait]
pub trait AgentBehavior: Send + Sync {
    /// Decide the next action, or `None` to skip this iteration without
    /// counting it as a failure.
    async fn decide_action(&self) -> Option<Value>;

    async fn execute_action(&self, action: Value) -> ActionOutcome;

    /// Whether the owning agent/artifact is still considered alive.
    /// Defaults to always-alive; loops backed by an external liveness
    /// signal (e.g. a ledger-visible kill switch) override this.
    async fn is_alive(&self) -> bool {
        true
    }

    /// Resolve an `Event`/`Resource` wake condition. `Time` conditions
    /// are resolved by the loop engine itself since they need no
    /// collaborator state; this covers the other two kinds, which the
    /// Python source resolved against the event bus and ledger
    /// respectively. Defaults to "never met" so a behavior that doesn't
    /// override this can still be woken explicitly via `Loop::wake()`.
    async fn resolve_wake(&self, _condition: &WakeCondition) -> bool {
        false
    }
}

/// The artifact-loop flavor (spec §4.8): its body is "invoke this
/// artifact's code via the sandbox executor, as its own principal." The
/// artifact is re-fetched every iteration so an in-place code update
/// takes effect on the very next loop tick.
pub struct ArtifactBehavior {
    artifact_id: String,
    artifacts: Arc<ArtifactStore>,
    executor: Arc<SandboxExecutor>,
}

impl ArtifactBehavior {
    pub fn new(artifact_id: impl Into<String>, artifacts: Arc<ArtifactStore>, executor: Arc<SandboxExecutor>) -> Self {
        Self { artifact_id: artifact_id.into(), artifacts, executor }
    }
}

#[async_trait]
impl AgentBehavior for ArtifactBehavior {
    async fn decide_action(&self) -> Option<Value> {
        // Artifact loops have no separate "decide" phase; the artifact's
        // own `run()` both decides and acts. A non-null marker keeps the
        // shared iteration protocol uniform between the two loop flavors.
        Some(json!({"invoke": self.artifact_id}))
    }

    async fn execute_action(&self, _action: Value) -> ActionOutcome {
        let Some(artifact) = self.artifacts.get(&self.artifact_id).await else {
            return ActionOutcome::failed(format!("artifact '{}' no longer exists", self.artifact_id));
        };
        let result = self.executor.execute_run(&artifact, vec![]).await;
        if result.success {
            ActionOutcome::ok(result.result.unwrap_or(Value::Null))
        } else {
            ActionOutcome::failed(result.error.unwrap_or_else(|| "execution failed".to_string()))
        }
    }

    async fn is_alive(&self) -> bool {
        self.artifacts.get(&self.artifact_id).await.is_some_and(|a| !a.deleted)
    }
}

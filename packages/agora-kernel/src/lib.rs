//! Kernel interfaces exposed to artifact code (spec §4.6).
//!
//! Two halves, injected into the sandbox under the names `kernel_state`
//! and `kernel_actions`, giving genesis and agent-built artifacts equal
//! access to the world:
//!
//! - [`KernelState`] is read-only: any artifact may inspect any
//!   principal's balance or any other artifact's metadata.
//! - [`KernelActions`] is mutating and the core's security boundary (spec
//!   §5): every call is checked against the `caller_id` supplied by the
//!   sandbox, which is itself derived from the *executing* principal, not
//!   from anything guest code can forge. A caller may only move its own
//!   resources.

use std::collections::HashMap;
use std::sync::Arc;

use agora_access::AccessControl;
use agora_artifacts::ArtifactStore;
use agora_eventlog::EventLog;
use agora_ledger::{Ledger, LedgerError};
use agora_types::{Artifact, EventType, PrincipalId};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KernelError {
    #[error("caller '{caller}' may not act on behalf of '{target}'")]
    CallerMismatch { caller: String, target: String },
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Read-only view over ledger and artifact-store state.
#[derive(Clone)]
pub struct KernelState {
    ledger: Arc<Ledger>,
    artifacts: Arc<ArtifactStore>,
    access: Arc<AccessControl>,
}

impl KernelState {
    pub fn new(ledger: Arc<Ledger>, artifacts: Arc<ArtifactStore>, access: Arc<AccessControl>) -> Self {
        Self { ledger, artifacts, access }
    }

    pub async fn get_balance(&self, id: &str) -> i64 {
        self.ledger.get_scrip(id).await
    }

    pub async fn get_resource(&self, id: &str, resource: &str) -> i64 {
        self.ledger.get_resource(id, resource).await
    }

    pub async fn list_artifacts_by_owner(&self, id: &PrincipalId) -> Vec<Artifact> {
        self.artifacts.list_by_owner(id).await
    }

    pub async fn get_artifact_metadata(&self, id: &str) -> Option<Artifact> {
        self.artifacts.get(id).await
    }

    /// Read an artifact's content, subject to its access contract. Denies
    /// return `None`; the caller distinguishes "denied" from "not found"
    /// by checking [`ArtifactStore::get`] separately if needed.
    pub async fn read_artifact(&self, id: &str, caller_id: &str) -> Option<Artifact> {
        let artifact = self.artifacts.get(id).await?;
        let result = self
            .access
            .check_permission(
                artifact.access_contract_id.as_deref(),
                caller_id,
                "read",
                id,
                &artifact.created_by,
                &json!({}),
                0,
            )
            .await;
        if result.allowed {
            Some(artifact)
        } else {
            None
        }
    }
}

/// Mutating, caller-verified kernel actions. Every method takes the
/// invoking principal as `caller_id` and refuses to debit anyone else.
#[derive(Clone)]
pub struct KernelActions {
    ledger: Arc<Ledger>,
    event_log: Arc<EventLog>,
}

impl KernelActions {
    pub fn new(ledger: Arc<Ledger>, event_log: Arc<EventLog>) -> Self {
        Self { ledger, event_log }
    }

    pub async fn transfer_scrip(&self, caller_id: &str, to: &str, amount: i64) -> Result<(), KernelError> {
        // transfer_scrip always debits `from` == the caller; there is no
        // "transfer on behalf of" shape in this kernel action, so the
        // verification is structural rather than a runtime comparison --
        // documented here because callers occasionally expect a `from`
        // parameter and are surprised it's missing.
        self.ledger.transfer_scrip(caller_id, to, amount).await?;
        Ok(())
    }

    pub async fn transfer_resource(
        &self,
        caller_id: &str,
        to: &str,
        resource: &str,
        amount: i64,
    ) -> Result<(), KernelError> {
        self.ledger.transfer_resource(caller_id, to, resource, amount).await?;
        Ok(())
    }

    /// Create a new principal. Unlike the scrip/resource transfers, the
    /// "caller acts only on itself" rule doesn't map directly -- the
    /// caller must be creating the principal with its own ID, since
    /// spawning an arbitrary ID on someone else's behalf would let one
    /// artifact mint principals under names it doesn't own.
    pub async fn create_principal(
        &self,
        caller_id: &str,
        id: &str,
        starting_scrip: i64,
    ) -> Result<(), KernelError> {
        if caller_id != id {
            return Err(KernelError::CallerMismatch {
                caller: caller_id.to_string(),
                target: id.to_string(),
            });
        }
        self.ledger.create_principal(id, starting_scrip, HashMap::new()).await?;
        self.event_log
            .append(
                EventType::Other("kernel_action".to_string()),
                json!({"action": "create_principal", "caller_id": caller_id, "id": id}),
            )
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_types::IdRegistry;

    fn harness() -> (KernelState, KernelActions, Arc<Ledger>) {
        let registry = Arc::new(IdRegistry::new());
        let event_log = Arc::new(EventLog::in_memory());
        let ledger = Arc::new(Ledger::new(registry.clone(), event_log.clone()));
        let artifacts = Arc::new(ArtifactStore::new(registry, event_log.clone()));
        let wasm = Arc::new(agora_wasmrt::WasmRuntime::new().unwrap());
        let access = Arc::new(AccessControl::new(ledger.clone(), wasm, 10));
        let state = KernelState::new(ledger.clone(), artifacts, access);
        let actions = KernelActions::new(ledger.clone(), event_log);
        (state, actions, ledger)
    }

    #[tokio::test]
    async fn state_reads_balances() {
        let (state, _, ledger) = harness();
        ledger.create_principal("alice", 50, HashMap::new()).await.unwrap();
        assert_eq!(state.get_balance("alice").await, 50);
    }

    #[tokio::test]
    async fn actions_transfer_moves_callers_own_scrip() {
        let (_, actions, ledger) = harness();
        ledger.create_principal("alice", 50, HashMap::new()).await.unwrap();
        ledger.create_principal("bob", 0, HashMap::new()).await.unwrap();

        actions.transfer_scrip("alice", "bob", 20).await.unwrap();
        assert_eq!(ledger.get_scrip("alice").await, 30);
        assert_eq!(ledger.get_scrip("bob").await, 20);
    }

    #[tokio::test]
    async fn create_principal_rejects_spawning_under_another_name() {
        let (_, actions, _ledger) = harness();
        let err = actions.create_principal("alice", "bob", 0).await.unwrap_err();
        assert!(matches!(err, KernelError::CallerMismatch { .. }));
    }

    #[tokio::test]
    async fn read_artifact_respects_private_contract() {
        let registry = Arc::new(IdRegistry::new());
        let event_log = Arc::new(EventLog::in_memory());
        let ledger = Arc::new(Ledger::new(registry.clone(), event_log.clone()));
        let artifacts = Arc::new(ArtifactStore::new(registry, event_log.clone()));
        let wasm = Arc::new(agora_wasmrt::WasmRuntime::new().unwrap());
        let access = Arc::new(AccessControl::new(ledger.clone(), wasm, 10));
        access.register("locked", agora_access::ContractKind::Private).await;

        artifacts
            .write_unchecked(agora_artifacts::WriteRequest {
                id: "secret".into(),
                created_by: "alice".into(),
                content: "shh".into(),
                access_contract_id: Some("locked".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        let state = KernelState::new(ledger, artifacts, access);
        assert!(state.read_artifact("secret", "bob").await.is_none());
        assert!(state.read_artifact("secret", "alice").await.is_some());
    }
}

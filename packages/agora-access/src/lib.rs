//! Access-control contracts (spec §4.7).
//!
//! Every permissioned operation on an artifact resolves to a contract --
//! either a fixed built-in policy or a small executable snippet run
//! through [`agora_wasmrt`] under the same restrictions as artifact code.
//! Permission chains carry a depth counter; exceeding
//! `max_contract_depth` is an automatic deny so a cycle of contracts
//! referencing each other cannot recurse forever.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use agora_ledger::Ledger;
use agora_wasmrt::WasmRuntime;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContractKind {
    /// All actions allowed at zero cost.
    Freeware,
    /// Only the target's owner may act.
    Private,
    /// Allowed if the caller's scrip balance is at least `price`.
    Paid { price: i64 },
    /// A restricted-sandbox snippet exporting `check_permission`.
    Executable { source: String },
}

#[derive(Debug, Clone)]
pub struct Contract {
    pub id: String,
    pub kind: ContractKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PermissionResult {
    pub allowed: bool,
    pub reason: String,
    #[serde(default)]
    pub cost: i64,
    #[serde(default)]
    pub conditions: Option<Value>,
}

impl PermissionResult {
    fn allow(reason: impl Into<String>, cost: i64) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
            cost,
            conditions: None,
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            cost: 0,
            conditions: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("contract '{0}' is not registered")]
    UnknownContract(String),
}

/// Registers, caches, and evaluates access-control contracts.
pub struct AccessControl {
    contracts: RwLock<HashMap<String, Contract>>,
    ledger: Arc<Ledger>,
    wasm: Arc<WasmRuntime>,
    max_contract_depth: u32,
    contract_fuel: u64,
    contract_timeout: Duration,
}

impl AccessControl {
    pub fn new(ledger: Arc<Ledger>, wasm: Arc<WasmRuntime>, max_contract_depth: u32) -> Self {
        Self {
            contracts: RwLock::new(HashMap::new()),
            ledger,
            wasm,
            max_contract_depth,
            contract_fuel: 5_000_000,
            contract_timeout: Duration::from_secs(2),
        }
    }

    pub async fn register(&self, id: impl Into<String>, kind: ContractKind) {
        let id = id.into();
        self.contracts.write().await.insert(id.clone(), Contract { id, kind });
    }

    pub async fn get(&self, id: &str) -> Option<Contract> {
        self.contracts.read().await.get(id).cloned()
    }

    /// Check whether `caller` may perform `action` on `target` (an
    /// artifact ID, or empty for actions with no single target).
    /// `owner` is the target's `created_by`, used by the `Private` kind
    /// and passed to executable contracts. `depth` is the current
    /// permission-chain depth; pass `0` at the top level.
    pub async fn check_permission(
        &self,
        contract_id: Option<&str>,
        caller: &str,
        action: &str,
        target: &str,
        owner: &str,
        context: &Value,
        depth: u32,
    ) -> PermissionResult {
        if depth >= self.max_contract_depth {
            return PermissionResult::deny(format!(
                "contract depth {depth} reached the limit of {}",
                self.max_contract_depth
            ));
        }

        let Some(contract_id) = contract_id else {
            // No contract attached: default to owner-only, the same
            // posture as the `Private` built-in.
            return self.evaluate_private(caller, owner);
        };

        let Some(contract) = self.get(contract_id).await else {
            return PermissionResult::deny(format!("contract '{contract_id}' is not registered"));
        };

        match &contract.kind {
            ContractKind::Freeware => PermissionResult::allow("freeware contract allows all actions", 0),
            ContractKind::Private => self.evaluate_private(caller, owner),
            ContractKind::Paid { price } => self.evaluate_paid(caller, *price).await,
            ContractKind::Executable { source } => {
                self.evaluate_executable(source, caller, action, target, owner, context, depth).await
            }
        }
    }

    fn evaluate_private(&self, caller: &str, owner: &str) -> PermissionResult {
        if caller == owner {
            PermissionResult::allow("owner may act on their own artifact", 0)
        } else {
            PermissionResult::deny(format!("'{caller}' is not the owner ('{owner}')"))
        }
    }

    async fn evaluate_paid(&self, caller: &str, price: i64) -> PermissionResult {
        let balance = self.ledger.get_scrip(caller).await;
        if balance >= price {
            PermissionResult::allow(format!("balance {balance} covers price {price}"), price)
        } else {
            PermissionResult::deny(format!("balance {balance} is below price {price}"))
        }
    }

    async fn evaluate_executable(
        &self,
        source: &str,
        caller: &str,
        action: &str,
        target: &str,
        owner: &str,
        context: &Value,
        depth: u32,
    ) -> PermissionResult {
        let compiled = match self.wasm.compile(source) {
            Ok(m) => m,
            Err(e) => return PermissionResult::deny(format!("contract failed to compile: {e}")),
        };
        if !compiled.declares("check_permission") {
            return PermissionResult::deny("contract does not define check_permission");
        }

        let payload = json!({
            "caller": caller,
            "action": action,
            "target": target,
            "owner": owner,
            "context": context,
            "depth": depth,
            "caller_balance": self.ledger.get_scrip(caller).await,
        });

        let result = self
            .wasm
            .call_json(
                &compiled,
                (),
                |_linker| Ok(()),
                "check_permission",
                &payload,
                self.contract_fuel,
                self.contract_timeout,
            )
            .await;

        match result {
            Ok(value) => match serde_json::from_value::<PermissionResult>(value) {
                Ok(parsed) => parsed,
                Err(_) => PermissionResult::deny("contract returned a malformed permission result"),
            },
            Err(e) => {
                tracing::warn!(error = %e, "executable contract raised an error, denying");
                PermissionResult::deny(format!("contract raised an error: {e}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_types::IdRegistry;
    use agora_eventlog::EventLog;
    use std::collections::HashMap;

    fn new_access(max_depth: u32) -> AccessControl {
        let ledger = Arc::new(Ledger::new(Arc::new(IdRegistry::new()), Arc::new(EventLog::in_memory())));
        AccessControl::new(ledger, Arc::new(WasmRuntime::new().unwrap()), max_depth)
    }

    #[tokio::test]
    async fn freeware_allows_everyone() {
        let access = new_access(10);
        access.register("open", ContractKind::Freeware).await;

        let result = access
            .check_permission(Some("open"), "bob", "write", "a1", "alice", &json!({}), 0)
            .await;
        assert!(result.allowed);
        assert_eq!(result.cost, 0);
    }

    #[tokio::test]
    async fn private_denies_non_owner() {
        let access = new_access(10);
        access.register("locked", ContractKind::Private).await;

        let result = access
            .check_permission(Some("locked"), "bob", "delete", "a1", "alice", &json!({}), 0)
            .await;
        assert!(!result.allowed);

        let result = access
            .check_permission(Some("locked"), "alice", "delete", "a1", "alice", &json!({}), 0)
            .await;
        assert!(result.allowed);
    }

    #[tokio::test]
    async fn missing_contract_defaults_to_owner_only() {
        let access = new_access(10);
        let result = access
            .check_permission(None, "bob", "delete", "a1", "alice", &json!({}), 0)
            .await;
        assert!(!result.allowed);
    }

    #[tokio::test]
    async fn depth_limit_denies_without_evaluating() {
        let access = new_access(3);
        access.register("open", ContractKind::Freeware).await;

        let result = access
            .check_permission(Some("open"), "bob", "read", "a1", "alice", &json!({}), 3)
            .await;
        assert!(!result.allowed);
        assert!(result.reason.contains('3'));
    }

    #[tokio::test]
    async fn paid_contract_checks_balance() {
        let ledger = Arc::new(Ledger::new(Arc::new(IdRegistry::new()), Arc::new(EventLog::in_memory())));
        ledger.create_principal("bob", 5, HashMap::new()).await.unwrap();
        let access = AccessControl::new(ledger, Arc::new(WasmRuntime::new().unwrap()), 10);
        access.register("toll", ContractKind::Paid { price: 10 }).await;

        let result = access
            .check_permission(Some("toll"), "bob", "invoke", "a1", "alice", &json!({}), 0)
            .await;
        assert!(!result.allowed);
    }
}

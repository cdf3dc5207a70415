//! Scrip and resource ledger (spec §4.2).
//!
//! The ledger is the sole authority on balances (spec §5): no component
//! caches mutable balance data across an `.await` point. Every mutating
//! call either succeeds entirely or leaves the ledger unchanged, and every
//! successful call is observable through the event log with a
//! `balance_after` field.

use std::collections::HashMap;
use std::sync::Arc;

use agora_eventlog::EventLog;
use agora_types::{EventType, IdCollision, IdKind, IdRegistry, PrincipalId};
use serde_json::json;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("principal '{0}' already registered under a conflicting id kind")]
    IdCollision(String),
    #[error("insufficient scrip: {id} has {balance}, needs {amount}")]
    InsufficientScrip { id: String, balance: i64, amount: i64 },
    #[error("insufficient resource '{resource}': {id} has {balance}, needs {amount}")]
    InsufficientResource {
        id: String,
        resource: String,
        balance: i64,
        amount: i64,
    },
    #[error("unknown principal '{0}'")]
    UnknownPrincipal(String),
}

impl From<IdCollision> for LedgerError {
    fn from(c: IdCollision) -> Self {
        LedgerError::IdCollision(c.id)
    }
}

struct Principal {
    scrip: i64,
    resources: HashMap<String, i64>,
}

impl Principal {
    fn new(starting_scrip: i64, starting_resources: HashMap<String, i64>) -> Self {
        Self {
            scrip: starting_scrip,
            resources: starting_resources,
        }
    }
}

/// The ledger. Cheap to clone (wraps an `Arc`); share one instance across
/// every loop, kernel action handler, and the LLM gateway.
#[derive(Clone)]
pub struct Ledger {
    principals: Arc<RwLock<HashMap<PrincipalId, Principal>>>,
    id_registry: Arc<IdRegistry>,
    event_log: Arc<EventLog>,
}

impl Ledger {
    pub fn new(id_registry: Arc<IdRegistry>, event_log: Arc<EventLog>) -> Self {
        Self {
            principals: Arc::new(RwLock::new(HashMap::new())),
            id_registry,
            event_log,
        }
    }

    /// Register `id` as a principal with zero balances if it doesn't
    /// already exist; a no-op if it does. Never fails with `IdCollision`
    /// because it doesn't assert ownership the way `create_principal`
    /// does -- used by checkpoint restore to repair drift.
    pub async fn ensure_principal(&self, id: &str) {
        let mut principals = self.principals.write().await;
        if !principals.contains_key(id) {
            let _ = self.id_registry.register(id, IdKind::Principal);
            principals.insert(id.to_string(), Principal::new(0, HashMap::new()));
        }
    }

    pub async fn create_principal(
        &self,
        id: &str,
        starting_scrip: i64,
        starting_resources: HashMap<String, i64>,
    ) -> Result<(), LedgerError> {
        self.id_registry.register(id, IdKind::Principal)?;
        let mut principals = self.principals.write().await;
        principals.insert(id.to_string(), Principal::new(starting_scrip, starting_resources));
        drop(principals);
        self.event_log
            .append(
                EventType::Other("principal_created".to_string()),
                json!({"id": id, "starting_scrip": starting_scrip}),
            )
            .await;
        Ok(())
    }

    pub async fn get_scrip(&self, id: &str) -> i64 {
        self.principals.read().await.get(id).map(|p| p.scrip).unwrap_or(0)
    }

    pub async fn get_resource(&self, id: &str, resource: &str) -> i64 {
        self.principals
            .read()
            .await
            .get(id)
            .and_then(|p| p.resources.get(resource))
            .copied()
            .unwrap_or(0)
    }

    pub async fn can_afford_scrip(&self, id: &str, amount: i64) -> bool {
        self.get_scrip(id).await >= amount
    }

    pub async fn can_spend_resource(&self, id: &str, resource: &str, amount: i64) -> bool {
        self.get_resource(id, resource).await >= amount
    }

    pub async fn credit_scrip(&self, id: &str, amount: i64) -> Result<i64, LedgerError> {
        let mut principals = self.principals.write().await;
        let principal = principals
            .entry(id.to_string())
            .or_insert_with(|| Principal::new(0, HashMap::new()));
        principal.scrip += amount;
        let balance_after = principal.scrip;
        drop(principals);
        self.event_log
            .append(
                EventType::ResourceAllocated,
                json!({"id": id, "resource": "scrip", "amount": amount, "balance_after": balance_after}),
            )
            .await;
        Ok(balance_after)
    }

    pub async fn deduct_scrip(&self, id: &str, amount: i64) -> Result<i64, LedgerError> {
        let mut principals = self.principals.write().await;
        let principal = principals
            .get_mut(id)
            .ok_or_else(|| LedgerError::UnknownPrincipal(id.to_string()))?;
        if principal.scrip < amount {
            return Err(LedgerError::InsufficientScrip {
                id: id.to_string(),
                balance: principal.scrip,
                amount,
            });
        }
        principal.scrip -= amount;
        let balance_after = principal.scrip;
        drop(principals);
        self.event_log
            .append(
                EventType::ResourceSpent,
                json!({"id": id, "resource": "scrip", "amount": amount, "balance_after": balance_after}),
            )
            .await;
        Ok(balance_after)
    }

    /// Atomic scrip transfer: either both balances move or neither does.
    pub async fn transfer_scrip(&self, from: &str, to: &str, amount: i64) -> Result<(), LedgerError> {
        if amount < 0 {
            return Err(LedgerError::InsufficientScrip {
                id: from.to_string(),
                balance: self.get_scrip(from).await,
                amount,
            });
        }
        let mut principals = self.principals.write().await;
        let from_balance = principals
            .get(from)
            .ok_or_else(|| LedgerError::UnknownPrincipal(from.to_string()))?
            .scrip;
        if from_balance < amount {
            return Err(LedgerError::InsufficientScrip {
                id: from.to_string(),
                balance: from_balance,
                amount,
            });
        }
        // both parties confirmed present/sufficient before any mutation.
        principals.get_mut(from).unwrap().scrip -= amount;
        let to_principal = principals
            .entry(to.to_string())
            .or_insert_with(|| Principal::new(0, HashMap::new()));
        to_principal.scrip += amount;
        let to_after = to_principal.scrip;
        let from_after = principals.get(from).unwrap().scrip;
        drop(principals);

        self.event_log
            .append(
                EventType::Other("transfer_success".to_string()),
                json!({
                    "from": from, "to": to, "amount": amount,
                    "from_balance_after": from_after, "to_balance_after": to_after,
                }),
            )
            .await;
        Ok(())
    }

    pub async fn set_resource(&self, id: &str, resource: &str, amount: i64) -> Result<i64, LedgerError> {
        let mut principals = self.principals.write().await;
        let principal = principals
            .entry(id.to_string())
            .or_insert_with(|| Principal::new(0, HashMap::new()));
        principal.resources.insert(resource.to_string(), amount);
        let balance_after = amount;
        drop(principals);
        self.event_log
            .append(
                EventType::ResourceAllocated,
                json!({"id": id, "resource": resource, "balance_after": balance_after}),
            )
            .await;
        Ok(balance_after)
    }

    pub async fn credit_resource(&self, id: &str, resource: &str, amount: i64) -> Result<i64, LedgerError> {
        let mut principals = self.principals.write().await;
        let principal = principals
            .entry(id.to_string())
            .or_insert_with(|| Principal::new(0, HashMap::new()));
        let entry = principal.resources.entry(resource.to_string()).or_insert(0);
        *entry += amount;
        let balance_after = *entry;
        drop(principals);
        self.event_log
            .append(
                EventType::ResourceAllocated,
                json!({"id": id, "resource": resource, "amount": amount, "balance_after": balance_after}),
            )
            .await;
        Ok(balance_after)
    }

    pub async fn spend_resource(&self, id: &str, resource: &str, amount: i64) -> Result<i64, LedgerError> {
        let mut principals = self.principals.write().await;
        let principal = principals
            .get_mut(id)
            .ok_or_else(|| LedgerError::UnknownPrincipal(id.to_string()))?;
        let balance = principal.resources.entry(resource.to_string()).or_insert(0);
        if *balance < amount {
            return Err(LedgerError::InsufficientResource {
                id: id.to_string(),
                resource: resource.to_string(),
                balance: *balance,
                amount,
            });
        }
        *balance -= amount;
        let balance_after = *balance;
        drop(principals);
        self.event_log
            .append(
                EventType::ResourceSpent,
                json!({"id": id, "resource": resource, "amount": amount, "balance_after": balance_after}),
            )
            .await;
        Ok(balance_after)
    }

    pub async fn transfer_resource(
        &self,
        from: &str,
        to: &str,
        resource: &str,
        amount: i64,
    ) -> Result<(), LedgerError> {
        let mut principals = self.principals.write().await;
        let from_balance = principals
            .get(from)
            .ok_or_else(|| LedgerError::UnknownPrincipal(from.to_string()))?
            .resources
            .get(resource)
            .copied()
            .unwrap_or(0);
        if from_balance < amount {
            return Err(LedgerError::InsufficientResource {
                id: from.to_string(),
                resource: resource.to_string(),
                balance: from_balance,
                amount,
            });
        }
        *principals.get_mut(from).unwrap().resources.entry(resource.to_string()).or_insert(0) -= amount;
        let to_principal = principals
            .entry(to.to_string())
            .or_insert_with(|| Principal::new(0, HashMap::new()));
        *to_principal.resources.entry(resource.to_string()).or_insert(0) += amount;
        drop(principals);

        self.event_log
            .append(
                EventType::Other("resource_transfer_success".to_string()),
                json!({"from": from, "to": to, "resource": resource, "amount": amount}),
            )
            .await;
        Ok(())
    }

    /// Snapshot of every principal's scrip balance, for checkpoints and
    /// startup logging.
    pub async fn get_all_scrip(&self) -> HashMap<PrincipalId, i64> {
        self.principals
            .read()
            .await
            .iter()
            .map(|(id, p)| (id.clone(), p.scrip))
            .collect()
    }

    /// Whether a principal is already registered (used by the checkpoint
    /// restore's invariant-S sweep, see agora-checkpoint).
    pub async fn contains(&self, id: &str) -> bool {
        self.principals.read().await.contains_key(id)
    }

    /// Insert a principal entry directly without going through the ID
    /// registry -- used only by checkpoint restore to repair drift where
    /// an artifact has `has_standing=true` but no ledger entry, bypassing
    /// `create_principal`'s registry check (spec §4.11).
    pub async fn insert_raw(&self, id: &str, scrip: i64) {
        let mut principals = self.principals.write().await;
        principals.entry(id.to_string()).or_insert_with(|| Principal::new(scrip, HashMap::new()));
    }

    /// Full scrip + resource snapshot of every principal, for
    /// `agora-checkpoint` to serialize.
    pub async fn snapshot_balances(&self) -> HashMap<PrincipalId, (i64, HashMap<String, i64>)> {
        self.principals
            .read()
            .await
            .iter()
            .map(|(id, p)| (id.clone(), (p.scrip, p.resources.clone())))
            .collect()
    }

    /// Rehydrates one principal's full balance from a checkpoint, bypassing
    /// the ID registry the same way [`Self::insert_raw`] does -- restore
    /// runs before any `create_principal` calls for the run, so there is
    /// nothing yet registered to collide with.
    pub async fn restore_principal(&self, id: &str, scrip: i64, resources: HashMap<String, i64>) {
        let _ = self.id_registry.register(id, IdKind::Principal);
        let mut principals = self.principals.write().await;
        principals.insert(id.to_string(), Principal::new(scrip, resources));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_ledger() -> Ledger {
        Ledger::new(Arc::new(IdRegistry::new()), Arc::new(EventLog::in_memory()))
    }

    #[tokio::test]
    async fn transfer_moves_scrip_atomically() {
        let ledger = new_ledger();
        ledger.create_principal("alice", 100, HashMap::new()).await.unwrap();
        ledger.create_principal("bob", 100, HashMap::new()).await.unwrap();

        ledger.transfer_scrip("alice", "bob", 30).await.unwrap();

        assert_eq!(ledger.get_scrip("alice").await, 70);
        assert_eq!(ledger.get_scrip("bob").await, 130);
    }

    #[tokio::test]
    async fn transfer_rejects_insufficient_balance_leaving_state_unchanged() {
        let ledger = new_ledger();
        ledger.create_principal("alice", 10, HashMap::new()).await.unwrap();
        ledger.create_principal("bob", 0, HashMap::new()).await.unwrap();

        let result = ledger.transfer_scrip("alice", "bob", 50).await;

        assert!(result.is_err());
        assert_eq!(ledger.get_scrip("alice").await, 10);
        assert_eq!(ledger.get_scrip("bob").await, 0);
    }

    #[tokio::test]
    async fn deduct_never_goes_negative() {
        let ledger = new_ledger();
        ledger.create_principal("alice", 5, HashMap::new()).await.unwrap();
        let err = ledger.deduct_scrip("alice", 10).await.unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientScrip { .. }));
        assert_eq!(ledger.get_scrip("alice").await, 5);
    }

    #[tokio::test]
    async fn create_principal_conflicts_with_existing_artifact_id() {
        let registry = Arc::new(IdRegistry::new());
        registry.register("thing-1", IdKind::Artifact).unwrap();
        let ledger = Ledger::new(registry, Arc::new(EventLog::in_memory()));

        let result = ledger.create_principal("thing-1", 0, HashMap::new()).await;
        assert!(matches!(result, Err(LedgerError::IdCollision(_))));
    }

    #[tokio::test]
    async fn resource_spend_respects_balance() {
        let ledger = new_ledger();
        ledger.create_principal("alice", 0, HashMap::new()).await.unwrap();
        ledger.credit_resource("alice", "llm_budget", 100).await.unwrap();

        ledger.spend_resource("alice", "llm_budget", 40).await.unwrap();
        assert_eq!(ledger.get_resource("alice", "llm_budget").await, 60);

        let err = ledger.spend_resource("alice", "llm_budget", 1000).await.unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientResource { .. }));
    }
}

//! Content-addressed artifact store (spec §4.4).
//!
//! Writes create or update depending on whether the ID already exists;
//! deletes are tombstones, never a true removal, so the event log and any
//! in-flight readers stay consistent. ID registration goes through the
//! shared `IdRegistry` (also used by `agora-ledger`) so a principal ID can
//! never collide with an unrelated artifact ID.

use std::collections::HashMap;
use std::sync::Arc;

use agora_access::AccessControl;
use agora_eventlog::EventLog;
use agora_types::{Artifact, ArtifactKind, EventType, IdCollision, IdKind, IdRegistry, PrincipalId};
use serde_json::json;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ArtifactStoreError {
    #[error("artifact id '{0}' already registered under a conflicting id kind")]
    IdCollision(String),
    #[error("artifact '{0}' not found")]
    NotFound(String),
    #[error("'{caller}' is not permitted to modify artifact '{id}' owned by '{owner}'")]
    NotOwner { id: String, owner: String, caller: String },
    #[error("'{caller}' was denied write access to '{id}': {reason}")]
    PermissionDenied { id: String, caller: String, reason: String },
}

impl From<IdCollision> for ArtifactStoreError {
    fn from(c: IdCollision) -> Self {
        ArtifactStoreError::IdCollision(c.id)
    }
}

/// Parameters for `ArtifactStore::write`. All fields beyond `id`/`content`/
/// `created_by` are optional and default to the artifact's current value
/// on update, or to a fresh default on create.
#[derive(Debug, Clone, Default)]
pub struct WriteRequest {
    pub id: String,
    pub created_by: String,
    pub content: String,
    pub kind: Option<ArtifactKind>,
    pub code: Option<String>,
    pub executable: Option<bool>,
    pub capabilities: Option<Vec<String>>,
    pub access_contract_id: Option<String>,
    pub has_standing: Option<bool>,
    pub has_loop: Option<bool>,
    pub genesis_methods: Option<HashMap<String, String>>,
}

pub struct ArtifactStore {
    artifacts: Arc<RwLock<HashMap<String, Artifact>>>,
    id_registry: Arc<IdRegistry>,
    event_log: Arc<EventLog>,
}

impl ArtifactStore {
    pub fn new(id_registry: Arc<IdRegistry>, event_log: Arc<EventLog>) -> Self {
        Self {
            artifacts: Arc::new(RwLock::new(HashMap::new())),
            id_registry,
            event_log,
        }
    }

    /// Creates or updates an artifact, subject to the target's access
    /// contract (spec §4.4, §4.7). For an existing artifact, `caller` is
    /// checked against `access_control` as a `"write"` action with the
    /// artifact's current owner and contract; a denial leaves the store
    /// untouched. A fresh artifact has no contract yet, so `caller`
    /// stands in as its own owner for the check -- it always passes.
    pub async fn write(
        &self,
        req: WriteRequest,
        caller: &str,
        access_control: &AccessControl,
    ) -> Result<Artifact, ArtifactStoreError> {
        let existing = self.artifacts.read().await.get(&req.id).cloned();
        let owner = existing.as_ref().map(|a| a.created_by.clone()).unwrap_or_else(|| caller.to_string());
        let contract_id = existing.as_ref().and_then(|a| a.access_contract_id.clone());

        let permission = access_control
            .check_permission(contract_id.as_deref(), caller, "write", &req.id, &owner, &json!({}), 0)
            .await;
        if !permission.allowed {
            tracing::warn!(id = %req.id, caller = %caller, reason = %permission.reason, "write denied by access contract");
            return Err(ArtifactStoreError::PermissionDenied {
                id: req.id,
                caller: caller.to_string(),
                reason: permission.reason,
            });
        }

        self.write_unchecked(req).await
    }

    /// Writes without an access-control check. Reserved for trusted,
    /// administrative callers that aren't acting on behalf of an external
    /// caller -- bootstrap seeding and checkpoint restore -- since neither
    /// has a caller identity to check permission against and restore must
    /// succeed regardless of any contract a restored artifact carries.
    pub async fn write_unchecked(&self, req: WriteRequest) -> Result<Artifact, ArtifactStoreError> {
        self.id_registry.register(&req.id, IdKind::Artifact)?;

        let mut artifacts = self.artifacts.write().await;
        let artifact = match artifacts.get(&req.id) {
            Some(existing) => {
                let mut updated = existing.clone();
                updated.content = req.content.clone();
                if let Some(kind) = req.kind.clone() {
                    updated.kind = kind;
                }
                if let Some(code) = req.code.clone() {
                    updated.code = Some(code);
                }
                if let Some(executable) = req.executable {
                    updated.executable = executable;
                }
                if let Some(caps) = req.capabilities.clone() {
                    updated.capabilities = caps.into_iter().collect();
                }
                if let Some(contract) = req.access_contract_id.clone() {
                    updated.access_contract_id = Some(contract);
                }
                if let Some(standing) = req.has_standing {
                    updated.has_standing = standing;
                }
                if let Some(has_loop) = req.has_loop {
                    updated.has_loop = has_loop;
                }
                if let Some(methods) = req.genesis_methods.clone() {
                    updated.genesis_methods = Some(methods);
                }
                updated
            }
            None => {
                let mut artifact = Artifact::new(&req.id, &req.created_by, &req.content);
                artifact.kind = req.kind.clone().unwrap_or(ArtifactKind::Data);
                artifact.code = req.code.clone();
                artifact.executable = req.executable.unwrap_or(artifact.code.is_some());
                artifact.capabilities = req.capabilities.clone().unwrap_or_default().into_iter().collect();
                artifact.access_contract_id = req.access_contract_id.clone();
                artifact.has_standing = req.has_standing.unwrap_or(false);
                artifact.has_loop = req.has_loop.unwrap_or(false);
                artifact.genesis_methods = req.genesis_methods.clone();
                artifact
            }
        };
        artifacts.insert(req.id.clone(), artifact.clone());
        drop(artifacts);

        self.event_log
            .append(
                EventType::Other("write_artifact_success".to_string()),
                json!({"id": req.id, "created_by": req.created_by}),
            )
            .await;
        Ok(artifact)
    }

    pub async fn get(&self, id: &str) -> Option<Artifact> {
        let artifacts = self.artifacts.read().await;
        artifacts.get(id).filter(|a| !a.deleted).cloned()
    }

    pub async fn list_all(&self) -> Vec<Artifact> {
        self.artifacts.read().await.values().filter(|a| !a.deleted).cloned().collect()
    }

    pub async fn list_by_owner(&self, owner: &PrincipalId) -> Vec<Artifact> {
        self.artifacts
            .read()
            .await
            .values()
            .filter(|a| !a.deleted && &a.created_by == owner)
            .cloned()
            .collect()
    }

    /// Tombstone an artifact. `caller` must be the owner.
    pub async fn delete(&self, id: &str, caller: &str) -> Result<(), ArtifactStoreError> {
        let mut artifacts = self.artifacts.write().await;
        let artifact = artifacts.get_mut(id).ok_or_else(|| ArtifactStoreError::NotFound(id.to_string()))?;
        if artifact.created_by != caller {
            return Err(ArtifactStoreError::NotOwner {
                id: id.to_string(),
                owner: artifact.created_by.clone(),
                caller: caller.to_string(),
            });
        }
        artifact.deleted = true;
        drop(artifacts);

        self.event_log
            .append(
                EventType::Other("delete_artifact_success".to_string()),
                json!({"id": id, "caller": caller}),
            )
            .await;
        Ok(())
    }

    pub async fn count(&self) -> usize {
        self.artifacts.read().await.values().filter(|a| !a.deleted).count()
    }

    /// Artifact IDs eligible for an artifact loop: `has_loop=true` and
    /// non-empty code. Entries with `has_loop=true` but no code are
    /// file-backed agents managed by an external collaborator and are
    /// skipped here (spec Open Question #2).
    pub async fn discover_loop_candidates(&self) -> Vec<String> {
        self.artifacts
            .read()
            .await
            .values()
            .filter(|a| !a.deleted && a.has_loop && a.code.as_deref().is_some_and(|c| !c.is_empty()))
            .map(|a| a.id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_access::ContractKind;
    use agora_ledger::Ledger;

    fn new_store() -> ArtifactStore {
        ArtifactStore::new(Arc::new(IdRegistry::new()), Arc::new(EventLog::in_memory()))
    }

    fn new_access(ledger: Arc<Ledger>) -> AccessControl {
        AccessControl::new(ledger, Arc::new(agora_wasmrt::WasmRuntime::new().unwrap()), 10)
    }

    #[tokio::test]
    async fn write_then_get_round_trips() {
        let store = new_store();
        let req = WriteRequest {
            id: "a1".into(),
            created_by: "alice".into(),
            content: "hello".into(),
            ..Default::default()
        };
        store.write_unchecked(req).await.unwrap();

        let artifact = store.get("a1").await.unwrap();
        assert_eq!(artifact.content, "hello");
        assert_eq!(artifact.created_by, "alice");
    }

    #[tokio::test]
    async fn delete_requires_ownership() {
        let store = new_store();
        store
            .write_unchecked(WriteRequest {
                id: "a1".into(),
                created_by: "alice".into(),
                content: "x".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let result = store.delete("a1", "bob").await;
        assert!(matches!(result, Err(ArtifactStoreError::NotOwner { .. })));
        assert!(store.get("a1").await.is_some());

        store.delete("a1", "alice").await.unwrap();
        assert!(store.get("a1").await.is_none());
    }

    #[tokio::test]
    async fn id_collision_with_existing_principal() {
        let registry = Arc::new(IdRegistry::new());
        registry.register("shared-id", IdKind::Principal).unwrap();
        let store = ArtifactStore::new(registry, Arc::new(EventLog::in_memory()));

        let result = store
            .write_unchecked(WriteRequest {
                id: "shared-id".into(),
                created_by: "alice".into(),
                content: "x".into(),
                ..Default::default()
            })
            .await;
        assert!(matches!(result, Err(ArtifactStoreError::IdCollision(_))));
    }

    #[tokio::test]
    async fn discover_loop_candidates_skips_codeless_entries() {
        let store = new_store();
        store
            .write_unchecked(WriteRequest {
                id: "with-code".into(),
                created_by: "alice".into(),
                content: "".into(),
                code: Some("def run(): pass".into()),
                has_loop: Some(true),
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .write_unchecked(WriteRequest {
                id: "file-backed".into(),
                created_by: "alice".into(),
                content: "".into(),
                has_loop: Some(true),
                ..Default::default()
            })
            .await
            .unwrap();

        let discovered = store.discover_loop_candidates().await;
        assert_eq!(discovered, vec!["with-code".to_string()]);
    }

    #[tokio::test]
    async fn write_allows_the_owner() {
        let registry = Arc::new(IdRegistry::new());
        let event_log = Arc::new(EventLog::in_memory());
        let ledger = Arc::new(Ledger::new(registry.clone(), event_log.clone()));
        let store = ArtifactStore::new(registry, event_log);
        let access = new_access(ledger);

        let req = WriteRequest {
            id: "a1".into(),
            created_by: "alice".into(),
            content: "hello".into(),
            ..Default::default()
        };
        store.write(req, "alice", &access).await.unwrap();
        assert_eq!(store.get("a1").await.unwrap().content, "hello");
    }

    /// Seed Scenario D: an executable contract denying all writes to
    /// alice's artifact must deny bob's write attempt with no state
    /// change.
    #[tokio::test]
    async fn write_denies_a_non_owner_blocked_by_an_executable_contract() {
        let registry = Arc::new(IdRegistry::new());
        let event_log = Arc::new(EventLog::in_memory());
        let ledger = Arc::new(Ledger::new(registry.clone(), event_log.clone()));
        let store = ArtifactStore::new(registry, event_log);
        let access = new_access(ledger);
        const DENY_ALL_WAT: &str = r#"
            (module
                (memory (export "memory") 1)
                (data (i32.const 0) "{\"allowed\":false,\"reason\":\"deny\"}")
                (func (export "alloc") (param i32) (result i32)
                    i32.const 4096)
                (func (export "check_permission") (param i32 i32) (result i64)
                    i64.const 33))
        "#;
        access
            .register(
                "deny-all",
                ContractKind::Executable {
                    source: DENY_ALL_WAT.to_string(),
                },
            )
            .await;

        store
            .write_unchecked(WriteRequest {
                id: "secret".into(),
                created_by: "alice".into(),
                content: "original".into(),
                access_contract_id: Some("deny-all".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        let result = store
            .write(
                WriteRequest {
                    id: "secret".into(),
                    created_by: "alice".into(),
                    content: "tampered".into(),
                    access_contract_id: Some("deny-all".into()),
                    ..Default::default()
                },
                "bob",
                &access,
            )
            .await;

        assert!(matches!(result, Err(ArtifactStoreError::PermissionDenied { .. })));
        assert_eq!(store.get("secret").await.unwrap().content, "original");
    }
}

//! Checkpoint document, save, and restore (spec §4.11 checkpoint half, §6).
//!
//! A checkpoint is a single structured document capturing everything the
//! ledger, artifact store, and cost tracker need to resume a run: balances
//! (scrip + resources per principal), every artifact with its flags and
//! metadata, the event log's next sequence number, cumulative API spend,
//! the set of known agent IDs, and a free-form reason tag recording why
//! the checkpoint was taken.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use agora_artifacts::{ArtifactStore, WriteRequest};
use agora_eventlog::EventLog;
use agora_ledger::Ledger;
use agora_llmgate::{dollars_to_budget_units, ApiCostTracker};
use agora_types::{Artifact, ArtifactKind, EventType, PrincipalId};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("failed to read checkpoint file: {0}")]
    Read(#[source] std::io::Error),
    #[error("failed to write checkpoint file: {0}")]
    Write(#[source] std::io::Error),
    #[error("failed to serialize checkpoint: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to deserialize checkpoint: {0}")]
    Deserialize(#[source] serde_json::Error),
}

/// One principal's balance row in a checkpoint (spec §6: `{scrip,
/// resources?}`). `resources` is omitted on the wire when empty, matching
/// the spec's "resources?" optional marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceRecord {
    pub scrip: i64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub resources: HashMap<String, i64>,
}

/// An artifact row in a checkpoint, carrying every flag and metadata
/// field enumerated in spec §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub id: String,
    pub kind: ArtifactKind,
    pub created_by: PrincipalId,
    pub content: String,
    pub code: Option<String>,
    pub executable: bool,
    pub has_standing: bool,
    pub has_loop: bool,
    pub deleted: bool,
    pub capabilities: Vec<String>,
    pub access_contract_id: Option<String>,
    pub genesis_methods: Option<HashMap<String, String>>,
}

impl From<Artifact> for ArtifactRecord {
    fn from(a: Artifact) -> Self {
        Self {
            id: a.id,
            kind: a.kind,
            created_by: a.created_by,
            content: a.content,
            code: a.code,
            executable: a.executable,
            has_standing: a.has_standing,
            has_loop: a.has_loop,
            deleted: a.deleted,
            capabilities: a.capabilities.into_iter().collect(),
            access_contract_id: a.access_contract_id,
            genesis_methods: a.genesis_methods,
        }
    }
}

/// The checkpoint document itself (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub event_number: u64,
    pub balances: HashMap<PrincipalId, BalanceRecord>,
    pub cumulative_api_cost: f64,
    pub artifacts: Vec<ArtifactRecord>,
    pub agent_ids: Vec<PrincipalId>,
    pub reason: String,
}

/// Assembles a [`Checkpoint`] from the live components. `agent_ids` is
/// supplied by the caller (the driver knows which loops are agent loops
/// versus artifact loops; this crate has no opinion on that distinction).
pub async fn save(
    event_log: &EventLog,
    ledger: &Ledger,
    artifacts: &ArtifactStore,
    cost_tracker: &ApiCostTracker,
    agent_ids: Vec<PrincipalId>,
    reason: impl Into<String>,
) -> Checkpoint {
    let balances = ledger
        .snapshot_balances()
        .await
        .into_iter()
        .map(|(id, (scrip, resources))| (id, BalanceRecord { scrip, resources }))
        .collect();

    let artifact_records = artifacts.list_all().await.into_iter().map(ArtifactRecord::from).collect();

    Checkpoint {
        event_number: event_log.len().await as u64,
        balances,
        cumulative_api_cost: cost_tracker.total_dollars(),
        artifacts: artifact_records,
        agent_ids,
        reason: reason.into(),
    }
}

/// Serializes `checkpoint` as pretty JSON to `path`, replacing any
/// existing file at that path.
pub fn write_to_file(checkpoint: &Checkpoint, path: impl AsRef<Path>) -> Result<(), CheckpointError> {
    let text = serde_json::to_string_pretty(checkpoint).map_err(CheckpointError::Serialize)?;
    std::fs::write(path, text).map_err(CheckpointError::Write)
}

/// Reads and parses a checkpoint document from `path`.
pub fn read_from_file(path: impl AsRef<Path>) -> Result<Checkpoint, CheckpointError> {
    let text = std::fs::read_to_string(path).map_err(CheckpointError::Read)?;
    serde_json::from_str(&text).map_err(CheckpointError::Deserialize)
}

/// Rehydrates `ledger` and `artifacts` from `checkpoint`, then runs the
/// invariant-S repair sweep (spec §4.11): for every ledger principal not
/// in `system_principals`, if a matching artifact exists with
/// `has_standing=false`, flip it true; conversely, for every artifact
/// with `has_standing=true` lacking a ledger entry, insert a zero-scrip
/// entry directly (bypassing `create_principal`, which would reject an
/// ID the artifact store already owns). Any other mismatch -- a
/// non-system principal with no corresponding artifact at all, or an
/// artifact/ledger pair that plain creation could not have produced --
/// is logged as a soft invariant violation rather than treated as fatal.
pub async fn restore(
    checkpoint: &Checkpoint,
    ledger: &Ledger,
    artifacts: &ArtifactStore,
    cost_tracker: &ApiCostTracker,
    system_principals: &HashSet<String>,
) {
    for (id, balance) in &checkpoint.balances {
        ledger.restore_principal(id, balance.scrip, balance.resources.clone()).await;
    }

    for record in &checkpoint.artifacts {
        let req = WriteRequest {
            id: record.id.clone(),
            created_by: record.created_by.clone(),
            content: record.content.clone(),
            kind: Some(record.kind.clone()),
            code: record.code.clone(),
            executable: Some(record.executable),
            capabilities: Some(record.capabilities.clone()),
            access_contract_id: record.access_contract_id.clone(),
            has_standing: Some(record.has_standing),
            has_loop: Some(record.has_loop),
            genesis_methods: record.genesis_methods.clone(),
        };
        if let Err(err) = artifacts.write_unchecked(req).await {
            tracing::warn!(id = %record.id, error = %err, "checkpoint restore: failed to rehydrate artifact");
        }
        if record.deleted {
            let _ = artifacts.delete(&record.id, &record.created_by).await;
        }
    }

    let restore_units = dollars_to_budget_units(checkpoint.cumulative_api_cost);
    if restore_units > 0 {
        cost_tracker.track(checkpoint.cumulative_api_cost);
    }

    enforce_standing_ledger_invariant(checkpoint, ledger, artifacts, system_principals).await;
}

async fn enforce_standing_ledger_invariant(
    checkpoint: &Checkpoint,
    ledger: &Ledger,
    artifacts: &ArtifactStore,
    system_principals: &HashSet<String>,
) {
    for id in checkpoint.balances.keys() {
        if system_principals.contains(id) {
            continue;
        }
        match artifacts.get(id).await {
            Some(artifact) if !artifact.has_standing => {
                let mut req = WriteRequest {
                    id: artifact.id.clone(),
                    created_by: artifact.created_by.clone(),
                    content: artifact.content.clone(),
                    kind: Some(artifact.kind.clone()),
                    code: artifact.code.clone(),
                    executable: Some(artifact.executable),
                    capabilities: Some(artifact.capabilities.into_iter().collect()),
                    access_contract_id: artifact.access_contract_id.clone(),
                    has_standing: Some(true),
                    has_loop: Some(artifact.has_loop),
                    genesis_methods: artifact.genesis_methods.clone(),
                };
                req.has_standing = Some(true);
                if let Err(err) = artifacts.write_unchecked(req).await {
                    tracing::warn!(id = %id, error = %err, "invariant-S repair: failed to set has_standing");
                }
            }
            Some(_) => {}
            None => {
                tracing::warn!(
                    id = %id,
                    "checkpoint restore: invariant S violated, ledger principal has no artifact and is not a system principal"
                );
            }
        }
    }

    for record in &checkpoint.artifacts {
        if record.deleted || !record.has_standing {
            continue;
        }
        if !ledger.contains(&record.id).await {
            ledger.restore_principal(&record.id, 0, HashMap::new()).await;
        }
    }
}

/// Emits a `checkpoint` event describing a save, for the event log.
pub async fn log_checkpoint_event(event_log: &EventLog, checkpoint: &Checkpoint) {
    event_log
        .append(
            EventType::Other("checkpoint".to_string()),
            json!({
                "event_number": checkpoint.event_number,
                "reason": checkpoint.reason,
                "principal_count": checkpoint.balances.len(),
                "artifact_count": checkpoint.artifacts.len(),
            }),
        )
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_types::IdRegistry;
    use std::sync::Arc;
    use tempfile_shim::temp_path;

    mod tempfile_shim {
        use std::time::{SystemTime, UNIX_EPOCH};

        pub fn temp_path(name: &str) -> std::path::PathBuf {
            let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
            std::env::temp_dir().join(format!("agora-checkpoint-test-{name}-{nanos}.json"))
        }
    }

    async fn harness() -> (Arc<Ledger>, Arc<ArtifactStore>, Arc<EventLog>, Arc<ApiCostTracker>) {
        let registry = Arc::new(IdRegistry::new());
        let event_log = Arc::new(EventLog::in_memory());
        let ledger = Arc::new(Ledger::new(registry.clone(), event_log.clone()));
        let artifacts = Arc::new(ArtifactStore::new(registry, event_log.clone()));
        let cost_tracker = Arc::new(ApiCostTracker::new());
        (ledger, artifacts, event_log, cost_tracker)
    }

    #[tokio::test]
    async fn save_then_restore_round_trips_balances_and_artifacts() {
        let (ledger, artifacts, event_log, cost_tracker) = harness().await;
        ledger.create_principal("alice", 500, HashMap::from([("llm_budget".to_string(), 1000)])).await.unwrap();
        artifacts
            .write_unchecked(WriteRequest {
                id: "alice".into(),
                created_by: "alice".into(),
                content: "agent alice".into(),
                has_standing: Some(true),
                ..Default::default()
            })
            .await
            .unwrap();
        cost_tracker.track(1.25);
        event_log.append(EventType::Tick, json!({})).await;

        let checkpoint = save(&event_log, &ledger, &artifacts, &cost_tracker, vec!["alice".into()], "periodic").await;
        assert_eq!(checkpoint.balances.get("alice").unwrap().scrip, 500);
        assert_eq!(checkpoint.artifacts.len(), 1);

        let path = temp_path("roundtrip");
        write_to_file(&checkpoint, &path).unwrap();
        let read_back = read_from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(read_back.balances.get("alice").unwrap().scrip, 500);

        let (ledger2, artifacts2, _log2, cost_tracker2) = harness().await;
        restore(&read_back, &ledger2, &artifacts2, &cost_tracker2, &HashSet::new()).await;
        assert_eq!(ledger2.get_scrip("alice").await, 500);
        assert_eq!(ledger2.get_resource("alice", "llm_budget").await, 1000);
        assert!(artifacts2.get("alice").await.unwrap().has_standing);
        assert!(cost_tracker2.total_dollars() > 1.0);
    }

    #[tokio::test]
    async fn restore_repairs_artifact_missing_standing_flag() {
        let (ledger, artifacts, event_log, cost_tracker) = harness().await;
        ledger.create_principal("bob", 10, HashMap::new()).await.unwrap();
        artifacts
            .write_unchecked(WriteRequest {
                id: "bob".into(),
                created_by: "bob".into(),
                content: String::new(),
                has_standing: Some(false),
                ..Default::default()
            })
            .await
            .unwrap();

        let checkpoint = save(&event_log, &ledger, &artifacts, &cost_tracker, vec!["bob".into()], "test").await;

        let (ledger2, artifacts2, _log2, cost_tracker2) = harness().await;
        restore(&checkpoint, &ledger2, &artifacts2, &cost_tracker2, &HashSet::new()).await;

        assert!(artifacts2.get("bob").await.unwrap().has_standing);
    }

    #[tokio::test]
    async fn restore_inserts_zero_scrip_entry_for_standing_artifact_without_ledger_row() {
        let (ledger, artifacts, event_log, cost_tracker) = harness().await;
        artifacts
            .write_unchecked(WriteRequest {
                id: "orphan".into(),
                created_by: "orphan".into(),
                content: String::new(),
                has_standing: Some(true),
                ..Default::default()
            })
            .await
            .unwrap();

        let checkpoint = save(&event_log, &ledger, &artifacts, &cost_tracker, vec![], "test").await;
        assert!(!checkpoint.balances.contains_key("orphan"));

        let (ledger2, artifacts2, _log2, cost_tracker2) = harness().await;
        restore(&checkpoint, &ledger2, &artifacts2, &cost_tracker2, &HashSet::new()).await;

        assert!(ledger2.contains("orphan").await);
        assert_eq!(ledger2.get_scrip("orphan").await, 0);
    }

    #[tokio::test]
    async fn system_principals_are_exempt_from_standing_repair() {
        let (ledger, artifacts, event_log, cost_tracker) = harness().await;
        ledger.create_principal("kernel_llm_gateway", 0, HashMap::new()).await.unwrap();
        let checkpoint = save(&event_log, &ledger, &artifacts, &cost_tracker, vec![], "test").await;

        let (ledger2, artifacts2, _log2, cost_tracker2) = harness().await;
        let mut system = HashSet::new();
        system.insert("kernel_llm_gateway".to_string());
        restore(&checkpoint, &ledger2, &artifacts2, &cost_tracker2, &system).await;

        assert!(artifacts2.get("kernel_llm_gateway").await.is_none());
    }
}

//! The append-only event record shared by the event log and every writer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reserved event type tags (spec §6). Anything not listed is carried as
/// `Other` so callers can still log ad-hoc diagnostics through the same
/// sink without the type needing a workspace-wide enum change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Thinking,
    ThinkingFailed,
    Action,
    ResourceConsumed,
    ResourceAllocated,
    ResourceSpent,
    AgentState,
    Tick,
    MintAuction,
    BudgetPause,
    IntentRejected,
    Other(String),
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventType::Thinking => write!(f, "thinking"),
            EventType::ThinkingFailed => write!(f, "thinking_failed"),
            EventType::Action => write!(f, "action"),
            EventType::ResourceConsumed => write!(f, "resource_consumed"),
            EventType::ResourceAllocated => write!(f, "resource_allocated"),
            EventType::ResourceSpent => write!(f, "resource_spent"),
            EventType::AgentState => write!(f, "agent_state"),
            EventType::Tick => write!(f, "tick"),
            EventType::MintAuction => write!(f, "mint_auction"),
            EventType::BudgetPause => write!(f, "budget_pause"),
            EventType::IntentRejected => write!(f, "intent_rejected"),
            EventType::Other(s) => write!(f, "{s}"),
        }
    }
}

/// A single immutable record in the append-only log. `sequence` is assigned
/// by the log at append time and is never reused (spec §3, §4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub payload: Value,
}

impl Event {
    pub fn new(sequence: u64, event_type: EventType, payload: Value) -> Self {
        Self {
            sequence,
            timestamp: Utc::now(),
            event_type,
            payload,
        }
    }
}

//! Append-only event log (spec §4.1).
//!
//! The log is the single source of truth for ordering: every other
//! component (ledger, rate limiter, loop engine, supervisor, auction)
//! derives its own state from calls it makes, but observers reconstruct
//! history only from here. `sequence` is assigned at append time and never
//! reused, even across a process restart reading back an existing sink
//! file (the next sequence picks up from the highest value seen).

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use agora_types::{Event, EventType};
use serde_json::Value;
use tokio::sync::Mutex;

/// Append-only, ordered sink of [`Event`]s.
///
/// Writes are serialized through an internal mutex; `sequence` assignment
/// and the in-memory push happen atomically with respect to concurrent
/// callers. An optional on-disk sink receives one JSON object per line,
/// matching the external format in spec §6.
pub struct EventLog {
    inner: Mutex<Inner>,
}

struct Inner {
    events: Vec<Event>,
    next_sequence: u64,
    sink: Option<std::fs::File>,
}

impl EventLog {
    /// An in-memory-only log, useful for tests and for components that do
    /// not need durability (e.g. contract depth-bound unit tests).
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(Inner {
                events: Vec::new(),
                next_sequence: 0,
                sink: None,
            }),
        }
    }

    /// A log that also appends each event as one JSON line to `path`. If
    /// `path` already holds lines from a prior run, `next_sequence` resumes
    /// one past the highest `sequence` found there; the existing lines
    /// themselves are not loaded into memory, only scanned for that
    /// high-water mark.
    pub fn with_file_sink(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let next_sequence = Self::highest_prior_sequence(&path)?.map(|s| s + 1).unwrap_or(0);
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            inner: Mutex::new(Inner {
                events: Vec::new(),
                next_sequence,
                sink: Some(file),
            }),
        })
    }

    fn highest_prior_sequence(path: &PathBuf) -> std::io::Result<Option<u64>> {
        let file = match std::fs::File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err),
        };
        let mut highest = None;
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let Ok(value) = serde_json::from_str::<Value>(&line) else {
                continue;
            };
            if let Some(sequence) = value.get("sequence").and_then(Value::as_u64) {
                highest = Some(highest.map_or(sequence, |h: u64| h.max(sequence)));
            }
        }
        Ok(highest)
    }

    /// Append a new event, returning its assigned sequence number.
    pub async fn append(&self, event_type: EventType, payload: Value) -> u64 {
        let mut inner = self.inner.lock().await;
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        let event = Event::new(sequence, event_type, payload);

        if let Some(sink) = inner.sink.as_mut() {
            let line = serde_json::json!({
                "sequence": event.sequence,
                "timestamp": event.timestamp.to_rfc3339(),
                "event_type": event.event_type.to_string(),
                "payload": event.payload,
            });
            if let Err(err) = writeln!(sink, "{line}") {
                tracing::warn!(error = %err, "event log sink write failed");
            }
        }

        inner.events.push(event);
        sequence
    }

    /// Read events, optionally starting from a sequence number, bounded by
    /// `limit`, and passed through `filter`. The spec only requires O(n)
    /// linear scan at this layer (§4.1).
    pub async fn read(
        &self,
        from_sequence: Option<u64>,
        limit: Option<usize>,
        filter: Option<&dyn Fn(&Event) -> bool>,
    ) -> Vec<Event> {
        let inner = self.inner.lock().await;
        let mut out = Vec::new();
        for event in inner.events.iter() {
            if let Some(from) = from_sequence {
                if event.sequence < from {
                    continue;
                }
            }
            if let Some(f) = filter {
                if !f(event) {
                    continue;
                }
            }
            out.push(event.clone());
            if let Some(limit) = limit {
                if out.len() >= limit {
                    break;
                }
            }
        }
        out
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.events.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_types::EventType;

    #[tokio::test]
    async fn sequence_is_monotonic_and_never_reused() {
        let log = EventLog::in_memory();
        let s1 = log.append(EventType::Tick, serde_json::json!({})).await;
        let s2 = log.append(EventType::Tick, serde_json::json!({})).await;
        let s3 = log.append(EventType::Tick, serde_json::json!({})).await;
        assert_eq!((s1, s2, s3), (0, 1, 2));
    }

    #[tokio::test]
    async fn with_file_sink_resumes_sequence_after_restart() {
        let path = std::env::temp_dir().join(format!("agora-eventlog-test-{}.jsonl", std::process::id()));
        std::fs::remove_file(&path).ok();

        {
            let log = EventLog::with_file_sink(&path).unwrap();
            log.append(EventType::Tick, serde_json::json!({})).await;
            log.append(EventType::Tick, serde_json::json!({})).await;
        }

        let resumed = EventLog::with_file_sink(&path).unwrap();
        let sequence = resumed.append(EventType::Tick, serde_json::json!({})).await;
        assert_eq!(sequence, 2);

        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn read_filters_by_from_sequence_and_limit() {
        let log = EventLog::in_memory();
        for i in 0..5 {
            log.append(EventType::Tick, serde_json::json!({"i": i})).await;
        }
        let events = log.read(Some(2), Some(2), None).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].sequence, 2);
        assert_eq!(events[1].sequence, 3);
    }

    #[tokio::test]
    async fn read_applies_predicate_filter() {
        let log = EventLog::in_memory();
        log.append(EventType::Thinking, serde_json::json!({})).await;
        log.append(EventType::Action, serde_json::json!({})).await;
        let filter: &dyn Fn(&agora_types::Event) -> bool =
            &|e| matches!(e.event_type, EventType::Action);
        let events = log.read(None, None, Some(filter)).await;
        assert_eq!(events.len(), 1);
    }
}

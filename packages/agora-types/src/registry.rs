//! Central ID registry shared by the ledger and the artifact store.
//!
//! Spec §4.2/§4.4: a principal ID and an artifact ID live in the same
//! namespace, so `create_principal` and artifact `write` must agree on
//! who owns a given string. Both crates hold an `Arc<IdRegistry>` handed
//! to them at construction (Design Notes §9: no global singleton).

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdKind {
    Principal,
    Artifact,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("id '{id}' already registered as {existing:?}, cannot register as {requested:?}")]
pub struct IdCollision {
    pub id: String,
    pub existing: IdKind,
    pub requested: IdKind,
}

#[derive(Debug, Default)]
pub struct IdRegistry {
    inner: Mutex<HashMap<String, IdKind>>,
}

impl IdRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` as `kind`. Idempotent if the existing registration
    /// matches; errors if it conflicts with a different kind.
    pub fn register(&self, id: &str, kind: IdKind) -> Result<(), IdCollision> {
        let mut map = self.inner.lock().expect("id registry mutex poisoned");
        match map.get(id) {
            Some(existing) if *existing != kind => Err(IdCollision {
                id: id.to_string(),
                existing: *existing,
                requested: kind,
            }),
            Some(_) => Ok(()),
            None => {
                map.insert(id.to_string(), kind);
                Ok(())
            }
        }
    }

    pub fn kind_of(&self, id: &str) -> Option<IdKind> {
        self.inner.lock().expect("id registry mutex poisoned").get(id).copied()
    }
}

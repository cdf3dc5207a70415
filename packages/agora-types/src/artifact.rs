//! Artifacts: addressable, possibly-executable objects owned by a principal.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::PrincipalId;

/// The declared kind of an artifact. The runtime treats most behavior
/// polymorphically via the boolean flags on [`Artifact`] rather than by
/// matching on `kind`; the kind is carried mostly for bookkeeping and
/// checkpoint fidelity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Data,
    Executable,
    Agent,
    Handbook,
    Reflex,
    Trigger,
    /// Anything outside the fixed set above; the runtime never matches on
    /// this variant, only on the boolean flags.
    Other(String),
}

impl Default for ArtifactKind {
    fn default() -> Self {
        ArtifactKind::Data
    }
}

/// An immutable-by-default, addressable object in the world.
///
/// See spec §3 for the invariant tying `has_standing` to ledger
/// membership (enforced by `agora-ledger` and `agora-checkpoint`, not
/// here -- this type is pure data).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub kind: ArtifactKind,
    pub created_by: PrincipalId,
    pub content: String,
    pub code: Option<String>,

    pub executable: bool,
    pub has_standing: bool,
    pub has_loop: bool,
    pub deleted: bool,

    pub capabilities: HashSet<String>,
    pub access_contract_id: Option<String>,

    /// Method name -> human-readable description, for genesis artifacts
    /// dispatched by registered method handlers rather than the
    /// run/handle_request sandbox conventions.
    pub genesis_methods: Option<HashMap<String, String>>,
}

impl Artifact {
    pub fn new(id: impl Into<String>, created_by: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: ArtifactKind::Data,
            created_by: created_by.into(),
            content: content.into(),
            code: None,
            executable: false,
            has_standing: false,
            has_loop: false,
            deleted: false,
            capabilities: HashSet::new(),
            access_contract_id: None,
            genesis_methods: None,
        }
    }

    pub fn with_kind(mut self, kind: ArtifactKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self.executable = true;
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    /// Whether this artifact can call the `_syscall_llm` kernel primitive.
    pub fn can_call_llm(&self) -> bool {
        self.capabilities.contains("can_call_llm")
    }

    /// Genesis artifacts dispatch via `genesis_methods` and never use the
    /// sandbox `handle_request` convention (spec §4.5 detection rule).
    pub fn is_genesis_dispatch(&self) -> bool {
        self.genesis_methods.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_artifact_has_no_capabilities() {
        let a = Artifact::new("a1", "alice", "hello");
        assert!(!a.can_call_llm());
        assert!(!a.is_genesis_dispatch());
        assert!(!a.executable);
    }

    #[test]
    fn with_code_marks_executable() {
        let a = Artifact::new("a1", "alice", "").with_code("def run(): pass");
        assert!(a.executable);
        assert_eq!(a.code.as_deref(), Some("def run(): pass"));
    }
}

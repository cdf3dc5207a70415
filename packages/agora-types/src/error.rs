//! The abstract error taxonomy from spec §7.
//!
//! Individual crates are free to define their own richer error enums
//! (`agora-ledger::LedgerError`, `agora-sandbox::SandboxError`, ...) but
//! every one of them maps onto exactly one of these variants so the loop
//! engine and supervisor can reason about failures uniformly without
//! depending on every leaf crate's error type.
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AgoraError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("insufficient scrip: {0}")]
    InsufficientScrip(String),

    #[error("insufficient resource: {0}")]
    InsufficientResource(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("budget exhausted: {0}")]
    BudgetExhausted(String),

    #[error("runtime failure: {0}")]
    RuntimeFailure(String),
}

impl AgoraError {
    /// Whether the supervisor should treat a loop crashing with this error
    /// as a "smart death" signal regardless of the agent's scrip balance.
    pub fn is_economic(&self) -> bool {
        matches!(self, AgoraError::InsufficientScrip(_))
    }
}

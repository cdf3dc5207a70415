//! Shared data model for the Agora simulation runtime.
//!
//! Every other crate in the workspace depends on this one for the handful
//! of types that cross component boundaries: artifacts, events, loop and
//! restart state, rate-limiter usage records, and the abstract error
//! taxonomy each component maps its own error enum onto.

pub mod artifact;
pub mod error;
pub mod event;
pub mod loop_state;
pub mod registry;
pub mod restart;
pub mod usage;

pub use artifact::{Artifact, ArtifactKind};
pub use error::AgoraError;
pub use event::{Event, EventType};
pub use loop_state::{LoopState, WakeCondition};
pub use registry::{IdCollision, IdKind, IdRegistry};
pub use restart::{DeathType, RestartState};
pub use usage::UsageRecord;

/// Opaque principal identifier. Principals are agents, artifacts acting as
/// principals (`has_standing=true`), or seeded system accounts such as the
/// mint agent.
pub type PrincipalId = String;

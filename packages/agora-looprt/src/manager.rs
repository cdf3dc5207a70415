//! Loop manager: a registry of [`Loop`]s keyed by agent or artifact ID
//! (spec §4.9).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use agora_artifacts::ArtifactStore;
use agora_ratelimit::RateTracker;
use agora_sandbox::SandboxExecutor;
use agora_types::LoopState;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::behavior::{AgentBehavior, ArtifactBehavior};
use crate::loop_engine::{Loop, LoopConfig};

#[derive(Debug, Error)]
pub enum LoopManagerError {
    #[error("loop '{0}' is already registered")]
    AlreadyExists(String),
    #[error("loop '{0}' is not registered")]
    NotFound(String),
    #[error("loop '{0}' cannot be removed while running")]
    StillRunning(String),
}

#[derive(Default)]
pub struct LoopManager {
    loops: RwLock<HashMap<String, Arc<Loop>>>,
}

impl LoopManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create_loop(
        &self,
        id: impl Into<String>,
        principal_id: impl Into<String>,
        behavior: Arc<dyn AgentBehavior>,
        config: LoopConfig,
        rate_limiter: Option<Arc<RateTracker>>,
    ) -> Result<Arc<Loop>, LoopManagerError> {
        let id = id.into();
        let mut loops = self.loops.write().await;
        if loops.contains_key(&id) {
            return Err(LoopManagerError::AlreadyExists(id));
        }
        let lp = Loop::new(id.clone(), principal_id, behavior, config, rate_limiter);
        loops.insert(id, lp.clone());
        Ok(lp)
    }

    pub async fn get_loop(&self, id: &str) -> Option<Arc<Loop>> {
        self.loops.read().await.get(id).cloned()
    }

    /// Rejects removal of a loop that is still running, with a clear
    /// error (spec §4.9) -- callers must `stop()` it first.
    pub async fn remove_loop(&self, id: &str) -> Result<(), LoopManagerError> {
        let mut loops = self.loops.write().await;
        let Some(lp) = loops.get(id) else {
            return Err(LoopManagerError::NotFound(id.to_string()));
        };
        if lp.state().await != LoopState::Stopped {
            return Err(LoopManagerError::StillRunning(id.to_string()));
        }
        loops.remove(id);
        Ok(())
    }

    pub async fn start_all(&self) {
        for lp in self.loops.read().await.values() {
            lp.start().await;
        }
    }

    pub async fn stop_all(&self, timeout: Option<Duration>) {
        let handles: Vec<Arc<Loop>> = self.loops.read().await.values().cloned().collect();
        let futures = handles.iter().map(|lp| lp.stop(timeout));
        futures::future::join_all(futures).await;
    }

    pub async fn running_count(&self) -> usize {
        let mut count = 0;
        for lp in self.loops.read().await.values() {
            if lp.state().await.is_active() {
                count += 1;
            }
        }
        count
    }

    pub async fn loop_count(&self) -> usize {
        self.loops.read().await.len()
    }

    pub async fn get_all_states(&self) -> HashMap<String, LoopState> {
        let mut out = HashMap::new();
        for (id, lp) in self.loops.read().await.iter() {
            out.insert(id.clone(), lp.state().await);
        }
        out
    }

    /// Scans the artifact store for entries with `has_loop=true` and
    /// non-empty code, registering a new [`ArtifactBehavior`]-backed loop
    /// for each one not already known to this manager. Returns the newly
    /// registered IDs.
    pub async fn discover_loops(
        &self,
        artifacts: Arc<ArtifactStore>,
        executor: Arc<SandboxExecutor>,
        config: LoopConfig,
        rate_limiter: Option<Arc<RateTracker>>,
    ) -> Vec<String> {
        let candidates = artifacts.discover_loop_candidates().await;
        let mut discovered = Vec::new();
        for id in candidates {
            if self.get_loop(&id).await.is_some() {
                continue;
            }
            let behavior = Arc::new(ArtifactBehavior::new(id.clone(), artifacts.clone(), executor.clone()));
            if self
                .create_loop(id.clone(), id.clone(), behavior, config.clone(), rate_limiter.clone())
                .await
                .is_ok()
            {
                discovered.push(id);
            }
        }
        discovered
    }
}

//! Per-workspace advisory locks.
//!
//! Serializes orchestrator runs of one workspace across the queue drain and
//! the on-demand path. Locks are created lazily and live as long as the
//! registry.

use core_auth::WorkspaceId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

#[derive(Debug, Default)]
pub struct WorkspaceLocks {
    locks: Mutex<HashMap<WorkspaceId, Arc<Mutex<()>>>>,
}

impl WorkspaceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to a workspace. Released when the guard drops.
    pub async fn acquire(&self, workspace_id: WorkspaceId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(workspace_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        trace!(workspace_id, "Waiting for workspace lock");
        lock.lock_owned().await
    }

    /// Non-blocking variant, `None` while another run holds the workspace.
    pub async fn try_acquire(&self, workspace_id: WorkspaceId) -> Option<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(workspace_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.try_lock_owned().ok()
    }

    pub async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }
}

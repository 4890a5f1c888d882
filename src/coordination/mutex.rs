//! Mutual exclusion on top of ephemeral sequential nodes.
//!
//! Each acquisition attempt creates `lock-NNNNNNNNNN` under the mutex path.
//! The contender with the lowest sequence number holds the mutex. Everyone
//! else watches only its immediate predecessor, so a release wakes exactly one
//! waiter. Because contender nodes are ephemeral, a crashed holder's session
//! expiry releases the mutex without any cleanup from the application.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::{join_path, CoordinationClient, CreateMode};
use crate::error::{ConductorError, Result};

pub const CONTENDER_PREFIX: &str = "lock-";

/// A held mutex. Pass it back to [`DistributedMutex::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutexLease {
    pub base_path: String,
    pub node_path: String,
}

#[derive(Clone)]
pub struct DistributedMutex {
    client: Arc<CoordinationClient>,
    base_path: String,
}

impl DistributedMutex {
    pub fn new(client: Arc<CoordinationClient>, base_path: impl Into<String>) -> Self {
        Self {
            client,
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    /// Wait up to `timeout` for the mutex.
    ///
    /// Returns `Ok(None)` on timeout. On timeout or error the attempt's own
    /// contender node is removed so it cannot block later contenders.
    pub async fn acquire(&self, timeout: Duration, holder: &[u8]) -> Result<Option<MutexLease>> {
        let deadline = Instant::now() + timeout;
        let prefix = join_path(&self.base_path, CONTENDER_PREFIX);
        let node_path = self
            .client
            .create(&prefix, holder.to_vec(), CreateMode::EphemeralSequential)
            .await?;

        match self.wait_for_turn(&node_path, deadline).await {
            Ok(true) => Ok(Some(MutexLease {
                base_path: self.base_path.clone(),
                node_path,
            })),
            Ok(false) => {
                self.abandon(&node_path).await;
                self.remove_if_idle().await;
                Ok(None)
            }
            Err(e) => {
                self.abandon(&node_path).await;
                Err(e)
            }
        }
    }

    async fn wait_for_turn(&self, node_path: &str, deadline: Instant) -> Result<bool> {
        let our_name = node_path.rsplit('/').next().unwrap_or(node_path);

        loop {
            let contenders = self.contenders().await?;
            let Some(position) = contenders.iter().position(|c| c == our_name) else {
                // Our ephemeral node is gone: the session ended underneath us.
                return Err(ConductorError::NoNode(node_path.to_string()));
            };
            if position == 0 {
                return Ok(true);
            }

            let predecessor = join_path(&self.base_path, &contenders[position - 1]);
            let Some(watch) = self.client.watch_deletion(&predecessor).await? else {
                continue;
            };

            tracing::trace!(node = %node_path, predecessor = %predecessor, "Waiting for predecessor");
            match tokio::time::timeout_at(deadline, watch).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => {
                    return Err(ConductorError::SessionExpired(self.client.session_id()));
                }
                Err(_) => return Ok(false),
            }
        }
    }

    /// Current contender node names in acquisition order.
    pub async fn contenders(&self) -> Result<Vec<String>> {
        let mut children = match self.client.get_children(&self.base_path).await {
            Ok(children) => children,
            Err(ConductorError::NoNode(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        children.retain(|name| name.starts_with(CONTENDER_PREFIX));
        children.sort();
        Ok(children)
    }

    /// Whether any contender currently exists (held or queued).
    pub async fn is_contended(&self) -> Result<bool> {
        Ok(!self.contenders().await?.is_empty())
    }

    /// Release a lease. Returns `false` if the node was already gone.
    pub async fn release(&self, lease: &MutexLease) -> Result<bool> {
        match self.client.delete(&lease.node_path).await {
            Ok(()) => Ok(true),
            Err(ConductorError::NoNode(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Delete the mutex node once no contender is left under it. A node that
    /// is still in use, or already gone, is left alone.
    pub async fn remove_if_idle(&self) {
        match self.client.delete(&self.base_path).await {
            Ok(()) => tracing::trace!(path = %self.base_path, "Removed idle mutex node"),
            Err(ConductorError::NotEmpty(_)) | Err(ConductorError::NoNode(_)) => {}
            Err(e) => {
                tracing::debug!(path = %self.base_path, error = %e, "Failed to remove idle mutex node");
            }
        }
    }

    async fn abandon(&self, node_path: &str) {
        match self.client.delete(node_path).await {
            Ok(()) | Err(ConductorError::NoNode(_)) => {}
            Err(e) => {
                tracing::warn!(node = %node_path, error = %e, "Failed to remove abandoned contender");
            }
        }
    }
}

//! Per-task execution locks.
//!
//! A task may be advanced through its lifecycle by at most one node at a time.
//! [`ExecutionLockService`] scopes a [`DistributedMutex`] to
//! `/task-execution/locks/{taskId}` and, once the mutex is held, writes an
//! ephemeral `holder` node describing who holds it. Every failure mode of the
//! coordination store degrades to "not acquired" or "not locked"; nothing
//! here returns an error to the caller.

pub mod identity;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::LockConfig;
use crate::coordination::{join_path, CoordinationClient, CreateMode, DistributedMutex, MutexLease};
use crate::error::ConductorError;

pub use identity::resolve_node_id;

pub const LOCK_ROOT: &str = "/task-execution/locks";
pub const HOLDER_NODE: &str = "holder";
pub const METADATA_VERSION: u32 = 1;

/// A held execution lock. Hand it back to [`ExecutionLockService::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    pub task_id: String,
    pub holder_id: String,
    pub acquired_at: DateTime<Utc>,
    pub lock_path: String,
    lease: MutexLease,
}

impl Lock {
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.acquired_at).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        self.age(now) > stale_after
    }

    /// Path of the contender node backing this lock.
    pub fn contender_path(&self) -> &str {
        &self.lease.node_path
    }
}

/// Contents of the ephemeral `holder` node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockMetadata {
    pub task_id: String,
    pub node_id: String,
    pub acquired_at: DateTime<Utc>,
    pub version: u32,
}

pub fn lock_path(task_id: &str) -> String {
    join_path(LOCK_ROOT, task_id)
}

fn metadata_path(lock_path: &str) -> String {
    join_path(lock_path, HOLDER_NODE)
}

fn is_valid_task_id(task_id: &str) -> bool {
    !task_id.trim().is_empty() && !task_id.contains('/')
}

pub struct ExecutionLockService {
    client: Arc<CoordinationClient>,
    node_id: String,
    config: LockConfig,
    /// Locks held by this process, keyed by contender node path.
    held: DashMap<String, Lock>,
}

impl ExecutionLockService {
    pub fn new(client: Arc<CoordinationClient>, node_id: impl Into<String>, config: LockConfig) -> Self {
        let node_id = node_id.into();
        tracing::info!(
            node_id = %node_id,
            acquire_timeout_ms = config.acquire_timeout.as_millis() as u64,
            "Execution lock service initialized"
        );
        Self {
            client,
            node_id,
            config,
            held: DashMap::new(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    fn mutex_for(&self, task_id: &str) -> DistributedMutex {
        DistributedMutex::new(self.client.clone(), lock_path(task_id))
    }

    /// Acquire the execution lock for a task, waiting up to the configured
    /// acquire timeout. `None` means the lock was not obtained.
    pub async fn acquire(&self, task_id: &str) -> Option<Lock> {
        self.acquire_with_timeout(task_id, self.config.acquire_timeout)
            .await
    }

    pub async fn acquire_with_timeout(&self, task_id: &str, timeout: Duration) -> Option<Lock> {
        if !is_valid_task_id(task_id) {
            tracing::warn!(task_id = %task_id, "Rejecting lock request for invalid task id");
            return None;
        }

        let mutex = self.mutex_for(task_id);
        let lease = match mutex.acquire(timeout, self.node_id.as_bytes()).await {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                tracing::warn!(
                    task_id = %task_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Timed out acquiring execution lock"
                );
                return None;
            }
            Err(e) => {
                tracing::error!(task_id = %task_id, error = %e, "Failed to acquire execution lock");
                return None;
            }
        };

        let lock = Lock {
            task_id: task_id.to_string(),
            holder_id: self.node_id.clone(),
            acquired_at: Utc::now(),
            lock_path: mutex.base_path().to_string(),
            lease,
        };
        self.write_metadata(&lock).await;
        self.held
            .insert(lock.contender_path().to_string(), lock.clone());

        tracing::info!(task_id = %task_id, holder = %lock.holder_id, "Acquired execution lock");
        Some(lock)
    }

    /// Metadata is informational; a failed write never fails acquisition.
    async fn write_metadata(&self, lock: &Lock) {
        let metadata = LockMetadata {
            task_id: lock.task_id.clone(),
            node_id: lock.holder_id.clone(),
            acquired_at: lock.acquired_at,
            version: METADATA_VERSION,
        };
        let bytes = match serde_json::to_vec(&metadata) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(task_id = %lock.task_id, error = %e, "Failed to encode lock metadata");
                return;
            }
        };

        let path = metadata_path(&lock.lock_path);
        let result = match self
            .client
            .create(&path, bytes.clone(), CreateMode::Ephemeral)
            .await
        {
            Err(ConductorError::NodeExists(_)) => self.client.set_data(&path, bytes).await,
            other => other.map(|_| ()),
        };
        if let Err(e) = result {
            tracing::warn!(task_id = %lock.task_id, error = %e, "Failed to write lock metadata");
        }
    }

    /// Release a lock. Returns `false` if the lock was unknown, already
    /// released, or the store could not be reached. Never errors.
    ///
    /// A release the store could not complete keeps the lock in
    /// [`held_locks`](Self::held_locks) so a later call can retry it.
    pub async fn release(&self, lock: &Lock) -> bool {
        // Sequence numbers restart once the lock node is pruned, so an old
        // handle may share a contender path with a newer lock.
        if self
            .held
            .remove_if(lock.contender_path(), |_, held| held == lock)
            .is_none()
        {
            tracing::warn!(task_id = %lock.task_id, "Release of unknown or already released lock");
            return false;
        }

        // Metadata first, so the next holder's metadata is never removed by us.
        match self.client.delete(&metadata_path(&lock.lock_path)).await {
            Ok(()) | Err(ConductorError::NoNode(_)) => {}
            Err(e) => {
                tracing::warn!(task_id = %lock.task_id, error = %e, "Failed to remove lock metadata");
            }
        }

        let mutex = self.mutex_for(&lock.task_id);
        let released = match mutex.release(&lock.lease).await {
            Ok(true) => {
                tracing::info!(
                    task_id = %lock.task_id,
                    held_ms = lock.age(Utc::now()).as_millis() as u64,
                    "Released execution lock"
                );
                true
            }
            Ok(false) => {
                tracing::warn!(task_id = %lock.task_id, "Execution lock already gone at release");
                false
            }
            Err(e) => {
                tracing::error!(
                    task_id = %lock.task_id,
                    error = %e,
                    "Failed to release execution lock, keeping it for retry"
                );
                self.held
                    .insert(lock.contender_path().to_string(), lock.clone());
                return false;
            }
        };

        mutex.remove_if_idle().await;
        released
    }

    /// Whether any node currently holds or waits for the task's lock.
    /// Store errors read as unlocked.
    pub async fn is_locked(&self, task_id: &str) -> bool {
        if !is_valid_task_id(task_id) {
            return false;
        }
        match self.mutex_for(task_id).is_contended().await {
            Ok(locked) => locked,
            Err(e) => {
                tracing::warn!(task_id = %task_id, error = %e, "Lock check failed, reporting unlocked");
                false
            }
        }
    }

    /// Holder metadata for a task, if any node has published it.
    pub async fn holder(&self, task_id: &str) -> Option<LockMetadata> {
        if !is_valid_task_id(task_id) {
            return None;
        }
        let path = metadata_path(&lock_path(task_id));
        match self.client.get_data(&path).await {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(metadata) => Some(metadata),
                Err(e) => {
                    tracing::warn!(task_id = %task_id, error = %e, "Unreadable lock metadata");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(task_id = %task_id, error = %e, "Failed to read lock metadata");
                None
            }
        }
    }

    /// Locks currently held by this process.
    pub fn held_locks(&self) -> Vec<Lock> {
        self.held.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Locally held locks older than the stale ceiling. Each one is logged;
    /// none is released.
    pub fn stale_locks(&self) -> Vec<Lock> {
        let now = Utc::now();
        let stale: Vec<Lock> = self
            .held
            .iter()
            .filter(|entry| entry.value().is_stale(now, self.config.stale_after))
            .map(|entry| entry.value().clone())
            .collect();

        for lock in &stale {
            tracing::warn!(
                task_id = %lock.task_id,
                acquired_at = %lock.acquired_at,
                age_secs = lock.age(now).as_secs(),
                "Execution lock held longer than stale threshold"
            );
        }
        stale
    }

    /// Periodically report stale locks until `shutdown` fires.
    pub async fn run_stale_audit(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.audit_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let stale = self.stale_locks();
                    if !stale.is_empty() {
                        tracing::debug!(count = stale.len(), "Stale lock audit complete");
                    }
                }
            }
        }
    }
}

//! Hierarchical, session-based coordination store.
//!
//! The store is modelled on a ZooKeeper ensemble:
//! - **Paths**: nodes form a tree addressed by absolute `/`-separated paths
//! - **Sessions**: every client owns one session; ephemeral nodes belong to it
//!   and disappear when the session is closed or expires
//! - **Sequential nodes**: the store appends a monotonically increasing,
//!   zero-padded counter to the requested name
//! - **Watches**: one-shot notifications when a node is deleted
//!
//! # Components
//!
//! - [`CoordinationStore`]: the store contract, one instance per session
//! - [`MemoryEnsemble`]: in-process store used by tests and single-node runs
//! - `ZooKeeperSession`: a session against a real ensemble (`zookeeper`
//!   feature), shared by every node process
//! - [`CoordinationClient`]: namespacing, retry policy and connection lifecycle
//! - [`DistributedMutex`]: the mutual-exclusion recipe built on sequential
//!   ephemeral nodes

pub mod client;
pub mod memory;
pub mod mutex;
#[cfg(feature = "zookeeper")]
pub mod zookeeper;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::error::Result;

pub use client::CoordinationClient;
pub use memory::{MemoryEnsemble, MemorySession};
pub use mutex::{DistributedMutex, MutexLease};
#[cfg(feature = "zookeeper")]
pub use zookeeper::ZooKeeperSession;

pub type SessionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    Ephemeral,
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    pub fn is_sequential(self) -> bool {
        matches!(self, CreateMode::EphemeralSequential)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    /// Connection to the ensemble is down but the session may still be alive.
    Suspended,
    /// Session expired or closed; its ephemeral nodes are gone.
    Lost,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Connected => write!(f, "connected"),
            SessionState::Suspended => write!(f, "suspended"),
            SessionState::Lost => write!(f, "lost"),
        }
    }
}

/// Fires once when the watched node is deleted.
///
/// A receive error means the watch was dropped by the store (session ended).
pub type DeletionWatch = oneshot::Receiver<()>;

/// Contract for one session against a coordination store.
///
/// Missing parents are created as persistent nodes by [`create`](Self::create).
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    fn session_id(&self) -> SessionId;

    fn state(&self) -> SessionState;

    /// Create a node and return its actual path (sequential nodes get a suffix).
    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<String>;

    async fn get_data(&self, path: &str) -> Result<Option<Vec<u8>>>;

    async fn set_data(&self, path: &str, data: Vec<u8>) -> Result<()>;

    async fn exists(&self, path: &str) -> Result<bool>;

    /// Child names (not full paths). Errors with `NoNode` if `path` is missing.
    async fn get_children(&self, path: &str) -> Result<Vec<String>>;

    async fn delete(&self, path: &str) -> Result<()>;

    /// Register a deletion watch. Returns `None` if the node is already gone.
    async fn watch_deletion(&self, path: &str) -> Result<Option<DeletionWatch>>;

    /// End the session, removing every ephemeral node it owns.
    async fn close(&self);
}

/// Join a parent path and a child name.
pub fn join_path(parent: &str, child: &str) -> String {
    let child = child.trim_matches('/');
    if child.is_empty() {
        return if parent.is_empty() {
            "/".to_string()
        } else {
            parent.to_string()
        };
    }
    if parent == "/" || parent.is_empty() {
        format!("/{child}")
    } else {
        format!("{}/{}", parent.trim_end_matches('/'), child)
    }
}

/// Parent of an absolute path; `None` for the root.
pub fn parent_path(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

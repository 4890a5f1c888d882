//! In-process coordination ensemble.
//!
//! Shares one node tree between any number of sessions, so several
//! [`CoordinationClient`](super::CoordinationClient)s in one process behave
//! like independent cluster nodes talking to the same ensemble. Tests use
//! [`MemoryEnsemble::expire_session`] to simulate a crashed holder and
//! [`MemoryEnsemble::set_available`] to simulate losing the connection.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::{
    parent_path, CoordinationStore, CreateMode, DeletionWatch, SessionId, SessionState,
};
use crate::error::{ConductorError, Result};

#[derive(Debug)]
struct StoreNode {
    data: Vec<u8>,
    owner: Option<SessionId>,
    next_sequence: u64,
}

impl StoreNode {
    fn persistent() -> Self {
        Self {
            data: Vec::new(),
            owner: None,
            next_sequence: 0,
        }
    }
}

struct Tree {
    nodes: BTreeMap<String, StoreNode>,
    watches: HashMap<String, Vec<(SessionId, oneshot::Sender<()>)>>,
    live_sessions: HashSet<SessionId>,
}

impl Tree {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), StoreNode::persistent());
        Self {
            nodes,
            watches: HashMap::new(),
            live_sessions: HashSet::new(),
        }
    }

    fn children(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let rest = &key[prefix.len()..];
                if rest.is_empty() || rest.contains('/') {
                    None
                } else {
                    Some(rest.to_string())
                }
            })
            .collect()
    }

    fn remove(&mut self, path: &str) {
        self.nodes.remove(path);
        if let Some(watchers) = self.watches.remove(path) {
            for (_, tx) in watchers {
                let _ = tx.send(());
            }
        }
    }

    fn end_session(&mut self, session_id: SessionId) -> usize {
        if !self.live_sessions.remove(&session_id) {
            return 0;
        }

        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.owner == Some(session_id))
            .map(|(path, _)| path.clone())
            .collect();
        for path in &owned {
            self.remove(path);
        }

        // Dropping the senders wakes this session's waiters with an error.
        for watchers in self.watches.values_mut() {
            watchers.retain(|(owner, _)| *owner != session_id);
        }
        self.watches.retain(|_, watchers| !watchers.is_empty());

        owned.len()
    }
}

struct EnsembleInner {
    tree: Mutex<Tree>,
    next_session: AtomicU64,
    available: AtomicBool,
}

/// Shared in-memory node tree. Cheap to clone.
#[derive(Clone)]
pub struct MemoryEnsemble {
    inner: Arc<EnsembleInner>,
}

impl Default for MemoryEnsemble {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEnsemble {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EnsembleInner {
                tree: Mutex::new(Tree::new()),
                next_session: AtomicU64::new(1),
                available: AtomicBool::new(true),
            }),
        }
    }

    /// Open a new session against this ensemble.
    pub fn connect(&self) -> MemorySession {
        let id = self.inner.next_session.fetch_add(1, Ordering::SeqCst);
        self.inner.tree.lock().live_sessions.insert(id);
        tracing::debug!(session_id = id, "Coordination session opened");
        MemorySession {
            ensemble: self.clone(),
            id,
        }
    }

    /// Expire a session as if its owner had crashed. Returns the number of
    /// ephemeral nodes removed.
    pub fn expire_session(&self, session_id: SessionId) -> usize {
        let removed = self.inner.tree.lock().end_session(session_id);
        tracing::info!(session_id, removed, "Coordination session expired");
        removed
    }

    /// Toggle reachability of the ensemble for every session.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    pub fn is_session_live(&self, session_id: SessionId) -> bool {
        self.inner.tree.lock().live_sessions.contains(&session_id)
    }

    /// Total number of nodes, including the root.
    pub fn node_count(&self) -> usize {
        self.inner.tree.lock().nodes.len()
    }

    fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::SeqCst)
    }
}

/// One session against a [`MemoryEnsemble`]. Dropping it ends the session.
pub struct MemorySession {
    ensemble: MemoryEnsemble,
    id: SessionId,
}

impl MemorySession {
    fn check(&self, tree: &Tree) -> Result<()> {
        if !self.ensemble.is_available() {
            return Err(ConductorError::ConnectionLoss(
                "ensemble unreachable".to_string(),
            ));
        }
        if !tree.live_sessions.contains(&self.id) {
            return Err(ConductorError::SessionExpired(self.id));
        }
        Ok(())
    }
}

fn validate_path(path: &str) -> Result<()> {
    let valid = path.starts_with('/')
        && (path == "/" || !path.ends_with('/'))
        && !path.contains("//");
    if valid {
        Ok(())
    } else {
        Err(ConductorError::InvalidPath(path.to_string()))
    }
}

#[async_trait]
impl CoordinationStore for MemorySession {
    fn session_id(&self) -> SessionId {
        self.id
    }

    fn state(&self) -> SessionState {
        if !self.ensemble.is_session_live(self.id) {
            SessionState::Lost
        } else if !self.ensemble.is_available() {
            SessionState::Suspended
        } else {
            SessionState::Connected
        }
    }

    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<String> {
        validate_path(path)?;
        let mut tree = self.ensemble.inner.tree.lock();
        self.check(&tree)?;

        let parent = parent_path(path)
            .ok_or_else(|| ConductorError::NodeExists(path.to_string()))?
            .to_string();

        let mut missing = Vec::new();
        let mut cursor = Some(parent.as_str());
        while let Some(p) = cursor {
            if tree.nodes.contains_key(p) {
                break;
            }
            missing.push(p.to_string());
            cursor = parent_path(p);
        }
        for p in missing.into_iter().rev() {
            tree.nodes.insert(p, StoreNode::persistent());
        }

        let parent_node = tree
            .nodes
            .get_mut(&parent)
            .ok_or_else(|| ConductorError::NoNode(parent.clone()))?;
        if parent_node.owner.is_some() {
            return Err(ConductorError::InvalidPath(format!(
                "{path}: ephemeral nodes cannot have children"
            )));
        }

        let actual = if mode.is_sequential() {
            let seq = parent_node.next_sequence;
            parent_node.next_sequence += 1;
            format!("{path}{seq:010}")
        } else {
            path.to_string()
        };

        if tree.nodes.contains_key(&actual) {
            return Err(ConductorError::NodeExists(actual));
        }

        tree.nodes.insert(
            actual.clone(),
            StoreNode {
                data,
                owner: mode.is_ephemeral().then_some(self.id),
                next_sequence: 0,
            },
        );
        Ok(actual)
    }

    async fn get_data(&self, path: &str) -> Result<Option<Vec<u8>>> {
        validate_path(path)?;
        let tree = self.ensemble.inner.tree.lock();
        self.check(&tree)?;
        Ok(tree.nodes.get(path).map(|node| node.data.clone()))
    }

    async fn set_data(&self, path: &str, data: Vec<u8>) -> Result<()> {
        validate_path(path)?;
        let mut tree = self.ensemble.inner.tree.lock();
        self.check(&tree)?;
        match tree.nodes.get_mut(path) {
            Some(node) => {
                node.data = data;
                Ok(())
            }
            None => Err(ConductorError::NoNode(path.to_string())),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        validate_path(path)?;
        let tree = self.ensemble.inner.tree.lock();
        self.check(&tree)?;
        Ok(tree.nodes.contains_key(path))
    }

    async fn get_children(&self, path: &str) -> Result<Vec<String>> {
        validate_path(path)?;
        let tree = self.ensemble.inner.tree.lock();
        self.check(&tree)?;
        if !tree.nodes.contains_key(path) {
            return Err(ConductorError::NoNode(path.to_string()));
        }
        Ok(tree.children(path))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        validate_path(path)?;
        if path == "/" {
            return Err(ConductorError::InvalidPath(path.to_string()));
        }
        let mut tree = self.ensemble.inner.tree.lock();
        self.check(&tree)?;
        if !tree.nodes.contains_key(path) {
            return Err(ConductorError::NoNode(path.to_string()));
        }
        if !tree.children(path).is_empty() {
            return Err(ConductorError::NotEmpty(path.to_string()));
        }
        tree.remove(path);
        Ok(())
    }

    async fn watch_deletion(&self, path: &str) -> Result<Option<DeletionWatch>> {
        validate_path(path)?;
        let mut tree = self.ensemble.inner.tree.lock();
        self.check(&tree)?;
        if !tree.nodes.contains_key(path) {
            return Ok(None);
        }
        let (tx, rx) = oneshot::channel();
        tree.watches
            .entry(path.to_string())
            .or_default()
            .push((self.id, tx));
        Ok(Some(rx))
    }

    async fn close(&self) {
        let removed = self.ensemble.inner.tree.lock().end_session(self.id);
        tracing::debug!(session_id = self.id, removed, "Coordination session closed");
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.ensemble.inner.tree.lock().end_session(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_makes_missing_parents() {
        let ensemble = MemoryEnsemble::new();
        let session = ensemble.connect();

        let path = session
            .create("/a/b/c", b"x".to_vec(), CreateMode::Persistent)
            .await
            .unwrap();
        assert_eq!(path, "/a/b/c");
        assert!(session.exists("/a").await.unwrap());
        assert!(session.exists("/a/b").await.unwrap());
        assert_eq!(session.get_children("/a/b").await.unwrap(), vec!["c"]);
        assert_eq!(session.get_data("/a/b/c").await.unwrap(), Some(b"x".to_vec()));
    }

    #[tokio::test]
    async fn sequential_nodes_get_increasing_suffixes() {
        let ensemble = MemoryEnsemble::new();
        let session = ensemble.connect();

        let first = session
            .create("/locks/t1/lock-", Vec::new(), CreateMode::EphemeralSequential)
            .await
            .unwrap();
        let second = session
            .create("/locks/t1/lock-", Vec::new(), CreateMode::EphemeralSequential)
            .await
            .unwrap();
        assert_eq!(first, "/locks/t1/lock-0000000000");
        assert_eq!(second, "/locks/t1/lock-0000000001");
    }

    #[tokio::test]
    async fn duplicate_create_fails() {
        let ensemble = MemoryEnsemble::new();
        let session = ensemble.connect();
        session
            .create("/a", Vec::new(), CreateMode::Persistent)
            .await
            .unwrap();
        let err = session
            .create("/a", Vec::new(), CreateMode::Persistent)
            .await
            .unwrap_err();
        assert!(matches!(err, ConductorError::NodeExists(_)));
    }

    #[tokio::test]
    async fn delete_rejects_non_empty_and_missing() {
        let ensemble = MemoryEnsemble::new();
        let session = ensemble.connect();
        session
            .create("/a/b", Vec::new(), CreateMode::Persistent)
            .await
            .unwrap();

        assert!(matches!(
            session.delete("/a").await.unwrap_err(),
            ConductorError::NotEmpty(_)
        ));
        session.delete("/a/b").await.unwrap();
        session.delete("/a").await.unwrap();
        assert!(matches!(
            session.delete("/a").await.unwrap_err(),
            ConductorError::NoNode(_)
        ));
    }

    #[tokio::test]
    async fn ephemeral_nodes_vanish_with_session() {
        let ensemble = MemoryEnsemble::new();
        let owner = ensemble.connect();
        let observer = ensemble.connect();

        owner
            .create("/presence/a", Vec::new(), CreateMode::Ephemeral)
            .await
            .unwrap();
        let watch = observer.watch_deletion("/presence/a").await.unwrap().unwrap();

        ensemble.expire_session(owner.session_id());

        watch.await.unwrap();
        assert!(!observer.exists("/presence/a").await.unwrap());
        assert!(observer.exists("/presence").await.unwrap());
        assert_eq!(owner.state(), SessionState::Lost);
        assert!(matches!(
            owner.exists("/presence").await.unwrap_err(),
            ConductorError::SessionExpired(_)
        ));
    }

    #[tokio::test]
    async fn dropping_session_removes_its_ephemerals() {
        let ensemble = MemoryEnsemble::new();
        let observer = ensemble.connect();
        {
            let owner = ensemble.connect();
            owner
                .create("/presence/b", Vec::new(), CreateMode::Ephemeral)
                .await
                .unwrap();
        }
        assert!(!observer.exists("/presence/b").await.unwrap());
    }

    #[tokio::test]
    async fn unavailable_ensemble_reports_connection_loss() {
        let ensemble = MemoryEnsemble::new();
        let session = ensemble.connect();

        ensemble.set_available(false);
        assert_eq!(session.state(), SessionState::Suspended);
        let err = session.exists("/").await.unwrap_err();
        assert!(err.is_retryable());

        ensemble.set_available(true);
        assert_eq!(session.state(), SessionState::Connected);
        assert!(session.exists("/").await.unwrap());
    }

    #[tokio::test]
    async fn watch_on_missing_node_returns_none() {
        let ensemble = MemoryEnsemble::new();
        let session = ensemble.connect();
        assert!(session.watch_deletion("/nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn invalid_paths_are_rejected() {
        let ensemble = MemoryEnsemble::new();
        let session = ensemble.connect();
        for bad in ["relative", "/trailing/", "/double//slash"] {
            assert!(matches!(
                session.exists(bad).await.unwrap_err(),
                ConductorError::InvalidPath(_)
            ));
        }
    }
}

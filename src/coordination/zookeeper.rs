//! ZooKeeper-backed coordination session.
//!
//! Only built with the `zookeeper` feature. One [`ZooKeeperSession`] is one
//! ZooKeeper session: its ephemeral nodes vanish when it is closed or when
//! the ensemble expires it after `session_timeout_ms` without contact.

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::oneshot;
use zookeeper_client as zk;

use super::{parent_path, CoordinationStore, CreateMode, DeletionWatch, SessionId, SessionState};
use crate::config::CoordinationConfig;
use crate::error::{ConductorError, Result};

pub struct ZooKeeperSession {
    /// `None` once the session has been closed.
    client: RwLock<Option<zk::Client>>,
    session_id: SessionId,
}

impl ZooKeeperSession {
    /// Open a session against the ensemble in `config.connect_string`.
    pub async fn connect(config: &CoordinationConfig) -> Result<Self> {
        if config.connect_string.trim().is_empty() {
            return Err(ConductorError::Config(
                "ZooKeeper connect string cannot be empty".to_string(),
            ));
        }

        let mut connector = zk::Client::connector();
        connector
            .session_timeout(config.session_timeout())
            .connection_timeout(config.connection_timeout());
        let client = connector
            .connect(&config.connect_string)
            .await
            .map_err(|e| {
                ConductorError::ConnectionLoss(format!(
                    "failed to connect to {}: {e}",
                    config.connect_string
                ))
            })?;

        let session_id = client.session_id().0 as SessionId;
        tracing::info!(
            session_id,
            connect_string = %config.connect_string,
            session_timeout_ms = config.session_timeout_ms,
            "ZooKeeper session established"
        );

        Ok(Self {
            client: RwLock::new(Some(client)),
            session_id,
        })
    }

    fn client(&self) -> Result<zk::Client> {
        self.client
            .read()
            .clone()
            .ok_or(ConductorError::SessionExpired(self.session_id))
    }

    fn error(&self, path: &str, error: zk::Error) -> ConductorError {
        map_error(self.session_id, path, error)
    }

    async fn ensure_parents(&self, client: &zk::Client, path: &str) -> Result<()> {
        let options = zk::CreateMode::Persistent.with_acls(zk::Acls::anyone_all());
        for ancestor in ancestors(path) {
            match client.create(ancestor, &[], &options).await {
                Ok(_) | Err(zk::Error::NodeExists) => {}
                Err(e) => return Err(self.error(ancestor, e)),
            }
        }
        Ok(())
    }
}

/// Proper ancestors of `path`, outermost first, root excluded.
fn ancestors(path: &str) -> Vec<&str> {
    let mut found = Vec::new();
    let mut current = parent_path(path);
    while let Some(parent) = current {
        if parent == "/" {
            break;
        }
        found.push(parent);
        current = parent_path(parent);
    }
    found.reverse();
    found
}

fn map_error(session_id: SessionId, path: &str, error: zk::Error) -> ConductorError {
    match error {
        zk::Error::NoNode => ConductorError::NoNode(path.to_string()),
        zk::Error::NodeExists => ConductorError::NodeExists(path.to_string()),
        zk::Error::NotEmpty => ConductorError::NotEmpty(path.to_string()),
        zk::Error::ConnectionLoss => ConductorError::ConnectionLoss(path.to_string()),
        zk::Error::SessionExpired => ConductorError::SessionExpired(session_id),
        other => ConductorError::Internal(format!("{path}: {other}")),
    }
}

fn map_state(state: zk::SessionState) -> SessionState {
    match state {
        zk::SessionState::SyncConnected | zk::SessionState::ConnectedReadOnly => {
            SessionState::Connected
        }
        zk::SessionState::Disconnected => SessionState::Suspended,
        _ => SessionState::Lost,
    }
}

fn zk_mode(mode: CreateMode) -> zk::CreateMode {
    match mode {
        CreateMode::Persistent => zk::CreateMode::Persistent,
        CreateMode::Ephemeral => zk::CreateMode::Ephemeral,
        CreateMode::EphemeralSequential => zk::CreateMode::EphemeralSequential,
    }
}

#[async_trait]
impl CoordinationStore for ZooKeeperSession {
    fn session_id(&self) -> SessionId {
        self.session_id
    }

    fn state(&self) -> SessionState {
        match self.client.read().as_ref() {
            Some(client) => map_state(client.state()),
            None => SessionState::Lost,
        }
    }

    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<String> {
        let client = self.client()?;
        let options = zk_mode(mode).with_acls(zk::Acls::anyone_all());

        // Parents may be pruned concurrently, so recreate them on demand.
        let created = match client.create(path, &data, &options).await {
            Err(zk::Error::NoNode) => {
                self.ensure_parents(&client, path).await?;
                client.create(path, &data, &options).await
            }
            other => other,
        };
        let (_, sequence) = created.map_err(|e| self.error(path, e))?;

        if mode.is_sequential() {
            Ok(format!("{path}{sequence}"))
        } else {
            Ok(path.to_string())
        }
    }

    async fn get_data(&self, path: &str) -> Result<Option<Vec<u8>>> {
        match self.client()?.get_data(path).await {
            Ok((data, _)) => Ok(Some(data)),
            Err(zk::Error::NoNode) => Ok(None),
            Err(e) => Err(self.error(path, e)),
        }
    }

    async fn set_data(&self, path: &str, data: Vec<u8>) -> Result<()> {
        self.client()?
            .set_data(path, &data, None)
            .await
            .map(|_| ())
            .map_err(|e| self.error(path, e))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.client()?
            .check_stat(path)
            .await
            .map(|stat| stat.is_some())
            .map_err(|e| self.error(path, e))
    }

    async fn get_children(&self, path: &str) -> Result<Vec<String>> {
        self.client()?
            .get_children(path)
            .await
            .map_err(|e| self.error(path, e))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.client()?
            .delete(path, None)
            .await
            .map_err(|e| self.error(path, e))
    }

    async fn watch_deletion(&self, path: &str) -> Result<Option<DeletionWatch>> {
        let (stat, watcher) = self
            .client()?
            .check_and_watch_stat(path)
            .await
            .map_err(|e| self.error(path, e))?;
        if stat.is_none() {
            return Ok(None);
        }

        let (tx, rx) = oneshot::channel();
        let watched = path.to_string();
        tokio::spawn(async move {
            let event = watcher.changed().await;
            // A session event means the watch is gone; dropping `tx` reports it.
            // Any node event wakes the waiter, which re-reads the contenders.
            if !matches!(event.event_type, zk::EventType::Session) {
                let _ = tx.send(());
            } else {
                tracing::debug!(path = %watched, state = ?event.session_state, "Watch ended by session event");
            }
        });
        Ok(Some(rx))
    }

    async fn close(&self) {
        if self.client.write().take().is_some() {
            tracing::info!(session_id = self.session_id, "ZooKeeper session closed");
        }
    }
}

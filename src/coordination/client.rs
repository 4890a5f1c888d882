use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use super::{join_path, CoordinationStore, CreateMode, DeletionWatch, SessionId, SessionState};
use crate::config::{CoordinationConfig, RetryConfig};
use crate::error::{ConductorError, Result};

/// Shared, namespaced handle to one coordination session.
///
/// One client per process; safe to use concurrently from many tasks. Every
/// operation retries on connection loss according to the configured
/// [`RetryConfig`] and takes paths relative to the namespace root.
pub struct CoordinationClient {
    store: Arc<dyn CoordinationStore>,
    namespace: String,
    retry: RetryConfig,
}

impl CoordinationClient {
    /// Wrap a session and wait until it reports connected.
    ///
    /// # Errors
    ///
    /// Returns `ConnectTimeout` if the session is not connected within the
    /// configured connection timeout. Callers treat this as fatal at startup.
    pub async fn start(
        store: Arc<dyn CoordinationStore>,
        config: &CoordinationConfig,
    ) -> Result<Self> {
        let timeout = config.connection_timeout();
        let deadline = Instant::now() + timeout;

        loop {
            match store.state() {
                SessionState::Connected => break,
                SessionState::Lost => {
                    return Err(ConductorError::SessionExpired(store.session_id()));
                }
                SessionState::Suspended => {
                    if Instant::now() >= deadline {
                        return Err(ConductorError::ConnectTimeout(timeout));
                    }
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }

        let namespace = format!("/{}", config.namespace.trim_matches('/'));
        tracing::info!(
            session_id = store.session_id(),
            namespace = %namespace,
            connect_string = %config.connect_string,
            "Coordination client started"
        );

        Ok(Self {
            store,
            namespace,
            retry: config.retry.clone(),
        })
    }

    pub fn session_id(&self) -> SessionId {
        self.store.session_id()
    }

    pub fn state(&self) -> SessionState {
        self.store.state()
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Absolute store path for a namespace-relative path.
    pub fn resolve(&self, path: &str) -> String {
        join_path(&self.namespace, path)
    }

    /// Strip the namespace prefix from an absolute store path.
    pub fn relative<'a>(&self, absolute: &'a str) -> &'a str {
        absolute
            .strip_prefix(self.namespace.as_str())
            .filter(|rest| rest.starts_with('/'))
            .unwrap_or(absolute)
    }

    /// Create a node; returns the namespace-relative path actually created.
    pub async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<String> {
        let absolute = self.resolve(path);
        let created = self
            .with_retry("create", || {
                let data = data.clone();
                let absolute = absolute.clone();
                async move { self.store.create(&absolute, data, mode).await }
            })
            .await?;
        Ok(self.relative(&created).to_string())
    }

    pub async fn get_data(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let absolute = self.resolve(path);
        self.with_retry("get_data", || self.store.get_data(&absolute))
            .await
    }

    pub async fn set_data(&self, path: &str, data: Vec<u8>) -> Result<()> {
        let absolute = self.resolve(path);
        self.with_retry("set_data", || {
            let data = data.clone();
            let absolute = absolute.clone();
            async move { self.store.set_data(&absolute, data).await }
        })
        .await
    }

    pub async fn exists(&self, path: &str) -> Result<bool> {
        let absolute = self.resolve(path);
        self.with_retry("exists", || self.store.exists(&absolute))
            .await
    }

    pub async fn get_children(&self, path: &str) -> Result<Vec<String>> {
        let absolute = self.resolve(path);
        self.with_retry("get_children", || self.store.get_children(&absolute))
            .await
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        let absolute = self.resolve(path);
        self.with_retry("delete", || self.store.delete(&absolute))
            .await
    }

    pub async fn watch_deletion(&self, path: &str) -> Result<Option<DeletionWatch>> {
        let absolute = self.resolve(path);
        self.with_retry("watch_deletion", || self.store.watch_deletion(&absolute))
            .await
    }

    pub async fn close(&self) {
        self.store.close().await;
        tracing::info!(session_id = self.session_id(), "Coordination client closed");
    }

    /// Run `op`, retrying retryable failures with exponential backoff.
    async fn with_retry<T, F, Fut>(&self, op_name: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                    let delay = backoff_delay(&self.retry, attempt);
                    tracing::debug!(
                        op = op_name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying coordination operation"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn backoff_delay(retry: &RetryConfig, attempt: u32) -> Duration {
    let exp = retry
        .base_sleep()
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(retry.max_sleep());
    let jitter_ceiling = (retry.base_sleep_ms / 4).max(1);
    let jitter = rand::thread_rng().gen_range(0..jitter_ceiling);
    exp + Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryEnsemble;

    fn fast_config() -> CoordinationConfig {
        CoordinationConfig {
            namespace: "test".to_string(),
            connection_timeout_ms: 100,
            retry: RetryConfig {
                base_sleep_ms: 5,
                max_sleep_ms: 20,
                max_retries: 2,
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn paths_are_namespaced() {
        let ensemble = MemoryEnsemble::new();
        let session = Arc::new(ensemble.connect());
        let client = CoordinationClient::start(session.clone(), &fast_config())
            .await
            .unwrap();

        let created = client
            .create("/a/b", Vec::new(), CreateMode::Persistent)
            .await
            .unwrap();
        assert_eq!(created, "/a/b");
        assert!(session.exists("/test/a/b").await.unwrap());
        assert_eq!(client.resolve("/a"), "/test/a");
    }

    #[tokio::test]
    async fn start_times_out_when_ensemble_unreachable() {
        let ensemble = MemoryEnsemble::new();
        ensemble.set_available(false);
        let session = Arc::new(ensemble.connect());

        let result = CoordinationClient::start(session, &fast_config()).await;
        assert!(matches!(result, Err(ConductorError::ConnectTimeout(_))));
    }

    #[tokio::test]
    async fn operations_give_up_after_retries() {
        let ensemble = MemoryEnsemble::new();
        let client = CoordinationClient::start(Arc::new(ensemble.connect()), &fast_config())
            .await
            .unwrap();

        ensemble.set_available(false);
        let err = client.exists("/a").await.unwrap_err();
        assert!(matches!(err, ConductorError::ConnectionLoss(_)));
    }

    #[tokio::test]
    async fn retry_recovers_when_connection_returns() {
        let ensemble = MemoryEnsemble::new();
        let mut config = fast_config();
        config.retry.base_sleep_ms = 40;
        config.retry.max_retries = 5;
        let client = CoordinationClient::start(Arc::new(ensemble.connect()), &config)
            .await
            .unwrap();

        ensemble.set_available(false);
        let restore = ensemble.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            restore.set_available(true);
        });

        assert!(client.exists("/").await.is_ok());
    }

    #[test]
    fn backoff_grows_and_caps() {
        let retry = RetryConfig {
            base_sleep_ms: 100,
            max_sleep_ms: 300,
            max_retries: 5,
        };
        let first = backoff_delay(&retry, 0);
        let third = backoff_delay(&retry, 2);
        assert!(first >= Duration::from_millis(100) && first < Duration::from_millis(125));
        assert!(third >= Duration::from_millis(300) && third < Duration::from_millis(325));
    }
}

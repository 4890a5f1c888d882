use std::net::SocketAddr;
use std::time::Duration;

/// Retry policy for coordination store operations.
///
/// Exponential backoff: attempt `n` sleeps `base_sleep * 2^n` (capped at
/// `max_sleep`) plus a small random jitter.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub base_sleep_ms: u64,
    pub max_sleep_ms: u64,
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_sleep_ms: 1000,
            max_sleep_ms: 10_000,
            max_retries: 3,
        }
    }
}

impl RetryConfig {
    pub fn base_sleep(&self) -> Duration {
        Duration::from_millis(self.base_sleep_ms)
    }

    pub fn max_sleep(&self) -> Duration {
        Duration::from_millis(self.max_sleep_ms)
    }
}

/// Connection settings for the coordination store session.
#[derive(Debug, Clone)]
pub struct CoordinationConfig {
    /// Ensemble address list, e.g. "zk1:2181,zk2:2181".
    pub connect_string: String,
    /// Root under which every path of this service lives.
    pub namespace: String,
    /// How long the ensemble keeps a silent session (and its ephemeral
    /// nodes) alive.
    pub session_timeout_ms: u64,
    /// How long startup waits for the session to connect before giving up.
    pub connection_timeout_ms: u64,
    pub retry: RetryConfig,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            connect_string: "127.0.0.1:2181".to_string(),
            namespace: "conductor".to_string(),
            session_timeout_ms: 60_000,
            connection_timeout_ms: 15_000,
            retry: RetryConfig::default(),
        }
    }
}

impl CoordinationConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }
}

/// Task execution lock settings.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Hard ceiling on how long `acquire` waits for the mutex.
    pub acquire_timeout: Duration,
    /// Age after which a held lock is reported as stale. Advisory only.
    pub stale_after: Duration,
    /// How often the node audits its own held locks for staleness.
    pub audit_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(30),
            stale_after: Duration::from_secs(30 * 60),
            audit_interval: Duration::from_secs(60),
        }
    }
}

/// Publisher and consumer settings.
#[derive(Debug, Clone)]
pub struct EventsConfig {
    /// Service name stamped into the `source` field of published events.
    pub source: String,
    /// Consumer group prefix; each node appends its own id.
    pub group_prefix: String,
    pub poll_timeout: Duration,
    /// In-process redelivery attempts for a record whose handler fails.
    pub max_redeliveries: u32,
    pub redelivery_backoff: Duration,
    /// Number of recent event ids remembered for duplicate suppression.
    pub dedupe_window: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            source: "conductor-api".to_string(),
            group_prefix: "conductor-broadcast".to_string(),
            poll_timeout: Duration::from_millis(500),
            max_redeliveries: 3,
            redelivery_backoff: Duration::from_millis(200),
            dedupe_window: 10_000,
        }
    }
}

/// Live stream fan-out settings.
#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    /// Buffered messages per client before the client counts as dead.
    pub channel_capacity: usize,
    /// Maximum lifetime of one live stream; the client must reconnect after.
    pub stream_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            stream_timeout: Duration::from_secs(30 * 60),
            heartbeat_interval: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: String,
    /// Address for the live stream / status HTTP endpoints. `None` disables it.
    pub http_addr: Option<SocketAddr>,
    pub coordination: CoordinationConfig,
    pub locks: LockConfig,
    pub events: EventsConfig,
    pub broadcast: BroadcastConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "node-1".to_string(),
            http_addr: None,
            coordination: CoordinationConfig::default(),
            locks: LockConfig::default(),
            events: EventsConfig::default(),
            broadcast: BroadcastConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Default::default()
        }
    }

    pub fn with_http_addr(mut self, addr: SocketAddr) -> Self {
        self.http_addr = Some(addr);
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.locks.acquire_timeout = timeout;
        self
    }

    /// Consumer group used by this node's broadcast consumer.
    pub fn consumer_group(&self) -> String {
        format!("{}-{}", self.events.group_prefix, self.node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_config_default() {
        let cfg = RetryConfig::default();
        assert_eq!(cfg.base_sleep(), Duration::from_secs(1));
        assert_eq!(cfg.max_sleep(), Duration::from_secs(10));
        assert_eq!(cfg.max_retries, 3);
    }

    #[test]
    fn coordination_config_default() {
        let cfg = CoordinationConfig::default();
        assert_eq!(cfg.namespace, "conductor");
        assert_eq!(cfg.connect_string, "127.0.0.1:2181");
        assert_eq!(cfg.connection_timeout(), Duration::from_secs(15));
        assert_eq!(cfg.session_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn lock_config_default() {
        let cfg = LockConfig::default();
        assert_eq!(cfg.acquire_timeout, Duration::from_secs(30));
        assert_eq!(cfg.stale_after, Duration::from_secs(1800));
    }

    #[test]
    fn events_config_default() {
        let cfg = EventsConfig::default();
        assert_eq!(cfg.source, "conductor-api");
        assert_eq!(cfg.max_redeliveries, 3);
        assert_eq!(cfg.dedupe_window, 10_000);
    }

    #[test]
    fn node_config_new() {
        let cfg = NodeConfig::new("api-7");
        assert_eq!(cfg.node_id, "api-7");
        assert!(cfg.http_addr.is_none());
        assert_eq!(cfg.locks.acquire_timeout, Duration::from_secs(30));
    }

    #[test]
    fn node_config_builders() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let cfg = NodeConfig::new("api-2")
            .with_http_addr(addr)
            .with_acquire_timeout(Duration::from_millis(250));
        assert_eq!(cfg.http_addr, Some(addr));
        assert_eq!(cfg.locks.acquire_timeout, Duration::from_millis(250));
    }

    #[test]
    fn consumer_group_is_per_node() {
        let a = NodeConfig::new("a");
        let b = NodeConfig::new("b");
        assert_eq!(a.consumer_group(), "conductor-broadcast-a");
        assert_ne!(a.consumer_group(), b.consumer_group());
    }
}

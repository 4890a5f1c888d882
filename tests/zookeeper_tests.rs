//! Lock exclusivity across separate ZooKeeper sessions, the way two node
//! processes would see it. Needs a running ensemble; set `ZOOKEEPER_CONNECT`
//! (default `127.0.0.1:2181`) and run with `--features zookeeper -- --ignored`.

#![cfg(feature = "zookeeper")]

use std::sync::Arc;
use std::time::Duration;

use conductor_lite::config::{CoordinationConfig, LockConfig};
use conductor_lite::coordination::{CoordinationClient, ZooKeeperSession};
use conductor_lite::lock::ExecutionLockService;

fn zk_config() -> CoordinationConfig {
    CoordinationConfig {
        connect_string: std::env::var("ZOOKEEPER_CONNECT")
            .unwrap_or_else(|_| "127.0.0.1:2181".to_string()),
        namespace: format!("conductor-test-{}", uuid::Uuid::new_v4()),
        session_timeout_ms: 6_000,
        connection_timeout_ms: 5_000,
        ..Default::default()
    }
}

async fn lock_service(config: &CoordinationConfig, node_id: &str) -> ExecutionLockService {
    let session = ZooKeeperSession::connect(config).await.expect("connect to ZooKeeper");
    let client = CoordinationClient::start(Arc::new(session), config)
        .await
        .expect("session connected");
    ExecutionLockService::new(
        Arc::new(client),
        node_id,
        LockConfig {
            acquire_timeout: Duration::from_millis(500),
            ..Default::default()
        },
    )
}

#[tokio::test]
#[ignore = "requires a running ZooKeeper ensemble"]
async fn test_separate_sessions_share_one_lock() {
    let config = zk_config();
    let a = lock_service(&config, "node-a").await;
    let b = lock_service(&config, "node-b").await;

    let held = a.acquire("t1").await.expect("first session acquires");
    assert!(b.acquire("t1").await.is_none(), "second session must not acquire");
    assert!(b.is_locked("t1").await);
    assert_eq!(b.holder("t1").await.unwrap().node_id, "node-a");

    assert!(a.release(&held).await);
    let taken_over = b.acquire("t1").await.expect("free after release");
    assert!(b.release(&taken_over).await);
    assert!(!a.is_locked("t1").await);
}

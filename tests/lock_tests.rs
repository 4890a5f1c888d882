//! Execution lock tests across nodes sharing one coordination ensemble.
//!
//! These cover mutual exclusion between nodes, release and reacquire,
//! waiters taking over after release, and locks freed by session expiry.


use std::time::Duration;

use test_harness::{assert_eventually, TestCluster};

#[tokio::test]
async fn test_only_one_node_holds_a_task_lock() {
    let cluster = TestCluster::new(3).await;

    let attempts = cluster.nodes.values().map(|node| {
        let locks = node.locks.clone();
        async move { locks.acquire("task-1").await }
    });
    let results = futures::future::join_all(attempts).await;

    let held: Vec<_> = results.into_iter().flatten().collect();
    assert_eq!(held.len(), 1, "exactly one node should win the lock");

    let winner = &held[0];
    for node in cluster.nodes.values() {
        assert!(node.locks.is_locked("task-1").await);
        let holder = node.locks.holder("task-1").await.expect("holder metadata");
        assert_eq!(holder.node_id, winner.holder_id);
        assert_eq!(holder.task_id, "task-1");
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_locks_on_different_tasks_are_independent() {
    let cluster = TestCluster::new(2).await;
    let a = cluster.node("node-1");
    let b = cluster.node("node-2");

    let lock_a = a.locks.acquire("task-a").await.expect("node-1 locks task-a");
    let lock_b = b.locks.acquire("task-b").await.expect("node-2 locks task-b");

    assert_eq!(lock_a.holder_id, "node-1");
    assert_eq!(lock_b.holder_id, "node-2");
    assert_eq!(a.locks.held_locks().len(), 1);
    assert_eq!(b.locks.held_locks().len(), 1);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_release_then_reacquire_elsewhere() {
    let cluster = TestCluster::new(2).await;
    let a = cluster.node("node-1");
    let b = cluster.node("node-2");

    let lock = a.locks.acquire("task-1").await.expect("first acquire");
    assert!(b.locks.acquire("task-1").await.is_none());

    assert!(a.locks.release(&lock).await);
    assert!(!b.locks.is_locked("task-1").await);
    assert!(a.locks.held_locks().is_empty());

    let relock = b.locks.acquire("task-1").await.expect("reacquire after release");
    assert_eq!(relock.holder_id, "node-2");
    let holder = a.locks.holder("task-1").await.expect("holder metadata");
    assert_eq!(holder.node_id, "node-2");

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_waiter_acquires_when_holder_releases() {
    let cluster = TestCluster::new(2).await;
    let a = cluster.node("node-1");
    let b = cluster.node("node-2");

    let lock = a.locks.acquire("task-1").await.expect("first acquire");

    let waiter_locks = b.locks.clone();
    let waiter = tokio::spawn(async move {
        waiter_locks
            .acquire_with_timeout("task-1", Duration::from_secs(2))
            .await
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(a.locks.release(&lock).await);

    let acquired = waiter.await.unwrap().expect("waiter should take over");
    assert_eq!(acquired.holder_id, "node-2");

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_expired_session_frees_its_locks() {
    let mut cluster = TestCluster::new(2).await;

    let lock = cluster
        .node("node-1")
        .locks
        .acquire("task-1")
        .await
        .expect("first acquire");
    assert_eq!(lock.holder_id, "node-1");

    cluster.crash_node("node-1");

    let survivor = cluster.node("node-2").locks.clone();
    assert_eventually(
        || {
            let survivor = survivor.clone();
            async move { !survivor.is_locked("task-1").await }
        },
        Duration::from_secs(2),
        "lock should be freed when its holder's session expires",
    )
    .await;

    let relock = survivor.acquire("task-1").await.expect("acquire after expiry");
    assert_eq!(relock.holder_id, "node-2");

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_graceful_stop_releases_held_locks() {
    let mut cluster = TestCluster::new(2).await;

    cluster
        .node("node-1")
        .locks
        .acquire("task-1")
        .await
        .expect("first acquire");

    let node = cluster.nodes.remove("node-1").expect("node-1");
    node.stop().await;

    let survivor = cluster.node("node-2");
    assert!(!survivor.locks.is_locked("task-1").await);
    assert!(survivor.locks.acquire("task-1").await.is_some());

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_invalid_task_ids_are_never_locked() {
    let cluster = TestCluster::new(1).await;
    let node = cluster.node("node-1");

    assert!(node.locks.acquire("").await.is_none());
    assert!(node.locks.acquire("a/b").await.is_none());
    assert!(node.locks.held_locks().is_empty());

    cluster.shutdown().await;
}

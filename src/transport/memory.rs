//! In-process partitioned log broker.
//!
//! Keeps every record for the life of the broker. Each subscription tracks its
//! own read positions and starts from the group's committed offsets, so
//! dropping a subscription and subscribing again with the same group replays
//! everything that was never committed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{
    partition_for_key, BrokerSubscription, DeliveryReceipt, EventBroker, InboundRecord,
    OutboundRecord,
};
use crate::error::{ConductorError, Result};

pub const DEFAULT_PARTITIONS: usize = 3;

#[derive(Debug, Clone)]
struct StoredRecord {
    key: Option<String>,
    payload: Vec<u8>,
}

type PartitionKey = (String, i32);

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, Vec<Vec<StoredRecord>>>,
    /// `(group, topic, partition)` -> next offset to read.
    committed: HashMap<(String, String, i32), i64>,
}

impl BrokerState {
    fn partitions_mut(&mut self, topic: &str, count: usize) -> &mut Vec<Vec<StoredRecord>> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); count])
    }
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    partitions: usize,
    notify: Notify,
    available: AtomicBool,
}

/// Shared in-memory broker. Cheap to clone; clones share the same log.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(DEFAULT_PARTITIONS)
    }
}

impl MemoryBroker {
    /// Topics are created on first use with `partitions` partitions each.
    pub fn new(partitions: usize) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState::default()),
                partitions: partitions.max(1),
                notify: Notify::new(),
                available: AtomicBool::new(true),
            }),
        }
    }

    /// Toggle reachability; while unavailable every send and poll fails.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
        if available {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn partition_count(&self) -> usize {
        self.inner.partitions
    }

    /// Total records ever appended to `topic`.
    pub fn record_count(&self, topic: &str) -> usize {
        self.inner
            .state
            .lock()
            .topics
            .get(topic)
            .map(|partitions| partitions.iter().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// Next offset `group` will read from the partition, if it ever committed.
    pub fn committed_offset(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.inner
            .state
            .lock()
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
    }

    fn ensure_available(&self) -> Result<()> {
        if self.inner.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ConductorError::Broker("broker unreachable".to_string()))
        }
    }
}

#[async_trait]
impl EventBroker for MemoryBroker {
    async fn send(&self, record: OutboundRecord) -> Result<DeliveryReceipt> {
        self.ensure_available()?;
        let partition = partition_for_key(&record.key, self.inner.partitions);

        let offset = {
            let mut state = self.inner.state.lock();
            let log = &mut state.partitions_mut(&record.topic, self.inner.partitions)
                [partition as usize];
            log.push(StoredRecord {
                key: Some(record.key),
                payload: record.payload,
            });
            (log.len() - 1) as i64
        };

        self.inner.notify.notify_waiters();
        Ok(DeliveryReceipt { partition, offset })
    }

    async fn subscribe(&self, group: &str, topics: &[&str]) -> Result<Box<dyn BrokerSubscription>> {
        self.ensure_available()?;
        if topics.is_empty() {
            return Err(ConductorError::Config(
                "subscription needs at least one topic".to_string(),
            ));
        }

        let mut positions = HashMap::new();
        let mut order = Vec::new();
        {
            let mut state = self.inner.state.lock();
            for topic in topics {
                state.partitions_mut(topic, self.inner.partitions);
                for partition in 0..self.inner.partitions as i32 {
                    let start = state
                        .committed
                        .get(&(group.to_string(), topic.to_string(), partition))
                        .copied()
                        .unwrap_or(0);
                    positions.insert((topic.to_string(), partition), start);
                    order.push((topic.to_string(), partition));
                }
            }
        }

        tracing::debug!(group = %group, topics = ?topics, "Memory broker subscription opened");
        Ok(Box::new(MemorySubscription {
            broker: self.clone(),
            group: group.to_string(),
            positions,
            order,
            cursor: 0,
        }))
    }
}

pub struct MemorySubscription {
    broker: MemoryBroker,
    group: String,
    positions: HashMap<PartitionKey, i64>,
    /// Fixed partition order; `cursor` rotates through it between polls.
    order: Vec<PartitionKey>,
    cursor: usize,
}

impl MemorySubscription {
    fn next_available(&mut self) -> Option<InboundRecord> {
        let state = self.broker.inner.state.lock();
        let len = self.order.len();

        for step in 0..len {
            let idx = (self.cursor + step) % len;
            let (topic, partition) = &self.order[idx];
            let position = self.positions.get(&self.order[idx]).copied().unwrap_or(0);

            let stored = state
                .topics
                .get(topic)
                .and_then(|partitions| partitions.get(*partition as usize))
                .and_then(|log| log.get(position as usize));

            if let Some(stored) = stored {
                let record = InboundRecord {
                    topic: topic.clone(),
                    partition: *partition,
                    offset: position,
                    key: stored.key.clone(),
                    payload: stored.payload.clone(),
                };
                self.positions.insert(self.order[idx].clone(), position + 1);
                self.cursor = (idx + 1) % len;
                return Some(record);
            }
        }
        None
    }
}

#[async_trait]
impl BrokerSubscription for MemorySubscription {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<InboundRecord>> {
        let deadline = Instant::now() + timeout;
        let inner = self.broker.inner.clone();
        loop {
            // Register interest before scanning so a concurrent send is not missed.
            let notified = inner.notify.notified();
            self.broker.ensure_available()?;

            if let Some(record) = self.next_available() {
                return Ok(Some(record));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn commit(&mut self, record: &InboundRecord) -> Result<()> {
        self.broker.ensure_available()?;
        let mut state = self.broker.inner.state.lock();
        let next = record.offset + 1;
        state
            .committed
            .entry((self.group.clone(), record.topic.clone(), record.partition))
            .and_modify(|offset| *offset = (*offset).max(next))
            .or_insert(next);
        Ok(())
    }

    async fn seek(&mut self, record: &InboundRecord) -> Result<()> {
        let key = (record.topic.clone(), record.partition);
        match self.positions.get_mut(&key) {
            Some(position) => {
                *position = record.offset;
                Ok(())
            }
            None => Err(ConductorError::UnknownTopic(record.topic.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(topic: &str, key: &str, payload: &str) -> OutboundRecord {
        OutboundRecord {
            topic: topic.to_string(),
            key: key.to_string(),
            payload: payload.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn same_key_records_share_a_partition_in_order() {
        let broker = MemoryBroker::new(4);
        let first = broker.send(record("tasks", "t1", "a")).await.unwrap();
        let second = broker.send(record("tasks", "t1", "b")).await.unwrap();
        assert_eq!(first.partition, second.partition);
        assert_eq!(second.offset, first.offset + 1);

        let mut sub = broker.subscribe("g", &["tasks"]).await.unwrap();
        let a = sub.poll(Duration::from_millis(10)).await.unwrap().unwrap();
        let b = sub.poll(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(a.payload, b"a");
        assert_eq!(b.payload, b"b");
        assert_eq!(a.key.as_deref(), Some("t1"));
    }

    #[tokio::test]
    async fn poll_times_out_when_empty() {
        let broker = MemoryBroker::default();
        let mut sub = broker.subscribe("g", &["tasks"]).await.unwrap();
        assert!(sub.poll(Duration::from_millis(20)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn poll_wakes_on_send() {
        let broker = MemoryBroker::default();
        let mut sub = broker.subscribe("g", &["tasks"]).await.unwrap();

        let sender = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            sender.send(record("tasks", "t1", "late")).await.unwrap();
        });

        let got = sub.poll(Duration::from_secs(2)).await.unwrap().unwrap();
        assert_eq!(got.payload, b"late");
    }

    #[tokio::test]
    async fn uncommitted_records_are_redelivered_to_new_subscription() {
        let broker = MemoryBroker::new(1);
        broker.send(record("tasks", "t1", "a")).await.unwrap();
        broker.send(record("tasks", "t1", "b")).await.unwrap();

        {
            let mut sub = broker.subscribe("g", &["tasks"]).await.unwrap();
            let a = sub.poll(Duration::from_millis(10)).await.unwrap().unwrap();
            sub.commit(&a).await.unwrap();
            sub.poll(Duration::from_millis(10)).await.unwrap().unwrap();
        }
        assert_eq!(broker.committed_offset("g", "tasks", 0), Some(1));

        let mut again = broker.subscribe("g", &["tasks"]).await.unwrap();
        let b = again.poll(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(b.payload, b"b");
    }

    #[tokio::test]
    async fn groups_are_independent() {
        let broker = MemoryBroker::new(1);
        broker.send(record("tasks", "t1", "a")).await.unwrap();

        let mut g1 = broker.subscribe("g1", &["tasks"]).await.unwrap();
        let mut g2 = broker.subscribe("g2", &["tasks"]).await.unwrap();
        let a1 = g1.poll(Duration::from_millis(10)).await.unwrap().unwrap();
        g1.commit(&a1).await.unwrap();

        assert!(g2.poll(Duration::from_millis(10)).await.unwrap().is_some());
        assert_eq!(broker.committed_offset("g2", "tasks", 0), None);
    }

    #[tokio::test]
    async fn seek_rewinds_to_record() {
        let broker = MemoryBroker::new(1);
        broker.send(record("tasks", "t1", "a")).await.unwrap();

        let mut sub = broker.subscribe("g", &["tasks"]).await.unwrap();
        let a = sub.poll(Duration::from_millis(10)).await.unwrap().unwrap();
        sub.seek(&a).await.unwrap();
        let again = sub.poll(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(again.offset, a.offset);
    }

    #[tokio::test]
    async fn unavailable_broker_fails_sends() {
        let broker = MemoryBroker::default();
        broker.set_available(false);
        let err = broker.send(record("tasks", "t1", "a")).await.unwrap_err();
        assert!(matches!(err, ConductorError::Broker(_)));
        broker.set_available(true);
        assert!(broker.send(record("tasks", "t1", "a")).await.is_ok());
        assert_eq!(broker.record_count("tasks"), 1);
    }
}

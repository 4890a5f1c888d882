use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{Event, ALL_TOPICS};
use crate::config::EventsConfig;
use crate::error::Result;
use crate::transport::{BrokerSubscription, EventBroker, InboundRecord};

/// Local processing step for consumed events. Must be idempotent: the same
/// event may be delivered more than once.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct ConsumerMetrics {
    processed: AtomicU64,
    duplicates: AtomicU64,
    decode_failures: AtomicU64,
    handler_failures: AtomicU64,
    redeliveries: AtomicU64,
    abandoned: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerMetricsSnapshot {
    pub processed: u64,
    pub duplicates: u64,
    pub decode_failures: u64,
    pub handler_failures: u64,
    pub redeliveries: u64,
    pub abandoned: u64,
}

impl ConsumerMetrics {
    pub fn snapshot(&self) -> ConsumerMetricsSnapshot {
        ConsumerMetricsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            redeliveries: self.redeliveries.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
        }
    }

    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Bounded memory of recently processed event ids.
struct DedupeWindow {
    capacity: usize,
    order: VecDeque<Uuid>,
    seen: HashSet<Uuid>,
}

impl DedupeWindow {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    fn contains(&self, id: &Uuid) -> bool {
        self.seen.contains(id)
    }

    fn insert(&mut self, id: Uuid) {
        if self.capacity == 0 || !self.seen.insert(id) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
    }
}

type RecordPosition = (String, i32, i64);
type PartitionKey = (String, i32);

/// Reads lifecycle topics for one consumer group and hands each decoded event
/// to the handler. Offsets are committed only after the handler succeeds.
pub struct EventConsumer {
    broker: Arc<dyn EventBroker>,
    group: String,
    topics: Vec<String>,
    handler: Arc<dyn EventHandler>,
    config: EventsConfig,
    dedupe: DedupeWindow,
    /// Failed handler attempts per record still being redelivered.
    attempts: HashMap<RecordPosition, u32>,
    /// First abandoned offset per partition. Commits never move past it, so
    /// a restarted consumer replays the abandoned record.
    held_back: HashMap<PartitionKey, i64>,
    metrics: Arc<ConsumerMetrics>,
}

impl EventConsumer {
    pub fn new(
        broker: Arc<dyn EventBroker>,
        group: impl Into<String>,
        handler: Arc<dyn EventHandler>,
        config: EventsConfig,
    ) -> Self {
        Self {
            broker,
            group: group.into(),
            topics: ALL_TOPICS.iter().map(|t| t.to_string()).collect(),
            handler,
            dedupe: DedupeWindow::new(config.dedupe_window),
            config,
            attempts: HashMap::new(),
            held_back: HashMap::new(),
            metrics: Arc::new(ConsumerMetrics::default()),
        }
    }

    pub fn with_topics(mut self, topics: &[&str]) -> Self {
        self.topics = topics.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn metrics(&self) -> Arc<ConsumerMetrics> {
        self.metrics.clone()
    }

    /// Consume until `shutdown` fires.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let topics = self.topics.clone();
        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();

        let mut subscription = loop {
            match self.broker.subscribe(&self.group, &topic_refs).await {
                Ok(subscription) => break subscription,
                Err(e) => {
                    tracing::error!(group = %self.group, error = %e, "Failed to subscribe, retrying");
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(self.config.redelivery_backoff) => {}
                    }
                }
            }
        };
        tracing::info!(group = %self.group, topics = ?topic_refs, "Event consumer started");

        loop {
            let polled = tokio::select! {
                _ = shutdown.cancelled() => break,
                polled = subscription.poll(self.config.poll_timeout) => polled,
            };

            match polled {
                Ok(Some(record)) => {
                    self.process(subscription.as_mut(), record, &shutdown).await
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(group = %self.group, error = %e, "Poll failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.redelivery_backoff) => {}
                    }
                }
            }
        }

        tracing::info!(group = %self.group, "Event consumer stopped");
    }

    async fn process(
        &mut self,
        subscription: &mut dyn BrokerSubscription,
        record: InboundRecord,
        shutdown: &CancellationToken,
    ) {
        let event = match Event::from_json(&record.payload) {
            Ok(event) => event,
            Err(e) => {
                ConsumerMetrics::incr(&self.metrics.decode_failures);
                tracing::warn!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    payload = %record.payload_str(),
                    error = %e,
                    "Skipping undecodable record"
                );
                return;
            }
        };

        if self.dedupe.contains(&event.event_id) {
            ConsumerMetrics::incr(&self.metrics.duplicates);
            tracing::debug!(event_id = %event.event_id, "Duplicate event, skipping");
            self.commit(subscription, &record).await;
            return;
        }

        let position = (record.topic.clone(), record.partition, record.offset);
        match self.handler.handle(&event).await {
            Ok(()) => {
                self.attempts.remove(&position);
                self.dedupe.insert(event.event_id);
                ConsumerMetrics::incr(&self.metrics.processed);
                self.commit(subscription, &record).await;
            }
            Err(e) => {
                ConsumerMetrics::incr(&self.metrics.handler_failures);
                let attempt = {
                    let count = self.attempts.entry(position.clone()).or_insert(0);
                    *count += 1;
                    *count
                };

                if attempt <= self.config.max_redeliveries {
                    tracing::warn!(
                        topic = %record.topic,
                        offset = record.offset,
                        event_id = %event.event_id,
                        attempt,
                        error = %e,
                        "Event handler failed, redelivering"
                    );
                    tokio::select! {
                        // Not committed, so the record is replayed on restart.
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(self.config.redelivery_backoff * attempt) => {}
                    }
                    match subscription.seek(&record).await {
                        Ok(()) => ConsumerMetrics::incr(&self.metrics.redeliveries),
                        Err(seek_err) => {
                            tracing::error!(
                                topic = %record.topic,
                                offset = record.offset,
                                error = %seek_err,
                                "Failed to rewind for redelivery"
                            );
                        }
                    }
                } else {
                    self.attempts.remove(&position);
                    self.held_back
                        .entry((record.topic.clone(), record.partition))
                        .or_insert(record.offset);
                    ConsumerMetrics::incr(&self.metrics.abandoned);
                    tracing::error!(
                        topic = %record.topic,
                        partition = record.partition,
                        offset = record.offset,
                        key = ?record.key,
                        event_id = %event.event_id,
                        event_type = event.event_type(),
                        payload = %record.payload_str(),
                        error = %e,
                        "Giving up on event, offset left uncommitted for replay"
                    );
                }
            }
        }
    }

    async fn commit(&self, subscription: &mut dyn BrokerSubscription, record: &InboundRecord) {
        let partition = (record.topic.clone(), record.partition);
        if let Some(&floor) = self.held_back.get(&partition) {
            if record.offset >= floor {
                tracing::debug!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    held_at = floor,
                    "Commit held back behind abandoned record"
                );
                return;
            }
        }
        if let Err(e) = subscription.commit(record).await {
            tracing::warn!(
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                error = %e,
                "Failed to commit offset"
            );
        }
    }
}

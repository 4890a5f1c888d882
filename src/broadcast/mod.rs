//! Live fan-out of processed events to connected clients.
//!
//! Clients register a stream for one subject id or for every subject
//! (wildcard). Each stream is a bounded channel drained by the client's HTTP
//! response; a send that fails because the client is gone or too slow
//! removes the stream on the spot.
//!
//! # Registry layout
//!
//! ```text
//! registrations: SubjectKey -> { StreamId -> Sender }   (sharded DashMap)
//! index:         StreamId   -> SubjectKey               (for O(1) removal)
//! ```

pub mod sse;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;

use crate::config::BroadcastConfig;
use crate::error::{ConductorError, Result};
use crate::events::{Event, EventHandler};

pub use sse::sse_response;

pub const WILDCARD_LABEL: &str = "*";
pub const CONNECTED_EVENT: &str = "connected";
pub const HEARTBEAT_EVENT: &str = "heartbeat";

pub type StreamId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubjectKey {
    All,
    Subject(String),
}

impl SubjectKey {
    /// Blank subject ids count as "all subjects".
    pub fn from_option(subject_id: Option<&str>) -> Self {
        match subject_id.map(str::trim) {
            Some(id) if !id.is_empty() => SubjectKey::Subject(id.to_string()),
            _ => SubjectKey::All,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            SubjectKey::All => WILDCARD_LABEL,
            SubjectKey::Subject(id) => id,
        }
    }
}

/// One message on a client stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamMessage {
    pub event: String,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl StreamMessage {
    pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            data,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastStats {
    pub total_connections: usize,
    /// Distinct subject ids with at least one stream; wildcard excluded.
    pub active_subjects: usize,
    /// Streams per subject id. Wildcard streams are counted separately.
    pub per_subject_counts: BTreeMap<String, usize>,
    pub wildcard_connections: usize,
}

struct BroadcastInner {
    registrations: DashMap<SubjectKey, HashMap<StreamId, mpsc::Sender<StreamMessage>>>,
    index: DashMap<StreamId, SubjectKey>,
    next_id: AtomicU64,
    config: BroadcastConfig,
}

/// Registry of live client streams. Cheap to clone.
#[derive(Clone)]
pub struct BroadcastService {
    inner: Arc<BroadcastInner>,
}

/// Deregisters its stream when dropped.
pub struct StreamGuard {
    service: BroadcastService,
    id: StreamId,
}

impl StreamGuard {
    pub fn id(&self) -> StreamId {
        self.id
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.service.deregister(self.id);
    }
}

/// A registered stream: the receiving half plus the guard that keeps it
/// registered.
pub struct LiveStream {
    pub subject: SubjectKey,
    pub receiver: mpsc::Receiver<StreamMessage>,
    pub guard: StreamGuard,
}

impl LiveStream {
    pub fn id(&self) -> StreamId {
        self.guard.id
    }
}

impl BroadcastService {
    pub fn new(config: BroadcastConfig) -> Self {
        Self {
            inner: Arc::new(BroadcastInner {
                registrations: DashMap::new(),
                index: DashMap::new(),
                next_id: AtomicU64::new(1),
                config,
            }),
        }
    }

    pub fn config(&self) -> &BroadcastConfig {
        &self.inner.config
    }

    /// Open a new bounded stream for a subject (`None` for all subjects).
    pub fn register(&self, subject_id: Option<&str>) -> Result<LiveStream> {
        let (tx, rx) = mpsc::channel(self.inner.config.channel_capacity.max(1));
        let subject = SubjectKey::from_option(subject_id);
        let guard = self.register_sender(subject.clone(), tx)?;
        Ok(LiveStream {
            subject,
            receiver: rx,
            guard,
        })
    }

    /// Register an existing sender. Sends the `connected` message first; if
    /// that fails the stream is removed again and `StreamClosed` is returned.
    pub fn register_sender(
        &self,
        subject: SubjectKey,
        sender: mpsc::Sender<StreamMessage>,
    ) -> Result<StreamGuard> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let greeting = StreamMessage::new(
            CONNECTED_EVENT,
            json!({ "streamId": id, "subjectId": subject.label() }),
        );

        self.inner
            .registrations
            .entry(subject.clone())
            .or_default()
            .insert(id, sender.clone());
        self.inner.index.insert(id, subject.clone());

        let guard = StreamGuard {
            service: self.clone(),
            id,
        };

        if sender.try_send(greeting).is_err() {
            tracing::debug!(stream_id = id, subject = %subject.label(), "Initial send failed, dropping stream");
            // The guard's drop deregisters.
            return Err(ConductorError::StreamClosed);
        }

        tracing::debug!(stream_id = id, subject = %subject.label(), "Live stream registered");
        Ok(guard)
    }

    /// Remove a stream. Returns `false` if it was not registered.
    pub fn deregister(&self, id: StreamId) -> bool {
        let Some((_, subject)) = self.inner.index.remove(&id) else {
            return false;
        };

        if let Some(mut streams) = self.inner.registrations.get_mut(&subject) {
            streams.remove(&id);
        }
        self.inner
            .registrations
            .remove_if(&subject, |_, streams| streams.is_empty());

        tracing::debug!(stream_id = id, subject = %subject.label(), "Live stream deregistered");
        true
    }

    /// Deliver to every stream registered for `subject_id` and every wildcard
    /// stream. Returns how many streams accepted the message.
    pub fn on_event(&self, subject_id: &str, event_type: &str, data: serde_json::Value) -> usize {
        let message = StreamMessage::new(event_type, data);
        let targets = self.senders_for(&[SubjectKey::Subject(subject_id.to_string()), SubjectKey::All]);
        self.deliver(targets, &message)
    }

    /// Push a heartbeat to every stream, pruning the dead ones. Returns the
    /// number of streams still alive.
    pub fn heartbeat(&self) -> usize {
        let message = StreamMessage::new(HEARTBEAT_EVENT, json!({}));
        let targets: Vec<_> = self
            .inner
            .registrations
            .iter()
            .flat_map(|entry| {
                entry
                    .value()
                    .iter()
                    .map(|(id, tx)| (*id, tx.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();
        self.deliver(targets, &message)
    }

    fn senders_for(&self, keys: &[SubjectKey]) -> Vec<(StreamId, mpsc::Sender<StreamMessage>)> {
        let mut targets = Vec::new();
        for key in keys {
            if let Some(streams) = self.inner.registrations.get(key) {
                targets.extend(streams.iter().map(|(id, tx)| (*id, tx.clone())));
            }
        }
        targets
    }

    fn deliver(
        &self,
        targets: Vec<(StreamId, mpsc::Sender<StreamMessage>)>,
        message: &StreamMessage,
    ) -> usize {
        let mut delivered = 0;
        let mut dead = Vec::new();

        for (id, tx) in targets {
            match tx.try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(stream_id = id, event = %message.event, "Client stream full, dropping slow client");
                    dead.push(id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(id),
            }
        }

        for id in dead {
            self.deregister(id);
        }
        delivered
    }

    pub fn connection_count(&self) -> usize {
        self.inner.index.len()
    }

    pub fn stats(&self) -> BroadcastStats {
        let mut stats = BroadcastStats::default();
        for entry in self.inner.registrations.iter() {
            let count = entry.value().len();
            if count == 0 {
                continue;
            }
            stats.total_connections += count;
            match entry.key() {
                SubjectKey::All => stats.wildcard_connections += count,
                SubjectKey::Subject(subject) => {
                    stats.active_subjects += 1;
                    stats.per_subject_counts.insert(subject.clone(), count);
                }
            }
        }
        stats
    }
}

#[async_trait]
impl EventHandler for BroadcastService {
    async fn handle(&self, event: &Event) -> Result<()> {
        let data = serde_json::to_value(event)?;
        let delivered = self.on_event(event.subject_id(), event.event_type(), data);
        tracing::trace!(
            event_id = %event.event_id,
            subject = %event.subject_id(),
            delivered,
            "Event fanned out"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventPayload;

    fn service() -> BroadcastService {
        BroadcastService::new(BroadcastConfig {
            channel_capacity: 4,
            ..Default::default()
        })
    }

    #[test]
    fn register_sends_connected_first() {
        let svc = service();
        let mut live = svc.register(Some("s1")).unwrap();

        let hello = live.receiver.try_recv().unwrap();
        assert_eq!(hello.event, CONNECTED_EVENT);
        assert_eq!(hello.data["subjectId"], "s1");
        assert_eq!(svc.connection_count(), 1);
    }

    #[test]
    fn subject_streams_only_see_their_subject() {
        let svc = service();
        let mut s = svc.register(Some("S")).unwrap();
        let mut t = svc.register(Some("T")).unwrap();
        let mut all = svc.register(None).unwrap();
        for live in [&mut s, &mut t, &mut all] {
            live.receiver.try_recv().unwrap();
        }

        assert_eq!(svc.on_event("S", "taskCreated", json!({"n": 1})), 2);

        assert_eq!(s.receiver.try_recv().unwrap().data["n"], 1);
        assert!(t.receiver.try_recv().is_err());
        assert_eq!(all.receiver.try_recv().unwrap().event, "taskCreated");
    }

    #[test]
    fn dropping_guard_deregisters_and_removes_empty_set() {
        let svc = service();
        let live = svc.register(Some("s1")).unwrap();
        assert_eq!(svc.stats().active_subjects, 1);

        drop(live);
        let stats = svc.stats();
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_subjects, 0);
        assert!(stats.per_subject_counts.is_empty());
    }

    #[test]
    fn failed_initial_send_deregisters() {
        let svc = service();
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let result = svc.register_sender(SubjectKey::Subject("s1".into()), tx);
        assert!(matches!(result, Err(ConductorError::StreamClosed)));
        assert_eq!(svc.connection_count(), 0);
    }

    #[test]
    fn dead_stream_is_pruned_without_affecting_others() {
        let svc = service();
        let (dead_tx, dead_rx) = mpsc::channel(4);
        let dead_guard = svc
            .register_sender(SubjectKey::Subject("s1".into()), dead_tx)
            .unwrap();
        drop(dead_rx);
        let mut alive = svc.register(Some("s1")).unwrap();
        alive.receiver.try_recv().unwrap();

        assert_eq!(svc.on_event("s1", "x", json!(1)), 1);
        assert_eq!(svc.connection_count(), 1);
        assert_eq!(alive.receiver.try_recv().unwrap().event, "x");

        // Already removed; the guard's own drop is a no-op.
        assert!(!svc.deregister(dead_guard.id()));
    }

    #[test]
    fn full_channel_counts_as_dead() {
        let svc = BroadcastService::new(BroadcastConfig {
            channel_capacity: 1,
            ..Default::default()
        });
        let _slow = svc.register(Some("s1")).unwrap();
        // The connected message already fills the single slot.
        assert_eq!(svc.on_event("s1", "x", json!(1)), 0);
        assert_eq!(svc.connection_count(), 0);
    }

    #[test]
    fn per_stream_order_follows_call_order() {
        let svc = service();
        let mut live = svc.register(Some("s1")).unwrap();
        live.receiver.try_recv().unwrap();

        for n in 0..3 {
            svc.on_event("s1", "x", json!(n));
        }
        let got: Vec<_> = (0..3)
            .map(|_| live.receiver.try_recv().unwrap().data)
            .collect();
        assert_eq!(got, vec![json!(0), json!(1), json!(2)]);
    }

    #[test]
    fn heartbeat_reaches_everyone_and_prunes() {
        let svc = service();
        let mut a = svc.register(Some("s1")).unwrap();
        let b = svc.register(None).unwrap();
        a.receiver.try_recv().unwrap();
        let LiveStream { receiver, guard, .. } = b;
        drop(receiver);

        assert_eq!(svc.heartbeat(), 1);
        assert_eq!(a.receiver.try_recv().unwrap().event, HEARTBEAT_EVENT);
        assert_eq!(svc.connection_count(), 1);
        drop(guard);
    }

    #[test]
    fn stats_report_wildcard_separately() {
        let svc = service();
        let _a = svc.register(Some("s1")).unwrap();
        let _b = svc.register(Some("s1")).unwrap();
        let _c = svc.register(Some("s2")).unwrap();
        let _d = svc.register(Some("  ")).unwrap();

        let stats = svc.stats();
        assert_eq!(stats.total_connections, 4);
        assert_eq!(stats.active_subjects, 2);
        assert_eq!(stats.per_subject_counts["s1"], 2);
        assert_eq!(stats.per_subject_counts.len(), 2);
        assert_eq!(stats.wildcard_connections, 1);

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["totalConnections"], 4);
        assert_eq!(json["wildcardConnections"], 1);
        assert!(json.get("perSubjectCounts").is_some());
    }

    #[test]
    fn subject_named_like_the_wildcard_is_counted_on_its_own() {
        let svc = service();
        let _literal = svc.register(Some(WILDCARD_LABEL)).unwrap();
        let _all = svc.register(None).unwrap();
        let _other = svc.register(None).unwrap();

        let stats = svc.stats();
        assert_eq!(stats.total_connections, 3);
        assert_eq!(stats.active_subjects, 1);
        assert_eq!(stats.per_subject_counts[WILDCARD_LABEL], 1);
        assert_eq!(stats.wildcard_connections, 2);
    }

    #[tokio::test]
    async fn handler_routes_by_event_subject() {
        let svc = service();
        let mut t9 = svc.register(Some("t9")).unwrap();
        t9.receiver.try_recv().unwrap();

        let event = Event::new(
            "test",
            EventPayload::TaskStatusChanged {
                task_id: "t9".into(),
                session_id: "s1".into(),
                previous_status: None,
                new_status: "COMPLETED".into(),
                error_code: None,
                error_message: None,
            },
        );
        svc.handle(&event).await.unwrap();

        let message = t9.receiver.try_recv().unwrap();
        assert_eq!(message.event, "taskStatusChanged");
        assert_eq!(message.data["newStatus"], "COMPLETED");
    }
}

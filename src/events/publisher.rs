use std::sync::Arc;

use tokio::task::JoinHandle;

use super::{Event, EventPayload};
use crate::error::Result;
use crate::transport::{DeliveryReceipt, EventBroker, OutboundRecord};

/// Appends lifecycle events to their category topic, keyed by subject id.
///
/// Every send is awaited and its outcome logged. Failures carry the topic,
/// key, event id and serialized payload so the event can be replayed by hand.
#[derive(Clone)]
pub struct EventPublisher {
    broker: Arc<dyn EventBroker>,
    source: String,
}

impl EventPublisher {
    pub fn new(broker: Arc<dyn EventBroker>, source: impl Into<String>) -> Self {
        Self {
            broker,
            source: source.into(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Build an event stamped with this publisher's source.
    pub fn event(&self, payload: EventPayload) -> Event {
        Event::new(self.source.clone(), payload)
    }

    pub async fn publish(&self, event: &Event) -> Result<DeliveryReceipt> {
        let topic = event.topic();
        let key = event.subject_id().to_string();

        let payload = match event.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(
                    topic,
                    key = %key,
                    event_id = %event.event_id,
                    error = %e,
                    "Failed to serialize event"
                );
                return Err(e);
            }
        };

        let record = OutboundRecord {
            topic: topic.to_string(),
            key: key.clone(),
            payload: payload.clone(),
        };

        match self.broker.send(record).await {
            Ok(receipt) => {
                tracing::debug!(
                    topic,
                    key = %key,
                    event_id = %event.event_id,
                    event_type = event.event_type(),
                    partition = receipt.partition,
                    offset = receipt.offset,
                    "Published event"
                );
                Ok(receipt)
            }
            Err(e) => {
                tracing::error!(
                    topic,
                    key = %key,
                    event_id = %event.event_id,
                    event_type = event.event_type(),
                    payload = %String::from_utf8_lossy(&payload),
                    error = %e,
                    "Failed to publish event"
                );
                Err(e)
            }
        }
    }

    /// Publish without making the caller wait. The send is still awaited
    /// (and logged) on a background task.
    pub fn publish_detached(&self, event: Event) -> JoinHandle<()> {
        let publisher = self.clone();
        tokio::spawn(async move {
            let _ = publisher.publish(&event).await;
        })
    }

    pub async fn session_status_changed(
        &self,
        session_id: &str,
        previous_status: Option<&str>,
        new_status: &str,
        user_id: Option<&str>,
        reason: Option<&str>,
    ) -> Result<DeliveryReceipt> {
        let event = self.event(EventPayload::SessionStatusChanged {
            session_id: session_id.to_string(),
            previous_status: previous_status.map(str::to_string),
            new_status: new_status.to_string(),
            user_id: user_id.map(str::to_string),
            reason: reason.map(str::to_string),
        });
        self.publish(&event).await
    }

    pub async fn workspace_created(
        &self,
        workspace_id: &str,
        session_id: &str,
        user_id: Option<&str>,
        image: Option<&str>,
    ) -> Result<DeliveryReceipt> {
        let event = self.event(EventPayload::WorkspaceCreated {
            workspace_id: workspace_id.to_string(),
            session_id: session_id.to_string(),
            user_id: user_id.map(str::to_string),
            image: image.map(str::to_string),
        });
        self.publish(&event).await
    }

    pub async fn workspace_started(
        &self,
        workspace_id: &str,
        session_id: &str,
        endpoint: Option<&str>,
    ) -> Result<DeliveryReceipt> {
        let event = self.event(EventPayload::WorkspaceStarted {
            workspace_id: workspace_id.to_string(),
            session_id: session_id.to_string(),
            endpoint: endpoint.map(str::to_string),
        });
        self.publish(&event).await
    }

    pub async fn workspace_stopped(
        &self,
        workspace_id: &str,
        session_id: &str,
        reason: Option<&str>,
    ) -> Result<DeliveryReceipt> {
        let event = self.event(EventPayload::WorkspaceStopped {
            workspace_id: workspace_id.to_string(),
            session_id: session_id.to_string(),
            reason: reason.map(str::to_string),
        });
        self.publish(&event).await
    }

    pub async fn task_created(
        &self,
        task_id: &str,
        session_id: &str,
        task_type: Option<&str>,
        created_by: Option<&str>,
    ) -> Result<DeliveryReceipt> {
        let event = self.event(EventPayload::TaskCreated {
            task_id: task_id.to_string(),
            session_id: session_id.to_string(),
            task_type: task_type.map(str::to_string),
            created_by: created_by.map(str::to_string),
        });
        self.publish(&event).await
    }

    pub async fn task_status_changed(
        &self,
        task_id: &str,
        session_id: &str,
        previous_status: Option<&str>,
        new_status: &str,
        error_code: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<DeliveryReceipt> {
        let event = self.event(EventPayload::TaskStatusChanged {
            task_id: task_id.to_string(),
            session_id: session_id.to_string(),
            previous_status: previous_status.map(str::to_string),
            new_status: new_status.to_string(),
            error_code: error_code.map(str::to_string),
            error_message: error_message.map(str::to_string),
        });
        self.publish(&event).await
    }
}

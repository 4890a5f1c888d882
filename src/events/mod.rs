//! Lifecycle events for sessions, workspaces and tasks.
//!
//! Events are immutable facts about transitions that already happened in an
//! external state machine. On the wire they are JSON objects with camelCase
//! fields and an `eventType` discriminator:
//!
//! ```json
//! {"eventId":"…","timestamp":"…","source":"conductor-api",
//!  "eventType":"taskStatusChanged","taskId":"t9","sessionId":"s1",
//!  "previousStatus":"IN_PROGRESS","newStatus":"COMPLETED"}
//! ```

pub mod consumer;
pub mod publisher;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ConductorError, Result};

pub use consumer::{ConsumerMetrics, EventConsumer, EventHandler};
pub use publisher::EventPublisher;

pub const TOPIC_SESSIONS: &str = "sessions";
pub const TOPIC_WORKSPACES: &str = "workspaces";
pub const TOPIC_TASKS: &str = "tasks";
pub const ALL_TOPICS: [&str; 3] = [TOPIC_SESSIONS, TOPIC_WORKSPACES, TOPIC_TASKS];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventCategory {
    Session,
    Workspace,
    Task,
}

impl EventCategory {
    pub fn topic(self) -> &'static str {
        match self {
            EventCategory::Session => TOPIC_SESSIONS,
            EventCategory::Workspace => TOPIC_WORKSPACES,
            EventCategory::Task => TOPIC_TASKS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "eventType", rename_all = "camelCase")]
pub enum EventPayload {
    #[serde(rename_all = "camelCase")]
    SessionStatusChanged {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous_status: Option<String>,
        new_status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    WorkspaceCreated {
        workspace_id: String,
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    WorkspaceStarted {
        workspace_id: String,
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    WorkspaceStopped {
        workspace_id: String,
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    TaskCreated {
        task_id: String,
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        created_by: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    TaskStatusChanged {
        task_id: String,
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous_status: Option<String>,
        new_status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_code: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },
}

impl EventPayload {
    /// The wire discriminator, also used as the live stream event name.
    pub fn event_type(&self) -> &'static str {
        match self {
            EventPayload::SessionStatusChanged { .. } => "sessionStatusChanged",
            EventPayload::WorkspaceCreated { .. } => "workspaceCreated",
            EventPayload::WorkspaceStarted { .. } => "workspaceStarted",
            EventPayload::WorkspaceStopped { .. } => "workspaceStopped",
            EventPayload::TaskCreated { .. } => "taskCreated",
            EventPayload::TaskStatusChanged { .. } => "taskStatusChanged",
        }
    }

    pub fn category(&self) -> EventCategory {
        match self {
            EventPayload::SessionStatusChanged { .. } => EventCategory::Session,
            EventPayload::WorkspaceCreated { .. }
            | EventPayload::WorkspaceStarted { .. }
            | EventPayload::WorkspaceStopped { .. } => EventCategory::Workspace,
            EventPayload::TaskCreated { .. } | EventPayload::TaskStatusChanged { .. } => {
                EventCategory::Task
            }
        }
    }

    /// Identity of the thing the event is about; the partition key and the
    /// live stream routing key.
    pub fn subject_id(&self) -> &str {
        match self {
            EventPayload::SessionStatusChanged { session_id, .. } => session_id,
            EventPayload::WorkspaceCreated { workspace_id, .. }
            | EventPayload::WorkspaceStarted { workspace_id, .. }
            | EventPayload::WorkspaceStopped { workspace_id, .. } => workspace_id,
            EventPayload::TaskCreated { task_id, .. }
            | EventPayload::TaskStatusChanged { task_id, .. } => task_id,
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            EventPayload::SessionStatusChanged { session_id, .. }
            | EventPayload::WorkspaceCreated { session_id, .. }
            | EventPayload::WorkspaceStarted { session_id, .. }
            | EventPayload::WorkspaceStopped { session_id, .. }
            | EventPayload::TaskCreated { session_id, .. }
            | EventPayload::TaskStatusChanged { session_id, .. } => session_id,
        }
    }
}

impl Event {
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            correlation_id: None,
            payload,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }

    pub fn category(&self) -> EventCategory {
        self.payload.category()
    }

    pub fn topic(&self) -> &'static str {
        self.payload.category().topic()
    }

    pub fn subject_id(&self) -> &str {
        self.payload.subject_id()
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a wire payload. Unknown `eventType` values and malformed JSON
    /// both surface as [`ConductorError::Decode`].
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| ConductorError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_status(task_id: &str) -> Event {
        Event::new(
            "conductor-api",
            EventPayload::TaskStatusChanged {
                task_id: task_id.to_string(),
                session_id: "s1".to_string(),
                previous_status: Some("IN_PROGRESS".to_string()),
                new_status: "COMPLETED".to_string(),
                error_code: None,
                error_message: None,
            },
        )
    }

    #[test]
    fn wire_format_has_discriminator_and_camel_case() {
        let event = task_status("t9").with_correlation_id("req-1");
        let json: serde_json::Value = serde_json::from_slice(&event.to_json().unwrap()).unwrap();

        assert_eq!(json["eventType"], "taskStatusChanged");
        assert_eq!(json["taskId"], "t9");
        assert_eq!(json["sessionId"], "s1");
        assert_eq!(json["newStatus"], "COMPLETED");
        assert_eq!(json["correlationId"], "req-1");
        assert!(json.get("errorCode").is_none());
        assert!(json.get("eventId").is_some());
    }

    #[test]
    fn decodes_what_it_encodes() {
        let event = task_status("t9");
        let decoded = Event::from_json(&event.to_json().unwrap()).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn decodes_external_payload_with_optional_fields_missing() {
        let raw = br#"{
            "eventId": "6f1c2a9e-1b7f-4c55-9d87-3f0f4c7b1a11",
            "timestamp": "2024-05-01T10:00:00Z",
            "source": "session-service",
            "eventType": "workspaceStarted",
            "workspaceId": "w1",
            "sessionId": "s1"
        }"#;
        let event = Event::from_json(raw).unwrap();
        assert_eq!(event.event_type(), "workspaceStarted");
        assert_eq!(event.subject_id(), "w1");
        assert_eq!(event.topic(), TOPIC_WORKSPACES);
        assert!(event.correlation_id.is_none());
    }

    #[test]
    fn unknown_event_type_is_a_decode_error() {
        let raw = br#"{
            "eventId": "6f1c2a9e-1b7f-4c55-9d87-3f0f4c7b1a11",
            "timestamp": "2024-05-01T10:00:00Z",
            "source": "future-service",
            "eventType": "quotaExceeded",
            "sessionId": "s1"
        }"#;
        assert!(matches!(Event::from_json(raw), Err(ConductorError::Decode(_))));
        assert!(matches!(Event::from_json(b"not json"), Err(ConductorError::Decode(_))));
    }

    #[test]
    fn categories_route_to_topics_and_subjects() {
        let session = EventPayload::SessionStatusChanged {
            session_id: "s1".into(),
            previous_status: None,
            new_status: "ACTIVE".into(),
            user_id: None,
            reason: None,
        };
        assert_eq!(session.category().topic(), "sessions");
        assert_eq!(session.subject_id(), "s1");

        let created = EventPayload::TaskCreated {
            task_id: "t1".into(),
            session_id: "s1".into(),
            task_type: None,
            created_by: None,
        };
        assert_eq!(created.category().topic(), "tasks");
        assert_eq!(created.subject_id(), "t1");
        assert_eq!(created.session_id(), "s1");
    }
}

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConductorError {
    #[error("Coordination store connection lost: {0}")]
    ConnectionLoss(String),

    #[error("Coordination session {0} expired")]
    SessionExpired(u64),

    #[error("Could not connect to coordination store within {0:?}")]
    ConnectTimeout(Duration),

    #[error("Node already exists: {0}")]
    NodeExists(String),

    #[error("Node does not exist: {0}")]
    NoNode(String),

    #[error("Node has children: {0}")]
    NotEmpty(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    #[error("Event decode error: {0}")]
    Decode(String),

    #[error("Event handler failed: {0}")]
    Handler(String),

    #[error("Client stream closed")]
    StreamClosed,

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Invalid task transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ConductorError {
    /// Errors that may succeed if the same operation is attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConductorError::ConnectionLoss(_))
    }
}

pub type Result<T> = std::result::Result<T, ConductorError>;

//! Error types for the delivery subsystem

use thiserror::Error;

/// Errors raised by transports, the event bus, idempotency and the manager
#[derive(Debug, Error)]
pub enum MqError {
    /// Connection error to the broker
    #[error("Connection error: {0}")]
    Connection(String),

    /// Message publishing error
    #[error("Publish error: {0}")]
    Publish(String),

    /// Subscription error
    #[error("Subscribe error: {0}")]
    Subscribe(String),

    /// Broker protocol violation (unexpected frame, error response)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Payload cannot be carried by the JSON envelope
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// No transport registered for the requested broker kind
    #[error("Unsupported broker type: {0}")]
    UnsupportedBroker(String),

    /// Business failure returned by a registered handler
    #[error("Handler error: {0}")]
    Handler(String),

    /// Delivery reached a key with no registered handler
    #[error("No handler registered for {topic}:{channel}")]
    HandlerNotFound { topic: String, channel: String },

    /// A handler is already registered for the key
    #[error("Handler already registered for {topic}:{channel}")]
    DuplicateRegistration { topic: String, channel: String },

    /// Idempotency ledger / cache / subscription store failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Delivery context was cancelled (shutdown in progress)
    #[error("Operation cancelled")]
    Cancelled,

    /// Manager was started twice
    #[error("Manager already started")]
    AlreadyStarted,

    /// Unknown subscription id or key
    #[error("Not subscribed: {0}")]
    NotSubscribed(String),

    /// Broker I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// One or more resources failed to close
    #[error("Close failed for {} resource(s): {}", .0.len(), join_errors(.0))]
    Close(Vec<MqError>),
}

impl MqError {
    /// Wrap any displayable business failure as a handler error
    pub fn handler(err: impl std::fmt::Display) -> Self {
        MqError::Handler(err.to_string())
    }

    /// Collapse a list of close failures into a single result
    pub fn aggregate(mut errors: Vec<MqError>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(MqError::Close(errors)),
        }
    }
}

fn join_errors(errors: &[MqError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type alias for delivery operations
pub type Result<T> = std::result::Result<T, MqError>;

impl From<async_nats::Error> for MqError {
    fn from(err: async_nats::Error) -> Self {
        MqError::Connection(err.to_string())
    }
}

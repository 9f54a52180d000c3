//! Consumer error types

use thiserror::Error;
use std::io;

/// Result type for consumer operations
pub type ConsumerResult<T> = Result<T, ConsumerError>;

/// Consumer error types
#[derive(Error, Debug)]
pub enum ConsumerError {
    /// A required configuration value is absent; the consumer must not start
    #[error("Missing configuration: {0}")]
    MissingConfiguration(String),

    /// A topic was registered without a handler able to process its message type
    #[error("Invalid handler registration for {type_name}: {reason}")]
    InvalidHandlerRegistration {
        /// Name of the offending message or handler type
        type_name: String,
        /// Why the registration was rejected
        reason: String,
    },

    /// Unrecoverable client-level fault, stops the consume loop
    #[error("Transport fault: {0}")]
    TransportFault(String),

    /// Recoverable client error, the poll is retried after a short pause
    #[error("Transport error: {0}")]
    Transport(String),

    /// Payload could not be decoded into the registered message type
    #[error("Failed to deserialize {message_type}: {reason}")]
    Deserialization {
        /// Registered message type name
        message_type: &'static str,
        /// Decoder error
        reason: String,
    },

    /// Handler body failed
    #[error("Handler {handler_type} failed")]
    Handler {
        /// Registered handler type name
        handler_type: &'static str,
        /// Error returned by the handler
        #[source]
        source: anyhow::Error,
    },

    /// A single attempt exceeded the timeout ceiling
    #[error("Timed out after {0:?}")]
    TimedOut(std::time::Duration),

    /// The operation observed the cancellation signal
    #[error("Operation cancelled")]
    Cancelled,

    /// Dead-letter publication failed
    #[error("DLQ error: {0}")]
    DeadLetter(String),

    /// Publishing a message failed
    #[error("Produce error: {0}")]
    Produce(String),

    /// No topic is configured for a message type on the producer side
    #[error("No topic configured for message type {0}")]
    UnregisteredMessageType(String),

    /// Settings file could not be parsed
    #[error("Settings error: {0}")]
    Settings(#[from] serde_yaml::Error),

    /// IO errors
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

impl ConsumerError {
    /// Whether the error must stop the consume loop
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ConsumerError::TransportFault(_)
                | ConsumerError::MissingConfiguration(_)
                | ConsumerError::InvalidHandlerRegistration { .. }
        )
    }
}

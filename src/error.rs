//! Error types for a3s-stream-relay

use crate::frame::ParseError;
use thiserror::Error;

/// Errors that can occur while relaying an agent stream
#[derive(Debug, Error)]
pub enum RelayError {
    /// Bad request input, rejected before any channel activity
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The agent runtime stream failed (connection drop, timeout, HTTP error)
    #[error("Transport error: {0}")]
    Transport(String),

    /// A frame could not be decoded
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// Tool description could not be generated
    #[error("Translation failed: {0}")]
    Translation(String),

    /// Pushing one event to the delivery sink failed
    #[error("Failed to deliver event to session '{session_id}': {reason}")]
    Delivery {
        session_id: String,
        reason: String,
    },

    /// Channel backend connection failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Publish failure
    #[error("Failed to publish to subject '{subject}': {reason}")]
    Publish {
        subject: String,
        reason: String,
    },

    /// Subscribe failure
    #[error("Failed to subscribe to subject '{subject}': {reason}")]
    Subscribe {
        subject: String,
        reason: String,
    },

    /// Stream creation or management error
    #[error("Stream error: {0}")]
    Stream(String),

    /// Consumer creation or management error
    #[error("Consumer error: {0}")]
    Consumer(String),

    /// Acknowledgement failure
    #[error("Failed to acknowledge message: {0}")]
    Ack(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// History store write or read failure
    #[error("History store error: {0}")]
    History(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

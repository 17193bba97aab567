//! Error types for the Anchor relay

use crate::types::{ClientId, RoomId};
use thiserror::Error;

/// Result type for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Relay error types
#[derive(Debug, Error)]
pub enum RelayError {
    /// Frame was not a JSON object or a field had the wrong shape
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Frame carried a `type` the relay does not know
    #[error("Unknown packet type: {0}")]
    UnknownPacketType(String),

    /// Transport read/write failure
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// No live client with this id
    #[error("Client not found: {0}")]
    ClientNotFound(ClientId),

    /// No live room with this id
    #[error("Room not found: {0}")]
    RoomNotFound(RoomId),

    /// Client's outbound queue is full
    #[error("Outbound queue full for client {0}")]
    QueueFull(ClientId),

    /// Peer withheld the frame delimiter past the configured limit
    #[error("Inbound buffer exceeded {limit} bytes without a delimiter")]
    BufferLimitExceeded { limit: usize },

    /// Invalid configuration value
    #[error("Config error: {0}")]
    ConfigError(String),
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::SerializationError(err.to_string())
    }
}

impl RelayError {
    /// Whether this error only invalidates a single frame and the connection
    /// can keep going
    pub fn is_frame_local(&self) -> bool {
        matches!(
            self,
            RelayError::MalformedFrame(_)
                | RelayError::UnknownPacketType(_)
                | RelayError::SerializationError(_)
        )
    }
}

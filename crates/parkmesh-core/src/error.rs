//! Error types for parkmesh core

use thiserror::Error;

/// Errors related to envelope encoding and decoding
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("Invalid payload for {kind}: {reason}")]
    InvalidPayload { kind: String, reason: String },

    #[error("Missing event_id on {0} envelope")]
    MissingEventId(String),

    #[error("Encode failed: {0}")]
    Encode(String),
}

/// Errors surfaced by an [`EventStore`](crate::store::EventStore) implementation
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("Event already recorded: {0}")]
    DuplicateEvent(String),

    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

impl StoreError {
    /// Create a new Backend error
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::InvalidEnvelope(err.to_string())
    }
}

/// Result type alias for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Result type alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;

//! Error types for the node coordinator

use thiserror::Error;

use parkmesh_core::{ProtocolError, StoreError};
use parkmesh_transport::TransportError;

/// Errors that can occur in the node coordinator
#[derive(Debug, Error)]
pub enum NodeError {
    /// Transport layer error
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Event store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Malformed or incomplete envelope
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Node already started
    #[error("Node already started")]
    AlreadyStarted,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A local entry for a plate that already has an open session
    #[error("Plate {plate_id} is already parked under {event_id}")]
    AlreadyParked { plate_id: String, event_id: String },

    /// No session with this event id
    #[error("Unknown session: {0}")]
    UnknownSession(String),

    /// The session has already exited
    #[error("Session already closed: {0}")]
    SessionClosed(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for NodeError {
    fn from(e: serde_json::Error) -> Self {
        NodeError::Serialization(e.to_string())
    }
}

/// Result type alias for node operations
pub type NodeResult<T> = Result<T, NodeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_converts() {
        let err: NodeError = StoreError::DuplicateEvent("A_1_X".to_string()).into();
        assert!(matches!(err, NodeError::Store(StoreError::DuplicateEvent(_))));
        assert!(err.to_string().contains("A_1_X"));
    }

    #[test]
    fn test_already_parked_message() {
        let err = NodeError::AlreadyParked {
            plate_id: "29A12345".to_string(),
            event_id: "A_1000_29A12345".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Plate 29A12345 is already parked under A_1000_29A12345"
        );
    }
}

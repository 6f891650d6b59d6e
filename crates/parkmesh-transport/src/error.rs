//! Transport layer error types

use thiserror::Error;

use parkmesh_core::ProtocolError;

/// Unified transport error type
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to bind listener on {addr}: {reason}")]
    Bind { addr: String, reason: String },

    #[error("Failed to connect: {0}")]
    Connect(String),

    #[error("Timeout connecting to {0}")]
    ConnectTimeout(String),

    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Stream closed")]
    StreamClosed,
}

/// Result type alias for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

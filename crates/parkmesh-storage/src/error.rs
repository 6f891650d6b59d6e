//! Error types for parkmesh-storage

use thiserror::Error;

use parkmesh_core::StoreError;

/// Errors that can occur in storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// I/O error while opening the database
    #[error("I/O error: {0}")]
    Io(String),

    /// Database error (transaction, table or commit failure)
    #[error("Database error: {0}")]
    Database(String),

    /// An event id was inserted twice
    #[error("Event already recorded: {0}")]
    DuplicateEvent(String),

    /// An index points at a row that does not exist
    #[error("Corrupt index: {0}")]
    CorruptIndex(String),

    /// Error during serialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Error during deserialization
    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

impl StorageError {
    /// Wrap any redb error as a Database error
    pub fn database(err: impl std::fmt::Display) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}

impl From<postcard::Error> for StorageError {
    fn from(err: postcard::Error) -> Self {
        StorageError::Deserialization(err.to_string())
    }
}

impl From<StorageError> for StoreError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::DuplicateEvent(id) => StoreError::DuplicateEvent(id),
            StorageError::Serialization(msg) => StoreError::Serialization(msg),
            StorageError::Deserialization(msg) => StoreError::Deserialization(msg),
            other => StoreError::Backend(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let storage_err: StorageError = io_err.into();
        assert!(matches!(storage_err, StorageError::Io(_)));
    }

    #[test]
    fn test_store_error_mapping() {
        let err: StoreError = StorageError::DuplicateEvent("A_1_X".to_string()).into();
        assert!(matches!(err, StoreError::DuplicateEvent(_)));

        let err: StoreError = StorageError::database("commit failed").into();
        assert!(matches!(err, StoreError::Backend(_)));
        assert!(err.to_string().contains("commit failed"));
    }
}

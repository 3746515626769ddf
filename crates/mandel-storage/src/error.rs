//! Error types for mandel-storage.

use thiserror::Error;

/// Result type alias for mandel-storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during object storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested key does not exist.
    #[error("object not found: {0}")]
    NotFound(String),

    /// The provider rejected or failed the request.
    #[error("storage request failed: {0}")]
    Request(String),

    /// The response body could not be read.
    #[error("failed to read object body: {0}")]
    Body(String),
}

impl StorageError {
    /// Whether this error means the key is absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }

    /// Whether a fresh attempt may succeed. A body that fails to read
    /// includes the SDK's own checksum validation failing mid-stream.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Body(_))
    }
}

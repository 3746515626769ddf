//! Error types for mandel-core.

use crate::types::MandelboxId;
use thiserror::Error;

/// Result type alias for mandel-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur while orchestrating mandelboxes.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A resource pool has no free slot.
    #[error("{resource} capacity exhausted: {detail}")]
    Capacity {
        /// Which pool ran out
        resource: &'static str,
        /// What was attempted
        detail: String,
    },

    /// Error from the container runtime.
    #[error("runtime error: {0}")]
    Runtime(#[from] mandel_runtime::RuntimeError),

    /// Error from object storage.
    #[error("storage error: {0}")]
    Storage(#[from] mandel_storage::StorageError),

    /// The state store returned an error.
    #[error("state store error: {0}")]
    Store(String),

    /// A state store write matched no rows.
    #[error("{operation} affected no rows for mandelbox {id}")]
    NoRowsAffected {
        /// Name of the store operation
        operation: &'static str,
        /// Mandelbox the write targeted
        id: MandelboxId,
    },

    /// A state store write matched no instance row.
    #[error("{operation} affected no rows for instance {instance}")]
    InstanceNoRowsAffected {
        /// Name of the store operation
        operation: &'static str,
        /// Instance the write targeted
        instance: String,
    },

    /// Mandelbox not found.
    #[error("mandelbox not found: {0}")]
    NotFound(MandelboxId),

    /// Mandelbox is already tracked.
    #[error("mandelbox already exists: {0}")]
    AlreadyExists(MandelboxId),

    /// Invalid state for the requested operation.
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state
        expected: String,
        /// Actual state
        actual: String,
    },

    /// The client did not complete the handshake in time.
    #[error("handshake not received within {0:?}")]
    HandshakeTimeout(std::time::Duration),

    /// A bounded wait elapsed.
    #[error("timed out after {0:?}: {1}")]
    Timeout(std::time::Duration, String),

    /// A caller passed an unusable value.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Encryption or decryption failed.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Archive creation or extraction failed.
    #[error("archive error: {0}")]
    Archive(String),

    /// Downloaded bytes did not match the provider checksum.
    #[error("checksum mismatch for {key}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Object key
        key: String,
        /// Provider checksum
        expected: String,
        /// Checksum of the bytes received
        actual: String,
    },

    /// The operation was cancelled by mandelbox or process shutdown.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// The process can no longer make progress.
    #[error("fatal: {0}")]
    Fatal(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Whether this is pool exhaustion, which is always recoverable by
    /// abandoning the current spin-up.
    pub fn is_capacity(&self) -> bool {
        matches!(self, CoreError::Capacity { .. })
    }

    /// Whether a store write matched no rows, as opposed to failing.
    pub fn is_no_rows(&self) -> bool {
        matches!(
            self,
            CoreError::NoRowsAffected { .. } | CoreError::InstanceNoRowsAffected { .. }
        )
    }

    /// Whether the process itself can no longer make progress.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CoreError::Fatal(_))
    }

    pub(crate) fn capacity(resource: &'static str, detail: impl Into<String>) -> Self {
        CoreError::Capacity {
            resource,
            detail: detail.into(),
        }
    }
}

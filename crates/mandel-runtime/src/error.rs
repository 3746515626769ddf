//! Error types for mandel-runtime.

use thiserror::Error;

/// Result type alias for mandel-runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors that can occur while talking to the container runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Could not reach the runtime daemon.
    #[error("runtime connection failed: {0}")]
    Connection(String),

    /// Container creation failed.
    #[error("failed to create container {name}: {reason}")]
    Create {
        /// Requested container name
        name: String,
        /// Underlying error message
        reason: String,
    },

    /// Container start failed.
    #[error("failed to start container {id}: {reason}")]
    Start {
        /// Container id
        id: String,
        /// Underlying error message
        reason: String,
    },

    /// Container stop failed.
    #[error("failed to stop container {id}: {reason}")]
    Stop {
        /// Container id
        id: String,
        /// Underlying error message
        reason: String,
    },

    /// Container removal failed.
    #[error("failed to remove container {id}: {reason}")]
    Remove {
        /// Container id
        id: String,
        /// Underlying error message
        reason: String,
    },

    /// Image lookup failed.
    #[error("image error: {0}")]
    Image(String),

    /// Invalid container configuration.
    #[error("invalid container spec: {0}")]
    InvalidSpec(String),
}

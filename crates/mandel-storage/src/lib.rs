//! # mandel-storage
//!
//! Object storage layer for encrypted user config archives.
//!
//! The orchestrator only needs a handful of operations from a bucket:
//! upload with an integrity checksum, fetch metadata, download with the
//! provider's checksum, and find the most recently modified object under a
//! prefix. [`ObjectStore`] names exactly those; [`S3Store`] implements them
//! over aws-sdk-s3 and [`MemoryStore`] keeps everything in process for local
//! development and tests.
//!
//! ## Quick Start
//!
//! ```no_run
//! use mandel_storage::{ObjectStore, S3Store};
//!
//! # async fn example() -> mandel_storage::Result<()> {
//! let store = S3Store::from_env("whist-user-app-configs", Some("us-east-1".into())).await;
//! let latest = store
//!     .most_recent_matching("user/dev/browsers/chrome/", "whist-app-config.tar.gz.enc")
//!     .await?;
//! if let Some(meta) = latest {
//!     let data = store.get(&meta.key).await?;
//!     println!("{} bytes", data.bytes.len());
//! }
//! # Ok(())
//! # }
//! ```

mod error;
mod memory;
mod s3;

pub use error::{Result, StorageError};
pub use memory::MemoryStore;
pub use s3::S3Store;

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// Metadata of one stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Object key.
    pub key: String,
    /// Size in bytes.
    pub size: u64,
    /// Last modification time, if the provider reports one.
    pub last_modified: Option<DateTime<Utc>>,
    /// Provider version id.
    pub version: Option<String>,
    /// Base64 SHA-256 checksum, if the provider stored one.
    pub checksum_sha256: Option<String>,
}

/// Downloaded object contents.
#[derive(Debug, Clone)]
pub struct ObjectData {
    /// Raw object bytes.
    pub bytes: Bytes,
    /// Base64 SHA-256 checksum reported by the provider.
    pub checksum_sha256: Option<String>,
    /// Provider version id.
    pub version: Option<String>,
}

/// Result of an upload.
#[derive(Debug, Clone, Default)]
pub struct PutOutcome {
    /// Provider version id of the new object.
    pub version: Option<String>,
}

/// Operations on a single bucket.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload `body` under `key`, sending its SHA-256 checksum.
    async fn put(&self, key: &str, body: Bytes) -> Result<PutOutcome>;

    /// Fetch metadata for `key`, or `None` if it does not exist.
    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>>;

    /// Download `key`.
    ///
    /// # Errors
    /// [`StorageError::NotFound`] if the key does not exist.
    async fn get(&self, key: &str) -> Result<ObjectData>;

    /// The most recently modified object whose key starts with `prefix` and
    /// ends with `suffix`.
    async fn most_recent_matching(&self, prefix: &str, suffix: &str)
        -> Result<Option<ObjectMeta>>;
}

/// Base64-encoded SHA-256 of `data`, the form S3 uses for checksums.
pub fn sha256_base64(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    base64::engine::general_purpose::STANDARD.encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_base64_known_value() {
        // sha256("") = e3b0c442...
        assert_eq!(
            sha256_base64(b""),
            "47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU="
        );
    }
}

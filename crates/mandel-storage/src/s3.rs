//! S3-backed [`ObjectStore`].

use crate::error::{Result, StorageError};
use crate::{sha256_base64, ObjectData, ObjectMeta, ObjectStore, PutOutcome};
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::ChecksumMode;
use aws_sdk_s3::Client;
use bytes::Bytes;
use chrono::{DateTime, Utc};

/// Object store over a single S3 bucket.
#[derive(Clone)]
pub struct S3Store {
    client: Client,
    bucket: String,
}

impl std::fmt::Debug for S3Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Store")
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

impl S3Store {
    /// Build a client from the ambient AWS environment (credentials chain,
    /// profile, instance metadata).
    pub async fn from_env(bucket: impl Into<String>, region: Option<String>) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(aws_config::Region::new(region));
        }
        let sdk_config = loader.load().await;
        let bucket = bucket.into();

        tracing::info!(%bucket, "S3 object store configured");
        Self {
            client: Client::new(&sdk_config),
            bucket,
        }
    }

    /// Wrap a pre-configured client.
    pub fn with_client(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }
}

fn to_chrono(dt: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put(&self, key: &str, body: Bytes) -> Result<PutOutcome> {
        let checksum = sha256_base64(&body);
        let size = body.len();

        let output = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .checksum_sha256(checksum)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| StorageError::Request(e.to_string()))?;

        tracing::debug!(bucket = %self.bucket, %key, size, "Uploaded object");
        Ok(PutOutcome {
            version: output.version_id().map(String::from),
        })
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .checksum_mode(ChecksumMode::Enabled)
            .send()
            .await;

        match result {
            Ok(output) => Ok(Some(ObjectMeta {
                key: key.to_string(),
                size: output.content_length().unwrap_or(0).max(0) as u64,
                last_modified: output.last_modified().and_then(to_chrono),
                version: output.version_id().map(String::from),
                checksum_sha256: output.checksum_sha256().map(String::from),
            })),
            Err(e) => {
                if e.as_service_error().map(|se| se.is_not_found()).unwrap_or(false) {
                    Ok(None)
                } else {
                    Err(StorageError::Request(e.to_string()))
                }
            }
        }
    }

    async fn get(&self, key: &str) -> Result<ObjectData> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .checksum_mode(ChecksumMode::Enabled)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().map(|se| se.is_no_such_key()).unwrap_or(false) {
                    StorageError::NotFound(key.to_string())
                } else {
                    StorageError::Request(e.to_string())
                }
            })?;

        let checksum_sha256 = output.checksum_sha256().map(String::from);
        let version = output.version_id().map(String::from);
        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| StorageError::Body(e.to_string()))?
            .into_bytes();

        tracing::debug!(bucket = %self.bucket, %key, size = bytes.len(), "Downloaded object");
        Ok(ObjectData {
            bytes,
            checksum_sha256,
            version,
        })
    }

    async fn most_recent_matching(
        &self,
        prefix: &str,
        suffix: &str,
    ) -> Result<Option<ObjectMeta>> {
        let mut newest: Option<ObjectMeta> = None;
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);

            if let Some(token) = &continuation_token {
                request = request.continuation_token(token);
            }

            let response = request
                .send()
                .await
                .map_err(|e| StorageError::Request(e.to_string()))?;

            for object in response.contents() {
                let Some(key) = object.key() else { continue };
                if !key.ends_with(suffix) {
                    continue;
                }
                let candidate = ObjectMeta {
                    key: key.to_string(),
                    size: object.size().unwrap_or(0).max(0) as u64,
                    last_modified: object.last_modified().and_then(to_chrono),
                    version: None,
                    checksum_sha256: None,
                };
                let is_newer = match &newest {
                    None => true,
                    Some(current) => candidate.last_modified > current.last_modified,
                };
                if is_newer {
                    newest = Some(candidate);
                }
            }

            if response.is_truncated().unwrap_or(false) {
                continuation_token = response.next_continuation_token().map(String::from);
            } else {
                break;
            }
        }

        Ok(newest)
    }
}

//! In-process [`ObjectStore`] for local development and tests.

use crate::error::{Result, StorageError};
use crate::{sha256_base64, ObjectData, ObjectMeta, ObjectStore, PutOutcome};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

struct StoredObject {
    bytes: Bytes,
    meta: ObjectMeta,
}

#[derive(Default)]
struct Inner {
    objects: HashMap<String, StoredObject>,
    /// Remaining corrupted reads per key.
    corruptions: HashMap<String, u32>,
    /// Remaining failed body reads per key.
    body_failures: HashMap<String, u32>,
    version_counter: u64,
    last_stamp: Option<chrono::DateTime<Utc>>,
}

/// Object store kept entirely in memory.
///
/// Modification times are strictly increasing across puts so "most recent"
/// is well defined even when writes land in the same clock tick.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` downloads of `key` return damaged bytes while
    /// still reporting the original checksum.
    #[cfg(any(test, feature = "test-util"))]
    pub fn inject_corruption(&self, key: &str, times: u32) {
        self.inner.lock().corruptions.insert(key.to_string(), times);
    }

    /// Make the next `times` downloads of `key` fail while reading the body,
    /// the way S3 reports a checksum failure it detected itself.
    #[cfg(any(test, feature = "test-util"))]
    pub fn inject_body_failure(&self, key: &str, times: u32) {
        self.inner.lock().body_failures.insert(key.to_string(), times);
    }

    /// Keys currently stored, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.lock().objects.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.inner.lock().objects.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn take_one(counts: &mut HashMap<String, u32>, key: &str) -> bool {
    match counts.get_mut(key) {
        Some(remaining) if *remaining > 0 => {
            *remaining -= 1;
            true
        }
        _ => false,
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put(&self, key: &str, body: Bytes) -> Result<PutOutcome> {
        let mut inner = self.inner.lock();

        let mut stamp = Utc::now();
        if let Some(last) = inner.last_stamp {
            if stamp <= last {
                stamp = last + ChronoDuration::microseconds(1);
            }
        }
        inner.last_stamp = Some(stamp);
        inner.version_counter += 1;
        let version = format!("v{}", inner.version_counter);

        let meta = ObjectMeta {
            key: key.to_string(),
            size: body.len() as u64,
            last_modified: Some(stamp),
            version: Some(version.clone()),
            checksum_sha256: Some(sha256_base64(&body)),
        };
        inner
            .objects
            .insert(key.to_string(), StoredObject { bytes: body, meta });

        Ok(PutOutcome {
            version: Some(version),
        })
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>> {
        Ok(self.inner.lock().objects.get(key).map(|o| o.meta.clone()))
    }

    async fn get(&self, key: &str) -> Result<ObjectData> {
        let mut inner = self.inner.lock();
        if take_one(&mut inner.body_failures, key) && inner.objects.contains_key(key) {
            return Err(StorageError::Body(format!("injected read failure for {key}")));
        }
        let corrupt = take_one(&mut inner.corruptions, key);

        let object = inner
            .objects
            .get(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;

        let bytes = if corrupt {
            let mut damaged = object.bytes.to_vec();
            match damaged.first_mut() {
                Some(b) => *b ^= 0xff,
                None => damaged.push(0),
            }
            Bytes::from(damaged)
        } else {
            object.bytes.clone()
        };

        Ok(ObjectData {
            bytes,
            checksum_sha256: object.meta.checksum_sha256.clone(),
            version: object.meta.version.clone(),
        })
    }

    async fn most_recent_matching(
        &self,
        prefix: &str,
        suffix: &str,
    ) -> Result<Option<ObjectMeta>> {
        let inner = self.inner.lock();
        Ok(inner
            .objects
            .values()
            .filter(|o| o.meta.key.starts_with(prefix) && o.meta.key.ends_with(suffix))
            .max_by_key(|o| o.meta.last_modified)
            .map(|o| o.meta.clone()))
    }
}

//! The blob store port (spec §1's "external collaborators"): a
//! byte-addressed object store keyed by the date-partitioned layout from
//! spec §6. Production deployments implement [`BlobStore`] against the
//! real object store; this module ships an in-memory reference
//! implementation for tests and single-process hosting.

use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// `<cat>/<YYYY>/<MM>/<DD>/<verificationId>/<filename>` (spec §6).
pub fn date_partitioned_key(
    category: &str,
    timestamp: DateTime<Utc>,
    verification_id: &str,
    filename: &str,
) -> String {
    format!(
        "{category}/{}/{verification_id}/{filename}",
        timestamp.format("%Y/%m/%d")
    )
}

/// Validates an artifact key against the shape required by spec §8
/// invariant 4: `^<cat>/\d{4}/\d{2}/\d{2}/verif-\d{14}-[0-9a-f]{4}/<filename>$`.
pub fn is_well_formed_artifact_key(key: &str) -> bool {
    let parts: Vec<&str> = key.split('/').collect();
    if parts.len() != 6 {
        return false;
    }
    let [category, year, month, day, verification_id, _filename] = [
        parts[0], parts[1], parts[2], parts[3], parts[4], parts[5],
    ];
    let known_category = matches!(category, "processing" | "images" | "prompts" | "responses" | "temp");
    let digits = |s: &str, n: usize| s.len() == n && s.chars().all(|c| c.is_ascii_digit());
    let verification_id_ok = verification_id.starts_with("verif-")
        && verification_id.len() == "verif-".len() + 14 + 1 + 4
        && verification_id.as_bytes()[6 + 14] == b'-';
    known_category
        && digits(year, 4)
        && digits(month, 2)
        && digits(day, 2)
        && verification_id_ok
}

/// A byte-addressed object store.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Write `body` to `bucket`/`key`, replacing any prior content. Returns
    /// an opaque etag for the new version.
    async fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<String>;

    /// Read the full body at `bucket`/`key`.
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>>;

    /// Check existence without reading the body (the HEAD-equivalent check
    /// in spec §4.2/§4.4).
    async fn exists(&self, bucket: &str, key: &str) -> Result<bool>;

    /// Read object metadata (size) without the body.
    async fn head(&self, bucket: &str, key: &str) -> Result<ObjectMetadata>;
}

/// Metadata returned by [`BlobStore::head`].
#[derive(Debug, Clone, Copy)]
pub struct ObjectMetadata {
    pub size_bytes: u64,
}

/// An in-memory [`BlobStore`], keyed by `(bucket, key)`. Suitable for tests
/// and for hosting the workflow as a single long-running process without an
/// external object store.
#[derive(Clone, Default)]
pub struct InMemoryBlobStore {
    objects: Arc<RwLock<HashMap<(String, String), Vec<u8>>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seed an object, used by tests to stage fixture images.
    pub async fn seed(&self, bucket: &str, key: &str, body: Vec<u8>) {
        self.objects
            .write()
            .await
            .insert((bucket.to_string(), key.to_string()), body);
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<String> {
        let etag = format!("{:x}", md5_like_digest(&body));
        self.objects
            .write()
            .await
            .insert((bucket.to_string(), key.to_string()), body);
        Ok(etag)
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        self.objects
            .read()
            .await
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| {
                Error::resource_validation("BlobStore", "get", format!("no such object: {bucket}/{key}"))
            })
    }

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        Ok(self
            .objects
            .read()
            .await
            .contains_key(&(bucket.to_string(), key.to_string())))
    }

    async fn head(&self, bucket: &str, key: &str) -> Result<ObjectMetadata> {
        let objects = self.objects.read().await;
        objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|body| ObjectMetadata {
                size_bytes: body.len() as u64,
            })
            .ok_or_else(|| {
                Error::resource_validation("BlobStore", "head", format!("no such object: {bucket}/{key}"))
            })
    }
}

/// A content-derived digest, used only for the in-memory store's synthetic
/// etag. Not cryptographically meaningful.
fn md5_like_digest(body: &[u8]) -> u64 {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(body);
    let digest = hasher.finalize();
    u64::from_be_bytes(digest[..8].try_into().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn date_partitioned_key_matches_spec_layout() {
        let ts = Utc.with_ymd_and_hms(2025, 3, 7, 0, 0, 0).unwrap();
        let key = date_partitioned_key("responses", ts, "verif-20250307000000-aaaa", "turn1-raw.json");
        assert_eq!(
            key,
            "responses/2025/03/07/verif-20250307000000-aaaa/turn1-raw.json"
        );
        assert!(is_well_formed_artifact_key(&key));
    }

    #[test]
    fn malformed_key_is_rejected() {
        assert!(!is_well_formed_artifact_key("responses/2025/03/turn1-raw.json"));
        assert!(!is_well_formed_artifact_key(
            "unknown-cat/2025/03/07/verif-20250307000000-aaaa/turn1-raw.json"
        ));
    }

    #[tokio::test]
    async fn put_then_get_round_trips_the_body() {
        let store = InMemoryBlobStore::new();
        store
            .put("bucket", "key.json", b"hello".to_vec())
            .await
            .unwrap();
        let body = store.get("bucket", "key.json").await.unwrap();
        assert_eq!(body, b"hello");
        assert!(store.exists("bucket", "key.json").await.unwrap());
    }

    #[tokio::test]
    async fn head_reports_size_without_fetching_body() {
        let store = InMemoryBlobStore::new();
        store.put("bucket", "key.json", vec![1, 2, 3, 4, 5]).await.unwrap();
        let meta = store.head("bucket", "key.json").await.unwrap();
        assert_eq!(meta.size_bytes, 5);
    }

    #[tokio::test]
    async fn missing_object_is_a_resource_validation_error() {
        let store = InMemoryBlobStore::new();
        let err = store.get("bucket", "missing.json").await.unwrap_err();
        assert!(matches!(err, Error::ResourceValidation { .. }));
    }
}

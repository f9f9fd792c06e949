//! `FetchImages` (S2, spec §4.4): concurrently fetch the reference and
//! checking images, detect their format from magic bytes, base64-encode
//! them, and stage the encoded body either inline (small payloads) or in
//! the temporary base64 bucket (oversize payloads).
//!
//! The two fetches run as a `JoinSet` so the first failure cancels the
//! sibling still in flight, matching the "N concurrent reads, cancel on
//! first error" pattern spec §5 calls the canonical one for this stage.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinSet;

use super::{parse_blob_url, record_idempotent_skip, WorkflowEngine};
use crate::blob::{date_partitioned_key, BlobStore};
use crate::config::WorkflowConfig;
use crate::envelope::{ArtifactKind, Envelope, Reference, VerificationContext};
use crate::envelope::StatusHistoryEntry;
use crate::error::{Error, Result};
use crate::llm::ImageFormat;

/// How an image's base64 body was staged for the turn stages to consume
/// (spec §3's Image descriptor).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageMethod {
    Inline,
    S3Temporary,
}

/// Metadata recorded for one fetched image (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageDescriptor {
    pub url: String,
    pub format: ImageFormat,
    pub size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base64_s3_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline_base64: Option<String>,
    pub storage_method: StorageMethod,
}

/// The two descriptors persisted together as the `images_metadata` artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImagesMetadata {
    pub reference: ImageDescriptor,
    pub checking: ImageDescriptor,
}

pub async fn run(
    engine: &WorkflowEngine,
    context: &mut VerificationContext,
    envelope: &mut Envelope,
) -> Result<()> {
    if envelope.has_reference(ArtifactKind::ImagesMetadata) {
        record_idempotent_skip(context, "fetch_images", "FetchImages");
        return Ok(());
    }

    let started_at = Utc::now();
    let verification_id = context.verification_id.clone();

    let mut tasks = JoinSet::new();
    tasks.spawn(fetch_one(
        engine.blobs.clone(),
        engine.config.clone(),
        verification_id.clone(),
        started_at,
        "reference",
        context.reference_image_url.clone(),
    ));
    tasks.spawn(fetch_one(
        engine.blobs.clone(),
        engine.config.clone(),
        verification_id.clone(),
        started_at,
        "checking",
        context.checking_image_url.clone(),
    ));

    let mut reference: Option<(ImageDescriptor, Reference)> = None;
    let mut checking: Option<(ImageDescriptor, Reference)> = None;
    let mut first_error: Option<Error> = None;

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok((label, descriptor, reference_blob))) if first_error.is_none() => {
                if label == "reference" {
                    reference = Some((descriptor, reference_blob));
                } else {
                    checking = Some((descriptor, reference_blob));
                }
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                first_error.get_or_insert(e);
                tasks.abort_all();
            }
            Err(join_err) if join_err.is_cancelled() => {}
            Err(join_err) => {
                first_error.get_or_insert(Error::internal("FetchImages", "join", join_err.to_string()));
                tasks.abort_all();
            }
        }
    }

    if let Some(e) = first_error {
        return Err(e);
    }

    let (reference_descriptor, reference_blob_ref) =
        reference.ok_or_else(|| Error::internal("FetchImages", "collect", "missing reference result"))?;
    let (checking_descriptor, checking_blob_ref) =
        checking.ok_or_else(|| Error::internal("FetchImages", "collect", "missing checking result"))?;

    let metadata = ImagesMetadata {
        reference: reference_descriptor,
        checking: checking_descriptor,
    };
    let metadata_bytes = serde_json::to_vec(&metadata)?;
    let metadata_key = date_partitioned_key("images", started_at, &verification_id, "images-metadata.json");
    let etag = engine
        .blobs
        .put(&engine.config.state_bucket, &metadata_key, metadata_bytes.clone())
        .await
        .map_err(|e| Error::storage("FetchImages", "put_metadata", e.to_string()))?;

    envelope.s3_references.insert(ArtifactKind::ImagesReferenceBase64, reference_blob_ref);
    envelope.s3_references.insert(ArtifactKind::ImagesCheckingBase64, checking_blob_ref);
    envelope.s3_references.insert(
        ArtifactKind::ImagesMetadata,
        Reference::new(engine.config.state_bucket.clone(), metadata_key)
            .with_etag(etag)
            .with_size(metadata_bytes.len() as u64),
    );

    context.record_status(StatusHistoryEntry::new(
        "IMAGES_FETCHED",
        Utc::now(),
        "fetch_images",
        (Utc::now() - started_at).num_milliseconds().max(0) as u64,
        "FetchImages",
    ));

    Ok(())
}

async fn fetch_one(
    blobs: Arc<dyn BlobStore>,
    config: WorkflowConfig,
    verification_id: String,
    now: DateTime<Utc>,
    label: &'static str,
    url: String,
) -> Result<(&'static str, ImageDescriptor, Reference)> {
    let (bucket, key) = parse_blob_url("FetchImages", &url)?;

    let head = blobs
        .head(&bucket, &key)
        .await
        .map_err(|e| Error::resource_validation("FetchImages", "head", format!("{label} image {url}: {e}")))?;
    if head.size_bytes > config.image_limits.max_image_size_bytes {
        return Err(Error::validation(
            "FetchImages",
            "check_size",
            format!(
                "{label} image {url} is {} bytes, exceeds MAX_IMAGE_SIZE of {}",
                head.size_bytes, config.image_limits.max_image_size_bytes
            ),
        ));
    }

    let body = blobs
        .get(&bucket, &key)
        .await
        .map_err(|e| Error::resource_validation("FetchImages", "get", format!("{label} image {url}: {e}")))?;
    let format = ImageFormat::detect(&body).ok_or_else(|| {
        Error::validation(
            "FetchImages",
            "detect_format",
            format!("{label} image {url} is not a recognized JPEG or PNG"),
        )
    })?;

    let encoded = BASE64_STANDARD.encode(&body);
    let encoded_len = encoded.len() as u64;
    let filename = format!("{label}-base64.txt");

    let (storage_method, stage_bucket, stage_category, inline_base64) =
        if encoded_len <= config.image_limits.max_inline_base64_size_bytes {
            (StorageMethod::Inline, config.state_bucket.clone(), "images", Some(encoded.clone()))
        } else {
            let temp_bucket = config.temp_base64_bucket.clone().ok_or_else(|| {
                Error::Config("TEMP_BASE64_BUCKET is required to stage oversize base64 payloads".into())
            })?;
            (StorageMethod::S3Temporary, temp_bucket, "temp", None)
        };

    let stage_key = date_partitioned_key(stage_category, now, &verification_id, &filename);
    let etag = blobs
        .put(&stage_bucket, &stage_key, encoded.into_bytes())
        .await
        .map_err(|e| Error::storage("FetchImages", "put_base64", e.to_string()))?;

    let descriptor = ImageDescriptor {
        url,
        format,
        size_bytes: head.size_bytes,
        base64_s3_key: Some(stage_key.clone()),
        inline_base64,
        storage_method,
    };
    let reference = Reference::new(stage_bucket, stage_key)
        .with_etag(etag)
        .with_size(encoded_len);

    Ok((label, descriptor, reference))
}

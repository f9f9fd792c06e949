//! Shared plumbing for `ExecuteTurn1`/`ExecuteTurn2` (spec §4.8's common
//! turn-stage anatomy): loading the rendered system prompt and staged
//! image bodies, and persisting a turn's raw/processed artifacts.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};

use super::WorkflowEngine;
use crate::blob::date_partitioned_key;
use crate::envelope::{ArtifactKind, Envelope, Reference};
use crate::error::{Error, Result};
use crate::llm::ImageFormat;
use crate::templates::CompleteSystemPrompt;

pub async fn load_system_prompt(engine: &WorkflowEngine, envelope: &Envelope) -> Result<CompleteSystemPrompt> {
    let reference = envelope.reference(ArtifactKind::PromptsSystem).ok_or_else(|| {
        Error::internal("ExecuteTurn", "load_system_prompt", "envelope is missing prompts_system")
    })?;
    let body = engine
        .blobs
        .get(&reference.bucket, &reference.key)
        .await
        .map_err(|e| Error::context_load("ExecuteTurn", "load_system_prompt", e.to_string()))?;
    serde_json::from_slice(&body).map_err(Error::from)
}

/// Load a staged image's base64 text and detect its format from the
/// decoded bytes — cheaper than re-reading the `images_metadata` artifact
/// and keeps this at the two/four-way concurrency spec §4.6/§4.7 name.
pub async fn load_base64_image(
    engine: &WorkflowEngine,
    kind: ArtifactKind,
    envelope: &Envelope,
) -> Result<(ImageFormat, String)> {
    let reference = envelope
        .reference(kind)
        .ok_or_else(|| Error::internal("ExecuteTurn", "load_base64_image", format!("envelope is missing {kind}")))?;
    let body = engine
        .blobs
        .get(&reference.bucket, &reference.key)
        .await
        .map_err(|e| Error::context_load("ExecuteTurn", "load_base64_image", e.to_string()))?;
    let text = String::from_utf8(body)
        .map_err(|e| Error::internal("ExecuteTurn", "load_base64_image", e.to_string()))?;
    let decoded = BASE64_STANDARD
        .decode(&text)
        .map_err(|e| Error::internal("ExecuteTurn", "load_base64_image", e.to_string()))?;
    let format = ImageFormat::detect(&decoded)
        .ok_or_else(|| Error::internal("ExecuteTurn", "load_base64_image", "staged body is not a recognized image"))?;
    Ok((format, text))
}

/// Load a prior turn's raw or processed text artifact (used by Turn 2 to
/// pull Turn 1's outputs back into context).
pub async fn load_text_artifact(engine: &WorkflowEngine, kind: ArtifactKind, envelope: &Envelope) -> Result<String> {
    let reference = envelope
        .reference(kind)
        .ok_or_else(|| Error::internal("ExecuteTurn", "load_text_artifact", format!("envelope is missing {kind}")))?;
    let body = engine
        .blobs
        .get(&reference.bucket, &reference.key)
        .await
        .map_err(|e| Error::context_load("ExecuteTurn", "load_text_artifact", e.to_string()))?;
    String::from_utf8(body).map_err(|e| Error::internal("ExecuteTurn", "load_text_artifact", e.to_string()))
}

/// Persist one text artifact under the `responses` category and return its
/// envelope reference.
pub async fn persist_text_artifact(
    engine: &WorkflowEngine,
    now: DateTime<Utc>,
    verification_id: &str,
    filename: &str,
    body: String,
) -> Result<Reference> {
    let key = date_partitioned_key("responses", now, verification_id, filename);
    let bytes = body.into_bytes();
    let etag = engine
        .blobs
        .put(&engine.config.state_bucket, &key, bytes.clone())
        .await
        .map_err(|e| Error::storage("ExecuteTurn", "persist_artifact", e.to_string()))?;
    Ok(Reference::new(engine.config.state_bucket.clone(), key)
        .with_etag(etag)
        .with_size(bytes.len() as u64))
}

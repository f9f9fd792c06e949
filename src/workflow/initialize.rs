//! `Initialize` (S0, spec §4.2): validate the request, confirm both images
//! exist, resolve layout metadata for `layout-vs-checking` verifications,
//! and conditionally create the verification row.

use chrono::{DateTime, Utc};

use super::{parse_blob_url, WorkflowEngine};
use crate::blob::date_partitioned_key;
use crate::envelope::{
    ArtifactKind, Envelope, ErrorTracking, ProcessingMetrics, Reference, StatusHistoryEntry,
    VerificationContext, VerificationRequest, VerificationType,
};
use crate::error::{Error, Result};
use crate::rowstore::CreateOutcome;

fn validate_request(request: &VerificationRequest) -> Result<()> {
    if request.reference_image_url.trim().is_empty() || request.checking_image_url.trim().is_empty() {
        return Err(Error::validation(
            "Initialize",
            "validate_request",
            "referenceImageUrl and checkingImageUrl are both required",
        ));
    }

    match request.verification_type {
        VerificationType::LayoutVsChecking => {
            if request.layout_id.is_none() && request.layout_prefix.is_none() {
                return Err(Error::validation(
                    "Initialize",
                    "validate_request",
                    "layout-vs-checking verifications require layoutId or layoutPrefix",
                ));
            }
        }
        VerificationType::PreviousVsCurrent => {
            if request.previous_verification_id.is_none() {
                return Err(Error::validation(
                    "Initialize",
                    "validate_request",
                    "previous-vs-current verifications require previousVerificationId",
                ));
            }
        }
    }
    Ok(())
}

/// Run `Initialize`, producing the first [`VerificationContext`] and
/// [`Envelope`] for `verification_id` (spec §4.2's 6-step algorithm).
pub async fn run(
    engine: &WorkflowEngine,
    verification_id: &str,
    now: DateTime<Utc>,
    request: &VerificationRequest,
) -> Result<(VerificationContext, Envelope)> {
    validate_request(request)?;

    let (reference_bucket, reference_key) = parse_blob_url("Initialize", &request.reference_image_url)?;
    let (checking_bucket, checking_key) = parse_blob_url("Initialize", &request.checking_image_url)?;

    let reference_exists = engine
        .blobs
        .exists(&reference_bucket, &reference_key)
        .await
        .map_err(|e| Error::context_load("Initialize", "check_reference_exists", e.to_string()))?;
    if !reference_exists {
        return Err(Error::resource_validation(
            "Initialize",
            "check_reference_exists",
            format!("reference image not found: {}", request.reference_image_url),
        ));
    }

    let checking_exists = engine
        .blobs
        .exists(&checking_bucket, &checking_key)
        .await
        .map_err(|e| Error::context_load("Initialize", "check_checking_exists", e.to_string()))?;
    if !checking_exists {
        return Err(Error::resource_validation(
            "Initialize",
            "check_checking_exists",
            format!("checking image not found: {}", request.checking_image_url),
        ));
    }

    let mut layout_id = request.layout_id;
    let mut layout_prefix = request.layout_prefix.clone();
    let mut resolved_layout = None;
    if request.verification_type.capabilities().needs_layout_metadata {
        resolved_layout = engine
            .layouts
            .get_by_reference_image_url(&request.reference_image_url)
            .await
            .map_err(|e| Error::context_load("Initialize", "lookup_layout", e.to_string()))?;
        if let Some(layout) = &resolved_layout {
            layout_id.get_or_insert(layout.layout_id);
            layout_prefix.get_or_insert_with(|| layout.layout_prefix.clone());
        }
    }

    let mut context = VerificationContext {
        verification_id: verification_id.to_string(),
        verification_at: now,
        verification_type: request.verification_type,
        reference_image_url: request.reference_image_url.clone(),
        checking_image_url: request.checking_image_url.clone(),
        layout_id,
        layout_prefix,
        previous_verification_id: request.previous_verification_id.clone(),
        vending_machine_id: request.vending_machine_id.clone(),
        status: "VERIFICATION_INITIALIZED".to_string(),
        current_status: "VERIFICATION_INITIALIZED".to_string(),
        last_updated_at: now,
        status_history: Vec::new(),
        processing_metrics: ProcessingMetrics::default(),
        error_tracking: ErrorTracking::default(),
    };
    context.record_status(StatusHistoryEntry::new(
        "VERIFICATION_INITIALIZED",
        now,
        "initialize",
        0,
        "Initialize",
    ));

    let outcome = engine
        .verifications
        .create_initial(&context)
        .await
        .map_err(|e| Error::storage("Initialize", "create_initial", e.to_string()))?;
    if outcome == CreateOutcome::AlreadyExists {
        if let Some(existing) = engine
            .verifications
            .get(verification_id)
            .await
            .map_err(|e| Error::storage("Initialize", "get", e.to_string()))?
        {
            context = existing;
        }
    }

    let initialization_bytes = serde_json::to_vec(&context)?;
    let key = date_partitioned_key("processing", now, verification_id, "initialization.json");
    let etag = engine
        .blobs
        .put(&engine.config.state_bucket, &key, initialization_bytes.clone())
        .await
        .map_err(|e| Error::storage("Initialize", "put_initialization", e.to_string()))?;

    let mut envelope = Envelope::new(verification_id, context.current_status.clone()).with_reference(
        ArtifactKind::ProcessingInitialization,
        Reference::new(engine.config.state_bucket.clone(), key)
            .with_etag(etag)
            .with_size(initialization_bytes.len() as u64),
    );

    if request.verification_type.capabilities().needs_layout_metadata {
        let layout_bytes = match &resolved_layout {
            Some(layout) => serde_json::to_vec(layout)?,
            None => serde_json::to_vec(&serde_json::json!({
                "layout_id": layout_id,
                "layout_prefix": layout_prefix,
            }))?,
        };
        let layout_key = date_partitioned_key("processing", now, verification_id, "layout_metadata.json");
        let layout_etag = engine
            .blobs
            .put(&engine.config.state_bucket, &layout_key, layout_bytes.clone())
            .await
            .map_err(|e| Error::storage("Initialize", "put_layout_metadata", e.to_string()))?;
        envelope = envelope.with_reference(
            ArtifactKind::ProcessingLayoutMetadata,
            Reference::new(engine.config.state_bucket.clone(), layout_key)
                .with_etag(layout_etag)
                .with_size(layout_bytes.len() as u64),
        );
    }

    Ok((context, envelope))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::InMemoryBlobStore;
    use crate::llm::{AnthropicClient, ClientConfig};
    use crate::rowstore::{LayoutMetadata, SqliteRowStore};
    use crate::templates::TemplateCatalog;
    use crate::config::WorkflowConfig;
    use crate::results::MachineStructure;
    use std::sync::Arc;

    fn sample_request() -> VerificationRequest {
        VerificationRequest {
            verification_type: VerificationType::LayoutVsChecking,
            reference_image_url: "s3://ref-bucket/ref.jpg".to_string(),
            checking_image_url: "s3://chk-bucket/chk.jpg".to_string(),
            layout_id: Some(7),
            layout_prefix: Some("VM-7".to_string()),
            previous_verification_id: None,
            vending_machine_id: Some("VM-7".to_string()),
        }
    }

    async fn engine_with_images() -> WorkflowEngine {
        let blobs = InMemoryBlobStore::new();
        blobs.seed("ref-bucket", "ref.jpg", vec![0xFF, 0xD8, 0xFF]).await;
        blobs.seed("chk-bucket", "chk.jpg", vec![0xFF, 0xD8, 0xFF]).await;
        let store = Arc::new(SqliteRowStore::in_memory().unwrap());
        WorkflowEngine::new(
            WorkflowConfig::for_tests(),
            Arc::new(blobs),
            store.clone(),
            store.clone(),
            store,
            Arc::new(AnthropicClient::new(ClientConfig::new("test-key"))),
            Arc::new(TemplateCatalog::new("templates")),
        )
    }

    #[tokio::test]
    async fn initialize_creates_row_and_writes_artifact() {
        let engine = engine_with_images().await;
        let now = Utc::now();
        let (context, envelope) = run(&engine, "verif-20250101000000-aaaa", now, &sample_request())
            .await
            .unwrap();

        assert_eq!(context.current_status, "VERIFICATION_INITIALIZED");
        assert!(envelope.has_reference(ArtifactKind::ProcessingInitialization));
        assert!(engine.verifications.get(&context.verification_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn missing_reference_image_is_a_resource_validation_error() {
        let blobs = InMemoryBlobStore::new();
        blobs.seed("chk-bucket", "chk.jpg", vec![0xFF, 0xD8, 0xFF]).await;
        let store = Arc::new(SqliteRowStore::in_memory().unwrap());
        let engine = WorkflowEngine::new(
            WorkflowConfig::for_tests(),
            Arc::new(blobs),
            store.clone(),
            store.clone(),
            store,
            Arc::new(AnthropicClient::new(ClientConfig::new("test-key"))),
            Arc::new(TemplateCatalog::new("templates")),
        );

        let err = run(&engine, "verif-20250101000000-bbbb", Utc::now(), &sample_request())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ResourceValidation { .. }));
    }

    #[tokio::test]
    async fn layout_id_is_resolved_by_reference_image_url_when_absent() {
        let engine = engine_with_images().await;
        engine
            .layouts
            .put(&LayoutMetadata {
                layout_id: 99,
                layout_prefix: "VM-99".to_string(),
                reference_image_url: Some("s3://ref-bucket/ref.jpg".to_string()),
                machine_structure: MachineStructure {
                    row_count: 4,
                    columns_per_row: 6,
                    row_order: vec!["A".into(), "B".into(), "C".into(), "D".into()],
                    column_order: (1..=6).map(|n| n.to_string()).collect(),
                },
            })
            .await
            .unwrap();

        let mut request = sample_request();
        request.layout_id = None;
        request.layout_prefix = None;

        let (context, envelope) = run(&engine, "verif-20250101000000-cccc", Utc::now(), &request)
            .await
            .unwrap();
        assert_eq!(context.layout_id, Some(99));
        assert!(envelope.has_reference(ArtifactKind::ProcessingLayoutMetadata));
    }

    #[tokio::test]
    async fn layout_metadata_artifact_exists_even_without_a_layout_store_hit() {
        let engine = engine_with_images().await;
        let (_, envelope) = run(&engine, "verif-20250101000000-eeee", Utc::now(), &sample_request())
            .await
            .unwrap();
        assert!(envelope.has_reference(ArtifactKind::ProcessingLayoutMetadata));
    }

    #[tokio::test]
    async fn previous_vs_current_without_previous_id_is_rejected() {
        let engine = engine_with_images().await;
        let request = VerificationRequest {
            verification_type: VerificationType::PreviousVsCurrent,
            reference_image_url: "s3://ref-bucket/ref.jpg".to_string(),
            checking_image_url: "s3://chk-bucket/chk.jpg".to_string(),
            layout_id: None,
            layout_prefix: None,
            previous_verification_id: None,
            vending_machine_id: None,
        };
        let err = run(&engine, "verif-20250101000000-dddd", Utc::now(), &request)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }
}

//! `FetchHistoricalContext` (S1, spec §4.3): only executed when
//! `verificationType = PREVIOUS_VS_CURRENT`. Looks up the prior
//! verification by `previousVerificationId`; a miss is not an abort, only
//! `historicalDataFound = false`.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::{record_idempotent_skip, WorkflowEngine};
use crate::blob::date_partitioned_key;
use crate::envelope::{ArtifactKind, Envelope, Reference, StatusHistoryEntry, VerificationContext};
use crate::error::{Error, Result};

/// The historical-context artifact persisted for `ExecuteTurn2`'s prompt
/// context (spec §3's "Historical context").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoricalContext {
    pub historical_data_found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_verification_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_summary: Option<String>,
}

pub async fn run(
    engine: &WorkflowEngine,
    context: &mut VerificationContext,
    envelope: &mut Envelope,
) -> Result<()> {
    if envelope.has_reference(ArtifactKind::ProcessingHistoricalContext) {
        record_idempotent_skip(context, "fetch_historical_context", "FetchHistoricalContext");
        return Ok(());
    }

    let started_at = Utc::now();

    let previous_id = context.previous_verification_id.clone().ok_or_else(|| {
        Error::validation(
            "FetchHistoricalContext",
            "read_previous_verification_id",
            "previous-vs-current verification is missing previousVerificationId",
        )
    })?;

    let previous = engine
        .verifications
        .get(&previous_id)
        .await
        .map_err(|e| Error::context_load("FetchHistoricalContext", "lookup_previous", e.to_string()))?;

    let historical = match previous {
        Some(previous_context) => HistoricalContext {
            historical_data_found: true,
            previous_verification_id: Some(previous_context.verification_id),
            previous_status: Some(previous_context.current_status),
            previous_summary: previous_context
                .error_tracking
                .message
                .clone()
                .or_else(|| Some("no summary recorded".to_string())),
        },
        None => HistoricalContext {
            historical_data_found: false,
            previous_verification_id: Some(previous_id),
            previous_status: None,
            previous_summary: None,
        },
    };

    let bytes = serde_json::to_vec(&historical)?;
    let key = date_partitioned_key(
        "processing",
        started_at,
        &context.verification_id,
        "historical-context.json",
    );
    let etag = engine
        .blobs
        .put(&engine.config.state_bucket, &key, bytes.clone())
        .await
        .map_err(|e| Error::storage("FetchHistoricalContext", "put_historical_context", e.to_string()))?;

    envelope.s3_references.insert(
        ArtifactKind::ProcessingHistoricalContext,
        Reference::new(engine.config.state_bucket.clone(), key)
            .with_etag(etag)
            .with_size(bytes.len() as u64),
    );

    let status = if historical.historical_data_found {
        "HISTORICAL_CONTEXT_FETCHED"
    } else {
        "HISTORICAL_CONTEXT_NOT_FOUND"
    };
    context.record_status(StatusHistoryEntry::new(
        status,
        Utc::now(),
        "fetch_historical_context",
        (Utc::now() - started_at).num_milliseconds().max(0) as u64,
        "FetchHistoricalContext",
    ));

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::InMemoryBlobStore;
    use crate::config::WorkflowConfig;
    use crate::envelope::{ErrorTracking, ProcessingMetrics, VerificationType};
    use crate::llm::{AnthropicClient, ClientConfig};
    use crate::rowstore::SqliteRowStore;
    use crate::templates::TemplateCatalog;
    use std::sync::Arc;

    fn sample_context(verification_id: &str, previous_id: Option<&str>) -> VerificationContext {
        let now = Utc::now();
        VerificationContext {
            verification_id: verification_id.to_string(),
            verification_at: now,
            verification_type: VerificationType::PreviousVsCurrent,
            reference_image_url: "s3://ref/ref.jpg".to_string(),
            checking_image_url: "s3://chk/chk.jpg".to_string(),
            layout_id: None,
            layout_prefix: None,
            previous_verification_id: previous_id.map(str::to_string),
            vending_machine_id: None,
            status: "VERIFICATION_INITIALIZED".to_string(),
            current_status: "VERIFICATION_INITIALIZED".to_string(),
            last_updated_at: now,
            status_history: Vec::new(),
            processing_metrics: ProcessingMetrics::default(),
            error_tracking: ErrorTracking::default(),
        }
    }

    async fn engine() -> WorkflowEngine {
        let store = Arc::new(SqliteRowStore::in_memory().unwrap());
        WorkflowEngine::new(
            WorkflowConfig::for_tests(),
            Arc::new(InMemoryBlobStore::new()),
            store.clone(),
            store.clone(),
            store,
            Arc::new(AnthropicClient::new(ClientConfig::new("test-key"))),
            Arc::new(TemplateCatalog::new("templates")),
        )
    }

    #[tokio::test]
    async fn missing_previous_verification_sets_not_found_without_failing() {
        let engine = engine().await;
        let mut context = sample_context("verif-20250101000000-aaaa", Some("verif-20241231000000-zzzz"));
        let mut envelope = Envelope::new(context.verification_id.clone(), "VERIFICATION_INITIALIZED");

        run(&engine, &mut context, &mut envelope).await.unwrap();

        assert_eq!(context.current_status, "HISTORICAL_CONTEXT_NOT_FOUND");
        assert!(envelope.has_reference(ArtifactKind::ProcessingHistoricalContext));
    }

    #[tokio::test]
    async fn found_previous_verification_is_recorded() {
        let engine = engine().await;
        let previous = sample_context("verif-20241231000000-zzzz", None);
        engine.verifications.create_initial(&previous).await.unwrap();

        let mut context = sample_context("verif-20250101000000-aaaa", Some("verif-20241231000000-zzzz"));
        let mut envelope = Envelope::new(context.verification_id.clone(), "VERIFICATION_INITIALIZED");

        run(&engine, &mut context, &mut envelope).await.unwrap();
        assert_eq!(context.current_status, "HISTORICAL_CONTEXT_FETCHED");
    }

    #[tokio::test]
    async fn missing_previous_id_on_the_context_is_a_validation_error() {
        let engine = engine().await;
        let mut context = sample_context("verif-20250101000000-aaaa", None);
        let mut envelope = Envelope::new(context.verification_id.clone(), "VERIFICATION_INITIALIZED");

        let err = run(&engine, &mut context, &mut envelope).await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }
}

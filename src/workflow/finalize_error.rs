//! `FinalizeWithError` (E, spec §4.10): the universal catch-all every stage
//! routes to once its retry budget is exhausted. Never throws — every
//! secondary write here is best-effort and its failure is only logged.

use chrono::Utc;

use super::WorkflowEngine;
use crate::blob::date_partitioned_key;
use crate::envelope::{ArtifactKind, Envelope, Reference, VerificationContext, VerificationType};
use crate::error::Error;
use crate::ids::parse_embedded_timestamp;
use crate::rowstore::ConversationRow;

/// Build a placeholder context for a verification that never got as far as
/// `Initialize` writing a row (spec §4.10: the error path still needs a
/// `verification_at` to key a row on, recovered from the id itself).
fn fallback_context(verification_id: &str, now: chrono::DateTime<Utc>) -> VerificationContext {
    use crate::envelope::{ErrorTracking, ProcessingMetrics};
    let verification_at = parse_embedded_timestamp(verification_id).unwrap_or(now);
    VerificationContext {
        verification_id: verification_id.to_string(),
        verification_at,
        verification_type: VerificationType::LayoutVsChecking,
        reference_image_url: String::new(),
        checking_image_url: String::new(),
        layout_id: None,
        layout_prefix: None,
        previous_verification_id: None,
        vending_machine_id: None,
        status: "VERIFICATION_INITIALIZED".to_string(),
        current_status: "VERIFICATION_INITIALIZED".to_string(),
        last_updated_at: now,
        status_history: Vec::new(),
        processing_metrics: ProcessingMetrics::default(),
        error_tracking: ErrorTracking::default(),
    }
}

/// Never returns `Result` — spec §4.10 requires this path to always
/// produce a terminal envelope, even when every secondary write fails.
///
/// `envelope` is the in-flight envelope accumulated by whichever stages
/// ran before the failing one, or `None` when `Initialize` itself never
/// produced one. Its references (at minimum `processing_initialization`)
/// are echoed forward into the returned envelope per spec §4.10 item 5,
/// and into the persisted `error.json` body per item 2.
pub async fn run(
    engine: &WorkflowEngine,
    verification_id: &str,
    context: Option<VerificationContext>,
    envelope: Option<Envelope>,
    error: Error,
) -> Envelope {
    let now = Utc::now();
    let error_stage = error
        .component_operation()
        .map(|(component, _)| component.to_string())
        .unwrap_or_else(|| "Unknown".to_string());
    let message = error.to_string();

    let mut context = match context {
        Some(context) => context,
        None => match engine.verifications.get(verification_id).await {
            Ok(Some(existing)) => existing,
            _ => fallback_context(verification_id, now),
        },
    };
    context.mark_failed(error_stage.clone(), message.clone());

    let mut envelope = match envelope {
        Some(envelope) => envelope,
        None => Envelope::new(verification_id, context.current_status.clone()),
    };
    envelope.status = context.current_status.clone();

    let references: serde_json::Map<String, serde_json::Value> = envelope
        .s3_references
        .iter()
        .map(|(kind, reference)| (kind.to_string(), serde_json::json!(reference)))
        .collect();

    let error_body = serde_json::json!({
        "verification_id": verification_id,
        "error_stage": error_stage,
        "message": message,
        "severity": format!("{:?}", error.severity()),
        "suggestions": error.suggestions(),
        "recovery_hints": error.recovery_hints(),
        "context": error.context(),
        "references": references,
        "timestamp": now,
    });
    match serde_json::to_vec(&error_body) {
        Ok(bytes) => {
            let key = date_partitioned_key("processing", now, verification_id, "error.json");
            match engine
                .blobs
                .put(&engine.config.state_bucket, &key, bytes.clone())
                .await
            {
                Ok(etag) => {
                    envelope = envelope.with_reference(
                        ArtifactKind::Error,
                        Reference::new(engine.config.state_bucket.clone(), key)
                            .with_etag(etag)
                            .with_size(bytes.len() as u64),
                    );
                }
                Err(e) => tracing::warn!(error = %e, "failed to persist error artifact"),
            }
        }
        Err(e) => tracing::warn!(error = %e, "failed to serialize error artifact"),
    }

    if let Err(e) = engine.verifications.create_initial(&context).await {
        tracing::warn!(error = %e, "failed to create verification row during error finalization");
    }
    if let Err(e) = engine.verifications.update(&context).await {
        tracing::warn!(error = %e, "failed to update verification row during error finalization");
    }

    match engine.conversations.get_turns(verification_id).await {
        Ok(turns) => {
            if let Some(last) = turns.iter().max_by_key(|t| t.turn_id) {
                let failed_row = ConversationRow {
                    verification_id: verification_id.to_string(),
                    conversation_at: last.created_at,
                    current_turn: last.turn_id,
                    turn_status: "VERIFICATION_FAILED".to_string(),
                };
                if let Err(e) = engine.conversations.put_conversation(&failed_row).await {
                    tracing::warn!(error = %e, "failed to mark conversation row failed");
                }
            }
        }
        Err(e) => tracing::warn!(error = %e, "failed to load conversation turns during error finalization"),
    }

    envelope.verification_context = Some(context);
    envelope
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::InMemoryBlobStore;
    use crate::config::WorkflowConfig;
    use crate::envelope::{ErrorTracking, ProcessingMetrics};
    use crate::llm::{AnthropicClient, ClientConfig};
    use crate::rowstore::SqliteRowStore;
    use crate::templates::TemplateCatalog;
    use std::sync::Arc;

    fn sample_context() -> VerificationContext {
        let now = Utc::now();
        VerificationContext {
            verification_id: "verif-20250101000000-aaaa".to_string(),
            verification_at: now,
            verification_type: VerificationType::LayoutVsChecking,
            reference_image_url: "s3://ref/ref.jpg".to_string(),
            checking_image_url: "s3://chk/chk.jpg".to_string(),
            layout_id: None,
            layout_prefix: None,
            previous_verification_id: None,
            vending_machine_id: None,
            status: "VERIFICATION_INITIALIZED".to_string(),
            current_status: "TURN1_STARTED".to_string(),
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
    async fn marks_an_existing_context_failed_and_persists_the_error_artifact() {
        let engine = engine().await;
        let context = sample_context();
        engine.verifications.create_initial(&context).await.unwrap();

        let mut in_flight = Envelope::new(context.verification_id.clone(), context.current_status.clone());
        in_flight = in_flight.with_reference(
            ArtifactKind::ProcessingInitialization,
            Reference::new("state-bucket", "processing/2025/01/01/verif-20250101000000-aaaa/initialization.json"),
        );

        let error = Error::llm_server("ExecuteTurn1", "invoke", "upstream 503");
        let envelope = run(&engine, &context.verification_id, Some(context), Some(in_flight), error).await;

        assert_eq!(envelope.status, "VERIFICATION_FAILED");
        assert!(envelope.has_reference(ArtifactKind::Error));
        assert!(envelope.has_reference(ArtifactKind::ProcessingInitialization));
        let stored_context = envelope.verification_context.unwrap();
        assert!(stored_context.error_tracking.has_errors);
        assert_eq!(stored_context.error_tracking.error_stage.as_deref(), Some("ExecuteTurn1"));

        let stored = engine
            .verifications
            .get(&stored_context.verification_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.current_status, "VERIFICATION_FAILED");
    }

    #[tokio::test]
    async fn recovers_a_synthetic_context_when_initialize_itself_failed() {
        let engine = engine().await;
        let verification_id = "verif-20250615120000-zzzz";
        let error = Error::resource_validation("Initialize", "check_reference_exists", "not found");

        let envelope = run(&engine, verification_id, None, None, error).await;

        assert_eq!(envelope.status, "VERIFICATION_FAILED");
        let context = envelope.verification_context.unwrap();
        assert_eq!(context.verification_at.format("%Y%m%d%H%M%S").to_string(), "20250615120000");
        assert_eq!(context.error_tracking.error_stage.as_deref(), Some("Initialize"));
    }
}

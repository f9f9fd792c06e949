//! `ExecuteTurn1` (S4, spec §4.6): render the turn-1 user prompt, invoke the
//! LLM against the reference image, parse the response, and persist both
//! the raw completion and the structured fields extracted from it.

use chrono::Utc;

use super::turn_common::{load_base64_image, load_system_prompt, persist_text_artifact};
use super::{context_load_error, record_idempotent_skip, WorkflowEngine};
use crate::envelope::{ArtifactKind, Envelope, StatusHistoryEntry, VerificationContext};
use crate::error::{Error, Result};
use crate::llm::{ChatMessage, CompletionRequest, ContentBlock, ThinkingConfig};
use crate::parsing::parse_turn1_response;
use crate::results::Turn1ProcessedData;
use crate::rowstore::{ConversationRow, ConversationTurnEntry};

/// The cleaned markdown plus a header of extracted fields persisted as
/// `turn1-processed.md` (spec §4.6, §6).
fn turn1_processed_markdown(processed: &Turn1ProcessedData) -> String {
    format!(
        "initial_confirmation: {}\nreference_summary: {}\n\n{}",
        processed.initial_confirmation, processed.reference_summary, processed.markdown
    )
}

pub async fn run(engine: &WorkflowEngine, context: &mut VerificationContext, envelope: &mut Envelope) -> Result<()> {
    if envelope.has_reference(ArtifactKind::ResponsesTurn1Processed) {
        record_idempotent_skip(context, "execute_turn1", "ExecuteTurn1");
        return Ok(());
    }

    let started_at = Utc::now();
    context.record_status(StatusHistoryEntry::new("TURN1_STARTED", Utc::now(), "execute_turn1", 0, "ExecuteTurn1"));

    let (system_prompt, (reference_format, reference_base64)) = tokio::try_join!(
        load_system_prompt(engine, envelope),
        load_base64_image(engine, ArtifactKind::ImagesReferenceBase64, envelope),
    )
    .map_err(|e| context_load_error("ExecuteTurn1", "load_context", e))?;
    context.record_status(StatusHistoryEntry::new(
        "TURN1_CONTEXT_LOADED",
        Utc::now(),
        "execute_turn1",
        0,
        "ExecuteTurn1",
    ));

    let turn1_prompt = engine.templates.render("turn1-prompt", &serde_json::json!({})).await?;
    let message = ChatMessage::user(vec![
        ContentBlock::text(turn1_prompt.text),
        ContentBlock::image(reference_format, reference_base64),
    ]);
    context.record_status(StatusHistoryEntry::new(
        "TURN1_PROMPT_PREPARED",
        Utc::now(),
        "execute_turn1",
        0,
        "ExecuteTurn1",
    ));

    let llm = &engine.config.llm;
    let request = CompletionRequest {
        model: system_prompt.model_id.clone(),
        anthropic_version: system_prompt.anthropic_version.clone(),
        messages: vec![message],
        system: Some(system_prompt.system_prompt.clone()),
        max_tokens: system_prompt.max_tokens,
        temperature: Some(llm.temperature),
        top_p: Some(llm.top_p),
        thinking: (system_prompt.thinking.kind == "enabled").then(|| ThinkingConfig {
            enabled: true,
            budget_tokens: system_prompt.thinking.budget_tokens,
        }),
    };

    context.record_status(StatusHistoryEntry::new(
        "TURN1_BEDROCK_INVOKED",
        Utc::now(),
        "execute_turn1",
        0,
        "ExecuteTurn1",
    ));
    let response = engine.llm.complete(request).await?;
    context.record_status(StatusHistoryEntry::new(
        "TURN1_BEDROCK_COMPLETED",
        Utc::now(),
        "execute_turn1",
        0,
        "ExecuteTurn1",
    ));

    let processed = parse_turn1_response(&response.content);

    let raw_reference = persist_text_artifact(
        engine,
        started_at,
        &context.verification_id,
        "turn1-raw.json",
        serde_json::to_string(&response)?,
    )
    .await?;
    let processed_reference = persist_text_artifact(
        engine,
        started_at,
        &context.verification_id,
        "turn1-processed.json",
        serde_json::to_string(&processed)?,
    )
    .await?;
    // Spec-mandated human/audit artifact (spec §4.6, §6): the cleaned
    // markdown plus a header of extracted fields. Not tracked by the
    // envelope — downstream stages reload the structured json above.
    persist_text_artifact(
        engine,
        started_at,
        &context.verification_id,
        "turn1-processed.md",
        turn1_processed_markdown(&processed),
    )
    .await?;

    engine
        .conversations
        .put_conversation(&ConversationRow {
            verification_id: context.verification_id.clone(),
            conversation_at: started_at,
            current_turn: 1,
            turn_status: "TURN1_COMPLETED".to_string(),
        })
        .await
        .map_err(|e| Error::storage("ExecuteTurn1", "put_conversation", e.to_string()))?;
    engine
        .conversations
        .put_turn(&ConversationTurnEntry {
            verification_id: context.verification_id.clone(),
            turn_id: 1,
            raw_response_bucket: raw_reference.bucket.clone(),
            raw_response_key: raw_reference.key.clone(),
            processed_bucket: processed_reference.bucket.clone(),
            processed_key: processed_reference.key.clone(),
            usage: response.usage,
            provider_request_id: response.id.clone(),
            created_at: started_at,
        })
        .await
        .map_err(|e| Error::storage("ExecuteTurn1", "put_turn", e.to_string()))?;

    envelope.s3_references.insert(ArtifactKind::ResponsesTurn1Raw, raw_reference);
    envelope.s3_references.insert(ArtifactKind::ResponsesTurn1Processed, processed_reference);

    context.record_status(StatusHistoryEntry::new(
        "TURN1_COMPLETED",
        Utc::now(),
        "execute_turn1",
        (Utc::now() - started_at).num_milliseconds().max(0) as u64,
        "ExecuteTurn1",
    ));

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::InMemoryBlobStore;
    use crate::config::WorkflowConfig;
    use crate::envelope::{ErrorTracking, ProcessingMetrics, VerificationType};
    use crate::llm::{CompletionResponse, LLMClient, StopReason, TokenUsage};
    use crate::rowstore::SqliteRowStore;
    use crate::templates::TemplateCatalog;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct StubLLM {
        content: String,
    }

    #[async_trait]
    impl LLMClient for StubLLM {
        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse> {
            Ok(CompletionResponse {
                id: "msg_stub".to_string(),
                model: "claude-3-5-sonnet-20241022".to_string(),
                content: self.content.clone(),
                thinking: None,
                stop_reason: Some(StopReason::EndTurn),
                usage: TokenUsage {
                    input_tokens: 100,
                    output_tokens: 50,
                    thinking_tokens: 0,
                },
                timestamp: Utc::now(),
            })
        }
    }

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
            current_status: "VERIFICATION_INITIALIZED".to_string(),
            last_updated_at: now,
            status_history: Vec::new(),
            processing_metrics: ProcessingMetrics::default(),
            error_tracking: ErrorTracking::default(),
        }
    }

    async fn engine_with(content: &str) -> WorkflowEngine {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine;

        let blobs = InMemoryBlobStore::new();
        blobs
            .seed(
                "test-state",
                "images/ref-base64.txt",
                STANDARD.encode([0xFFu8, 0xD8, 0xFF, 0xE0]).into_bytes(),
            )
            .await;
        let store = Arc::new(SqliteRowStore::in_memory().unwrap());
        WorkflowEngine::new(
            WorkflowConfig::for_tests(),
            Arc::new(blobs),
            store.clone(),
            store.clone(),
            store,
            Arc::new(StubLLM {
                content: content.to_string(),
            }),
            Arc::new(TemplateCatalog::new("templates")),
        )
    }

    fn envelope_with_prerequisites(verification_id: &str) -> Envelope {
        use crate::envelope::Reference;
        Envelope::new(verification_id, "SYSTEM_PROMPT_PREPARED")
            .with_reference(
                ArtifactKind::PromptsSystem,
                Reference::new("test-state", "prompts/system-prompt.json"),
            )
            .with_reference(
                ArtifactKind::ImagesReferenceBase64,
                Reference::new("test-state", "images/ref-base64.txt"),
            )
    }

    #[tokio::test]
    async fn executes_turn1_and_persists_artifacts() {
        let engine = engine_with("Initial confirmation: looks good.\nA1: Coca-Cola (present)").await;
        engine
            .blobs
            .put(
                "test-state",
                "prompts/system-prompt.json",
                serde_json::to_vec(&serde_json::json!({
                    "system_prompt": "test system prompt",
                    "template_version": "1.0.0",
                    "anthropic_version": "2023-06-01",
                    "max_tokens": 4096,
                    "thinking": {"type": "disabled", "budget_tokens": 0},
                    "model_id": "claude-3-5-sonnet-20241022",
                }))
                .unwrap(),
            )
            .await
            .unwrap();

        let mut context = sample_context();
        let mut envelope = envelope_with_prerequisites(&context.verification_id);

        run(&engine, &mut context, &mut envelope).await.unwrap();

        assert!(envelope.has_reference(ArtifactKind::ResponsesTurn1Raw));
        assert!(envelope.has_reference(ArtifactKind::ResponsesTurn1Processed));
        assert_eq!(context.current_status, "TURN1_COMPLETED");
        assert_eq!(engine.conversations.get_turns(&context.verification_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn re_invocation_is_idempotent() {
        let engine = engine_with("some findings").await;
        engine
            .blobs
            .put(
                "test-state",
                "prompts/system-prompt.json",
                serde_json::to_vec(&serde_json::json!({
                    "system_prompt": "test system prompt",
                    "template_version": "1.0.0",
                    "anthropic_version": "2023-06-01",
                    "max_tokens": 4096,
                    "thinking": {"type": "disabled", "budget_tokens": 0},
                    "model_id": "claude-3-5-sonnet-20241022",
                }))
                .unwrap(),
            )
            .await
            .unwrap();

        let mut context = sample_context();
        let mut envelope = envelope_with_prerequisites(&context.verification_id);
        run(&engine, &mut context, &mut envelope).await.unwrap();

        run(&engine, &mut context, &mut envelope).await.unwrap();
        assert_eq!(context.current_status, "IDEMPOTENT_SKIP");
    }
}

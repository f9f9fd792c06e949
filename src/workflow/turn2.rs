//! `ExecuteTurn2` (S5, spec §4.7): reconstruct the two-turn conversation,
//! invoke the LLM against the checking image, parse the response, apply
//! the configurable discrepancy-threshold business rule, and persist the
//! raw/processed artifacts.
//!
//! The reconstructed conversation replays Turn 1's prompt text and its
//! assistant reply as plain text rather than re-sending the reference
//! image a second time — the model's Turn-1 observations are already
//! captured in that reply, and the image itself adds nothing Turn 2 needs
//! to compare against the checking image.

use chrono::Utc;

use super::turn_common::{load_base64_image, load_system_prompt, load_text_artifact, persist_text_artifact};
use super::{context_load_error, record_idempotent_skip, WorkflowEngine};
use crate::envelope::{ArtifactKind, Envelope, StatusHistoryEntry, VerificationContext};
use crate::error::{Error, Result};
use crate::llm::{ChatMessage, CompletionRequest, CompletionResponse, ContentBlock, ThinkingConfig};
use crate::parsing::parse_turn2_response;
use crate::rowstore::ConversationTurnEntry;

pub async fn run(engine: &WorkflowEngine, context: &mut VerificationContext, envelope: &mut Envelope) -> Result<()> {
    if envelope.has_reference(ArtifactKind::ResponsesTurn2Processed) {
        record_idempotent_skip(context, "execute_turn2", "ExecuteTurn2");
        return Ok(());
    }

    let started_at = Utc::now();
    context.record_status(StatusHistoryEntry::new("TURN2_STARTED", Utc::now(), "execute_turn2", 0, "ExecuteTurn2"));

    let (system_prompt, (checking_format, checking_base64), turn1_raw_json, _turn1_processed_json) = tokio::try_join!(
        load_system_prompt(engine, envelope),
        load_base64_image(engine, ArtifactKind::ImagesCheckingBase64, envelope),
        load_text_artifact(engine, ArtifactKind::ResponsesTurn1Raw, envelope),
        load_text_artifact(engine, ArtifactKind::ResponsesTurn1Processed, envelope),
    )
    .map_err(|e| context_load_error("ExecuteTurn2", "load_context", e))?;
    context.record_status(StatusHistoryEntry::new(
        "TURN2_CONTEXT_LOADED",
        Utc::now(),
        "execute_turn2",
        0,
        "ExecuteTurn2",
    ));

    let turn1_raw: CompletionResponse = serde_json::from_str(&turn1_raw_json)?;
    let turn1_prompt = engine.templates.render("turn1-prompt", &serde_json::json!({})).await?;
    let turn2_prompt = engine.templates.render("turn2-prompt", &serde_json::json!({})).await?;

    let messages = vec![
        ChatMessage::user_text(turn1_prompt.text),
        ChatMessage::assistant_text(turn1_raw.content),
        ChatMessage::user(vec![
            ContentBlock::text(turn2_prompt.text),
            ContentBlock::image(checking_format, checking_base64),
        ]),
    ];
    context.record_status(StatusHistoryEntry::new(
        "TURN2_PROMPT_PREPARED",
        Utc::now(),
        "execute_turn2",
        0,
        "ExecuteTurn2",
    ));

    let llm = &engine.config.llm;
    let request = CompletionRequest {
        model: system_prompt.model_id.clone(),
        anthropic_version: system_prompt.anthropic_version.clone(),
        messages,
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
        "TURN2_BEDROCK_INVOKED",
        Utc::now(),
        "execute_turn2",
        0,
        "ExecuteTurn2",
    ));
    let response = engine.llm.complete(request).await?;
    context.record_status(StatusHistoryEntry::new(
        "TURN2_BEDROCK_COMPLETED",
        Utc::now(),
        "execute_turn2",
        0,
        "ExecuteTurn2",
    ));

    let mut processed = parse_turn2_response(&response.content);
    apply_discrepancy_threshold(&mut processed, engine.config.discrepancy_threshold);

    let raw_reference = persist_text_artifact(
        engine,
        started_at,
        &context.verification_id,
        "turn2-raw.json",
        serde_json::to_string(&response)?,
    )
    .await?;
    let processed_reference = persist_text_artifact(
        engine,
        started_at,
        &context.verification_id,
        "turn2-processed.json",
        serde_json::to_string(&processed)?,
    )
    .await?;
    // Spec-mandated human/audit artifact (spec §4.7, §6): the cleaned
    // markdown plus a header of extracted fields. Not tracked by the
    // envelope — `FinalizeAndStoreResults` reloads the structured json above.
    persist_text_artifact(
        engine,
        started_at,
        &context.verification_id,
        "turn2-processed.md",
        turn2_processed_markdown(&processed),
    )
    .await?;

    engine
        .conversations
        .put_turn(&ConversationTurnEntry {
            verification_id: context.verification_id.clone(),
            turn_id: 2,
            raw_response_bucket: raw_reference.bucket.clone(),
            raw_response_key: raw_reference.key.clone(),
            processed_bucket: processed_reference.bucket.clone(),
            processed_key: processed_reference.key.clone(),
            usage: response.usage,
            provider_request_id: response.id.clone(),
            created_at: started_at,
        })
        .await
        .map_err(|e| Error::storage("ExecuteTurn2", "put_turn", e.to_string()))?;

    envelope.s3_references.insert(ArtifactKind::ResponsesTurn2Raw, raw_reference);
    envelope.s3_references.insert(ArtifactKind::ResponsesTurn2Processed, processed_reference);

    context.record_status(StatusHistoryEntry::new(
        "TURN2_COMPLETED",
        Utc::now(),
        "execute_turn2",
        (Utc::now() - started_at).num_milliseconds().max(0) as u64,
        "ExecuteTurn2",
    ));

    Ok(())
}

/// `DISCREPANCY_THRESHOLD` business rule (spec §9 Open Question, resolved
/// here as: the threshold is an absolute count across every discrepancy
/// category combined, not a per-category limit). A model that reported
/// `CORRECT` is overridden to `INCORRECT` once the total discrepancy count
/// reaches the threshold; a model that already reported `INCORRECT` is
/// left as-is regardless of count.
fn apply_discrepancy_threshold(processed: &mut crate::results::Turn2ProcessedData, threshold: u32) {
    use crate::results::VerificationOutcome;

    if processed.verification_outcome == VerificationOutcome::Correct
        && processed.discrepancy_breakdown().total() >= threshold.max(1)
    {
        processed.verification_outcome = VerificationOutcome::Incorrect;
    }
}

/// The cleaned markdown plus a header of extracted fields persisted as
/// `turn2-processed.md` (spec §4.7, §6).
fn turn2_processed_markdown(processed: &crate::results::Turn2ProcessedData) -> String {
    format!(
        "verification_outcome: {:?}\ntotal_positions_checked: {}\ncorrect_positions: {}\nempty_in_checking: {}\n\n{}",
        processed.verification_outcome,
        processed.total_positions_checked,
        processed.correct_positions,
        processed.empty_in_checking,
        processed.markdown
    )
}

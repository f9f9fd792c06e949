//! `FinalizeAndStoreResults` (S6, spec §4.9): read back the Turn-2
//! processed fields, build the terminal [`VerificationSummary`], and
//! conditionally write it to the verification row. A verification already
//! in a terminal status is left untouched (spec §4.9's idempotent write).

use chrono::Utc;

use super::turn_common::load_text_artifact;
use super::{context_load_error, WorkflowEngine};
use crate::envelope::{ArtifactKind, Envelope, StatusHistoryEntry, VerificationContext};
use crate::error::{Error, Result};
use crate::results::{Turn2ProcessedData, VerificationSummary};
use crate::rowstore::FinalizeOutcome;

const TERMINAL_STATUSES: [&str; 2] = ["COMPLETED", "VERIFICATION_FAILED"];

fn format_percentage(numerator: u32, denominator: u32) -> String {
    if denominator == 0 {
        return "0.0%".to_string();
    }
    format!("{:.1}%", (numerator as f64 / denominator as f64) * 100.0)
}

/// Confidence is a coarse function of how much of the machine disagreed
/// with the reference, not a model-reported figure (spec §9 is silent on
/// how this is derived).
fn overall_confidence(discrepant_positions: u32, total_positions_checked: u32) -> &'static str {
    if total_positions_checked == 0 {
        return "low";
    }
    let ratio = discrepant_positions as f64 / total_positions_checked as f64;
    if ratio == 0.0 {
        "high"
    } else if ratio <= 0.1 {
        "medium"
    } else {
        "low"
    }
}

pub async fn run(engine: &WorkflowEngine, context: &mut VerificationContext, envelope: &mut Envelope) -> Result<()> {
    if TERMINAL_STATUSES.contains(&context.current_status.as_str()) {
        return Ok(());
    }

    let started_at = Utc::now();

    let turn2_json = load_text_artifact(engine, ArtifactKind::ResponsesTurn2Processed, envelope)
        .await
        .map_err(|e| context_load_error("FinalizeAndStoreResults", "load_turn2_processed", e))?;
    let turn2: Turn2ProcessedData = serde_json::from_str(&turn2_json)?;

    let discrepant_positions = turn2.discrepancies.len() as u32;
    let summary = VerificationSummary {
        verification_outcome: turn2.verification_outcome,
        total_positions_checked: turn2.total_positions_checked,
        correct_positions: turn2.correct_positions,
        discrepant_positions,
        empty_in_checking: turn2.empty_in_checking,
        discrepancy_breakdown: turn2.discrepancy_breakdown(),
        overall_accuracy: format_percentage(turn2.correct_positions, turn2.total_positions_checked),
        overall_confidence: overall_confidence(discrepant_positions, turn2.total_positions_checked).to_string(),
        comparison_summary: turn2.comparison_summary.clone(),
    };

    context.status = "COMPLETED".to_string();
    context.record_status(StatusHistoryEntry::new(
        "COMPLETED",
        Utc::now(),
        "finalize_and_store_results",
        (Utc::now() - started_at).num_milliseconds().max(0) as u64,
        "FinalizeAndStoreResults",
    ));

    let outcome = engine
        .verifications
        .finalize(context, &summary, &turn2.discrepancies)
        .await
        .map_err(|e| Error::storage("FinalizeAndStoreResults", "finalize", e.to_string()))?;
    if outcome == FinalizeOutcome::AlreadyFinalized {
        return Ok(());
    }

    envelope.status = context.current_status.clone();
    if let serde_json::Value::Object(map) = serde_json::to_value(&summary)? {
        envelope.summary = map;
    }

    Ok(())
}

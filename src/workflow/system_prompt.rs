//! `PrepareSystemPrompt` (S3, spec §4.5): select the versioned template for
//! the verification type, render it with the machine structure and any
//! historical summary, and persist the resulting `CompleteSystemPrompt`.

use chrono::Utc;
use serde::Serialize;
use serde_json::json;

use super::{record_idempotent_skip, WorkflowEngine};
use crate::blob::date_partitioned_key;
use crate::envelope::{ArtifactKind, Envelope, Reference, StatusHistoryEntry, VerificationContext, VerificationType};
use crate::error::{Error, Result};
use crate::results::MachineStructure;

fn default_machine_structure() -> MachineStructure {
    MachineStructure {
        row_count: 4,
        columns_per_row: 6,
        row_order: vec!["A".into(), "B".into(), "C".into(), "D".into()],
        column_order: (1..=6).map(|n| n.to_string()).collect(),
    }
}

#[derive(Debug, Serialize)]
struct MachineStructureView {
    row_count: u32,
    columns_per_row: u32,
    row_labels: String,
}

impl From<&MachineStructure> for MachineStructureView {
    fn from(structure: &MachineStructure) -> Self {
        Self {
            row_count: structure.row_count,
            columns_per_row: structure.columns_per_row,
            row_labels: structure.row_order.join(", "),
        }
    }
}

pub async fn run(
    engine: &WorkflowEngine,
    context: &mut VerificationContext,
    envelope: &mut Envelope,
) -> Result<()> {
    if envelope.has_reference(ArtifactKind::PromptsSystem) {
        record_idempotent_skip(context, "prepare_system_prompt", "PrepareSystemPrompt");
        return Ok(());
    }

    let started_at = Utc::now();
    let capabilities = context.verification_type.capabilities();

    let machine_structure = engine
        .layouts
        .get_by_reference_image_url(&context.reference_image_url)
        .await
        .map_err(|e| Error::context_load("PrepareSystemPrompt", "lookup_layout", e.to_string()))?
        .map(|layout| layout.machine_structure)
        .unwrap_or_else(default_machine_structure);

    // Both optional fields are always present (as `null` when not applicable)
    // so a strict-mode `{{#if}}` lookup never hits a genuinely missing path.
    let mut template_context = json!({
        "machine_structure": MachineStructureView::from(&machine_structure),
        "layout_mapping": serde_json::Value::Null,
        "historical_summary": serde_json::Value::Null,
    });
    if context.verification_type == VerificationType::PreviousVsCurrent {
        template_context["historical_summary"] = json!(format!(
            "Previous verification id: {}",
            context.previous_verification_id.as_deref().unwrap_or("unknown")
        ));
    }

    let complete_prompt = engine
        .templates
        .render_system_prompt(capabilities.template_name, &template_context, &engine.config.llm)
        .await?;

    let bytes = serde_json::to_vec(&complete_prompt)?;
    let key = date_partitioned_key(
        "prompts",
        started_at,
        &context.verification_id,
        "system-prompt.json",
    );
    let etag = engine
        .blobs
        .put(&engine.config.state_bucket, &key, bytes.clone())
        .await
        .map_err(|e| Error::storage("PrepareSystemPrompt", "put_system_prompt", e.to_string()))?;

    envelope.s3_references.insert(
        ArtifactKind::PromptsSystem,
        Reference::new(engine.config.state_bucket.clone(), key)
            .with_etag(etag)
            .with_size(bytes.len() as u64),
    );

    context.record_status(StatusHistoryEntry::new(
        "SYSTEM_PROMPT_PREPARED",
        Utc::now(),
        "prepare_system_prompt",
        (Utc::now() - started_at).num_milliseconds().max(0) as u64,
        "PrepareSystemPrompt",
    ));

    Ok(())
}

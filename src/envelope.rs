//! The state-envelope protocol and verification data model (spec §3, §6).
//!
//! Stages exchange only [`Envelope`]s: references to externally stored
//! artifacts, never payload bodies. `serde_json` round-trips every type in
//! this module losslessly (spec §8's round-trip law).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A typed pointer to a blob (spec §3's "Reference").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reference {
    pub bucket: String,
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl Reference {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            etag: None,
            size: None,
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }
}

/// The closed set of `s3References` keys named in spec §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    ProcessingInitialization,
    ImagesReferenceBase64,
    ImagesCheckingBase64,
    ImagesMetadata,
    PromptsSystem,
    ResponsesTurn1Raw,
    ResponsesTurn1Processed,
    ResponsesTurn2Raw,
    ResponsesTurn2Processed,
    ProcessingHistoricalContext,
    ProcessingLayoutMetadata,
    Error,
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ArtifactKind::ProcessingInitialization => "processing_initialization",
            ArtifactKind::ImagesReferenceBase64 => "images_reference_base64",
            ArtifactKind::ImagesCheckingBase64 => "images_checking_base64",
            ArtifactKind::ImagesMetadata => "images_metadata",
            ArtifactKind::PromptsSystem => "prompts_system",
            ArtifactKind::ResponsesTurn1Raw => "responses_turn1_raw",
            ArtifactKind::ResponsesTurn1Processed => "responses_turn1_processed",
            ArtifactKind::ResponsesTurn2Raw => "responses_turn2_raw",
            ArtifactKind::ResponsesTurn2Processed => "responses_turn2_processed",
            ArtifactKind::ProcessingHistoricalContext => "processing_historical_context",
            ArtifactKind::ProcessingLayoutMetadata => "processing_layout_metadata",
            ArtifactKind::Error => "error",
        };
        f.write_str(s)
    }
}

/// Verification type (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationType {
    LayoutVsChecking,
    PreviousVsCurrent,
}

impl VerificationType {
    /// Capability record from spec §9: replaces scattered type-inspection
    /// with one small lookup per verification type.
    pub fn capabilities(self) -> TypeCapabilities {
        match self {
            VerificationType::LayoutVsChecking => TypeCapabilities {
                template_name: "layout-vs-checking",
                needs_historical_context: false,
                needs_layout_metadata: true,
            },
            VerificationType::PreviousVsCurrent => TypeCapabilities {
                template_name: "previous-vs-current",
                needs_historical_context: true,
                needs_layout_metadata: false,
            },
        }
    }
}

/// Per-type capability record (spec §9).
#[derive(Debug, Clone, Copy)]
pub struct TypeCapabilities {
    pub template_name: &'static str,
    pub needs_historical_context: bool,
    pub needs_layout_metadata: bool,
}

/// One append-only entry in `VerificationContext::status_history` (spec §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusHistoryEntry {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub function_name: String,
    pub processing_time_ms: u64,
    pub stage: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metrics: serde_json::Map<String, serde_json::Value>,
}

impl StatusHistoryEntry {
    pub fn new(
        status: impl Into<String>,
        timestamp: DateTime<Utc>,
        function_name: impl Into<String>,
        processing_time_ms: u64,
        stage: impl Into<String>,
    ) -> Self {
        Self {
            status: status.into(),
            timestamp,
            function_name: function_name.into(),
            processing_time_ms,
            stage: stage.into(),
            metrics: serde_json::Map::new(),
        }
    }
}

/// Error tracking summary attached to a `VerificationContext` once any
/// stage has failed (spec §3).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorTracking {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub has_errors: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Rolling processing metrics attached to a `VerificationContext` (spec §3).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingMetrics {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub stage_durations_ms: BTreeMap<String, u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_attempts: Option<u32>,
}

/// The authoritative descriptor of one verification (spec §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationContext {
    pub verification_id: String,
    pub verification_at: DateTime<Utc>,
    pub verification_type: VerificationType,
    pub reference_image_url: String,
    pub checking_image_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layout_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layout_prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_verification_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vending_machine_id: Option<String>,
    pub status: String,
    pub current_status: String,
    pub last_updated_at: DateTime<Utc>,
    #[serde(default)]
    pub status_history: Vec<StatusHistoryEntry>,
    #[serde(default)]
    pub processing_metrics: ProcessingMetrics,
    #[serde(default)]
    pub error_tracking: ErrorTracking,
}

impl VerificationContext {
    /// Append a status-history entry and bump `last_updated_at`, enforcing
    /// the non-decreasing timestamp invariant from spec §8.
    pub fn record_status(&mut self, entry: StatusHistoryEntry) {
        let ts = entry.timestamp.max(self.last_updated_at);
        self.current_status = entry.status.clone();
        self.status_history.push(entry);
        self.last_updated_at = ts;
    }

    /// Mark the context as terminally failed (spec §4.10).
    pub fn mark_failed(&mut self, error_stage: impl Into<String>, message: impl Into<String>) {
        self.current_status = "VERIFICATION_FAILED".to_string();
        self.status = "VERIFICATION_FAILED".to_string();
        self.error_tracking = ErrorTracking {
            has_errors: true,
            error_stage: Some(error_stage.into()),
            message: Some(message.into()),
        };
    }
}

/// A verification request as submitted to the orchestrator (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationRequest {
    pub verification_type: VerificationType,
    pub reference_image_url: String,
    pub checking_image_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layout_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layout_prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_verification_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vending_machine_id: Option<String>,
}

/// The inter-stage message (spec §3, §6). Bounded in size; never carries
/// artifact bodies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub verification_id: String,
    pub status: String,
    #[serde(default)]
    pub s3_references: BTreeMap<ArtifactKind, Reference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification_context: Option<VerificationContext>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub summary: serde_json::Map<String, serde_json::Value>,
}

impl Envelope {
    pub fn new(verification_id: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            verification_id: verification_id.into(),
            status: status.into(),
            s3_references: BTreeMap::new(),
            verification_context: None,
            summary: serde_json::Map::new(),
        }
    }

    pub fn with_reference(mut self, kind: ArtifactKind, reference: Reference) -> Self {
        self.s3_references.insert(kind, reference);
        self
    }

    pub fn reference(&self, kind: ArtifactKind) -> Option<&Reference> {
        self.s3_references.get(&kind)
    }

    pub fn has_reference(&self, kind: ArtifactKind) -> bool {
        self.s3_references.contains_key(&kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_context() -> VerificationContext {
        let now = Utc::now();
        VerificationContext {
            verification_id: "verif-20250101000000-aaaa".to_string(),
            verification_at: now,
            verification_type: VerificationType::LayoutVsChecking,
            reference_image_url: "s3://ref/ref.jpg".to_string(),
            checking_image_url: "s3://chk/chk.jpg".to_string(),
            layout_id: Some(42),
            layout_prefix: Some("VM-42".to_string()),
            previous_verification_id: None,
            vending_machine_id: Some("VM-42".to_string()),
            status: "VERIFICATION_INITIALIZED".to_string(),
            current_status: "VERIFICATION_INITIALIZED".to_string(),
            last_updated_at: now,
            status_history: vec![],
            processing_metrics: ProcessingMetrics::default(),
            error_tracking: ErrorTracking::default(),
        }
    }

    #[test]
    fn envelope_round_trips_through_json() {
        let mut envelope = Envelope::new("verif-20250101000000-aaaa", "VERIFICATION_INITIALIZED");
        envelope = envelope.with_reference(
            ArtifactKind::ProcessingInitialization,
            Reference::new("state-bucket", "processing/2025/01/01/verif-1/initialization.json"),
        );
        envelope.verification_context = Some(sample_context());

        let json = serde_json::to_string(&envelope).unwrap();
        let round_tripped: Envelope = serde_json::from_str(&json).unwrap();

        assert_eq!(round_tripped.verification_id, envelope.verification_id);
        assert_eq!(round_tripped.status, envelope.status);
        assert_eq!(round_tripped.s3_references, envelope.s3_references);
        assert_eq!(
            round_tripped.verification_context.unwrap().verification_id,
            "verif-20250101000000-aaaa"
        );
    }

    #[test]
    fn artifact_kind_serializes_to_closed_key_names() {
        assert_eq!(
            serde_json::to_value(ArtifactKind::ResponsesTurn1Processed).unwrap(),
            serde_json::json!("responses_turn1_processed")
        );
    }

    #[test]
    fn record_status_never_rewinds_last_updated_at() {
        let mut ctx = sample_context();
        let t0 = ctx.last_updated_at;
        let earlier = t0 - chrono::Duration::seconds(10);
        ctx.record_status(StatusHistoryEntry::new(
            "TURN1_STARTED",
            earlier,
            "execute_turn1",
            5,
            "ExecuteTurn1",
        ));
        assert!(ctx.last_updated_at >= t0);
    }

    #[test]
    fn verification_type_capabilities_match_spec_table() {
        assert!(
            VerificationType::PreviousVsCurrent
                .capabilities()
                .needs_historical_context
        );
        assert!(
            VerificationType::LayoutVsChecking
                .capabilities()
                .needs_layout_metadata
        );
    }
}

//! Turn-2 discrepancy and verification-summary types (spec §3, §4.7).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Terminal outcome of a verification (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationOutcome {
    Correct,
    Incorrect,
}

/// A per-position discrepancy classification (spec §4.7, glossary).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiscrepancyType {
    Missing,
    Misplaced,
    Unexpected,
    IncorrectType,
}

/// One per-position mismatch (spec §4.7).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discrepancy {
    pub item: String,
    pub expected: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub found: Option<String>,
    #[serde(rename = "type")]
    pub kind: DiscrepancyType,
}

/// Per-category discrepancy counts (spec §4.7, §4.9).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscrepancyBreakdown {
    #[serde(default)]
    pub missing_products: u32,
    #[serde(default)]
    pub misplaced_products: u32,
    #[serde(default)]
    pub unexpected_products: u32,
    #[serde(default)]
    pub incorrect_type_products: u32,
}

impl DiscrepancyBreakdown {
    pub fn record(&mut self, kind: DiscrepancyType) {
        match kind {
            DiscrepancyType::Missing => self.missing_products += 1,
            DiscrepancyType::Misplaced => self.misplaced_products += 1,
            DiscrepancyType::Unexpected => self.unexpected_products += 1,
            DiscrepancyType::IncorrectType => self.incorrect_type_products += 1,
        }
    }

    pub fn total(&self) -> u32 {
        self.missing_products
            + self.misplaced_products
            + self.unexpected_products
            + self.incorrect_type_products
    }
}

/// The finalization target's summary (spec §3, §4.9).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationSummary {
    pub verification_outcome: VerificationOutcome,
    pub total_positions_checked: u32,
    pub correct_positions: u32,
    pub discrepant_positions: u32,
    pub empty_in_checking: u32,
    pub discrepancy_breakdown: DiscrepancyBreakdown,
    pub overall_accuracy: String,
    pub overall_confidence: String,
    pub comparison_summary: String,
}

/// Machine structure: the physical grid of a vending machine (glossary).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineStructure {
    pub row_count: u32,
    pub columns_per_row: u32,
    pub row_order: Vec<String>,
    pub column_order: Vec<String>,
}

/// Per-row product/status map captured from Turn-1 (spec §4.6).
pub type RowStatusMap = BTreeMap<String, String>;

/// Structured fields extracted from the Turn-1 response (spec §4.6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn1ProcessedData {
    pub initial_confirmation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine_structure: Option<MachineStructure>,
    #[serde(default)]
    pub row_status: RowStatusMap,
    pub reference_summary: String,
    pub markdown: String,
}

/// Structured fields extracted from the Turn-2 response (spec §4.7).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn2ProcessedData {
    pub verification_outcome: VerificationOutcome,
    #[serde(default)]
    pub discrepancies: Vec<Discrepancy>,
    pub comparison_summary: String,
    pub total_positions_checked: u32,
    pub correct_positions: u32,
    pub empty_in_checking: u32,
    pub markdown: String,
}

impl Turn2ProcessedData {
    pub fn discrepancy_breakdown(&self) -> DiscrepancyBreakdown {
        let mut breakdown = DiscrepancyBreakdown::default();
        for d in &self.discrepancies {
            breakdown.record(d.kind);
        }
        breakdown
    }
}

/// A legitimate-empty parse result (spec §9: empty text is not an error).
impl Default for Turn2ProcessedData {
    fn default() -> Self {
        Self {
            verification_outcome: VerificationOutcome::Incorrect,
            discrepancies: Vec::new(),
            comparison_summary: String::new(),
            total_positions_checked: 0,
            correct_positions: 0,
            empty_in_checking: 0,
            markdown: String::new(),
        }
    }
}

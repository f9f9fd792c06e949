//! Response-parsing fallback ladder (spec §4.8 sub-phase 5, §9): JSON
//! decode first, then a structured-markdown extractor, then a loose
//! regex-based fallback. Any step may succeed; a failed step is silent and
//! the next is tried. Empty text is a legitimate result, not an error —
//! every function here returns a value, never a `Result`.

use crate::results::{
    Discrepancy, DiscrepancyType, MachineStructure, RowStatusMap, Turn1ProcessedData,
    Turn2ProcessedData, VerificationOutcome,
};
use regex::Regex;
use std::sync::LazyLock;

/// `- **Field Name:** value` or `Field Name: value`, used by the
/// structured-markdown extraction step.
static BULLET_FIELD_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?mi)^\s*(?:[-*]\s*)?\*{0,2}([A-Za-z][A-Za-z \-_]*?)\*{0,2}\s*:\s*(.+)$")
        .expect("invalid bullet field pattern")
});

/// Per-row product/status lines: `A1: Coca-Cola (present)` or a markdown
/// table row `| A1 | Coca-Cola | present |`.
static ROW_STATUS_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?mi)^\|?\s*([A-Z]\d{1,2})\s*[|:]\s*(.+?)\s*\|?\s*$")
        .expect("invalid row status pattern")
});

/// `## VERIFICATION SUMMARY` / `## COMPARISON SUMMARY` section headers.
static SECTION_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?mi)^#{1,3}\s*(VERIFICATION SUMMARY|COMPARISON SUMMARY)\s*$")
        .expect("invalid section header pattern")
});

/// A bare `CORRECT` / `INCORRECT` outcome token, matched as a whole word so
/// it doesn't fire inside longer words.
static OUTCOME_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(CORRECT|INCORRECT)\b").expect("invalid outcome pattern"));

/// Discrepancy line: `item: Slot A1, expected: Coca-Cola, found: Sprite, type: MISPLACED`.
static DISCREPANCY_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)item:\s*([^,]+),\s*expected:\s*([^,]+)(?:,\s*found:\s*([^,]+))?,\s*type:\s*(MISSING|MISPLACED|UNEXPECTED|INCORRECT_TYPE)",
    )
    .expect("invalid discrepancy pattern")
});

fn bullet_fields(text: &str) -> Vec<(String, String)> {
    BULLET_FIELD_PATTERN
        .captures_iter(text)
        .map(|c| (c[1].trim().to_lowercase(), c[2].trim().to_string()))
        .collect()
}

fn field_value<'a>(fields: &'a [(String, String)], names: &[&str]) -> Option<&'a str> {
    fields
        .iter()
        .find(|(key, _)| names.iter().any(|n| key == n))
        .map(|(_, value)| value.as_str())
}

fn parse_discrepancy_type(token: &str) -> Option<DiscrepancyType> {
    match token.to_uppercase().as_str() {
        "MISSING" => Some(DiscrepancyType::Missing),
        "MISPLACED" => Some(DiscrepancyType::Misplaced),
        "UNEXPECTED" => Some(DiscrepancyType::Unexpected),
        "INCORRECT_TYPE" => Some(DiscrepancyType::IncorrectType),
        _ => None,
    }
}

fn parse_u32_field(value: Option<&str>) -> u32 {
    value
        .and_then(|v| v.chars().filter(|c| c.is_ascii_digit()).collect::<String>().parse().ok())
        .unwrap_or(0)
}

/// Parse a Turn-1 raw response (spec §4.6).
pub fn parse_turn1_response(raw: &str) -> Turn1ProcessedData {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Turn1ProcessedData {
            initial_confirmation: String::new(),
            machine_structure: None,
            row_status: RowStatusMap::new(),
            reference_summary: String::new(),
            markdown: String::new(),
        };
    }

    if let Ok(direct) = serde_json::from_str::<Turn1ProcessedData>(trimmed) {
        return direct;
    }
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(parsed) = turn1_from_json_value(&value, trimmed) {
            return parsed;
        }
    }

    let fields = bullet_fields(trimmed);
    let initial_confirmation = field_value(&fields, &["initial confirmation", "confirmation"])
        .unwrap_or_default()
        .to_string();
    let reference_summary = field_value(&fields, &["reference summary", "summary"])
        .unwrap_or_default()
        .to_string();

    let mut row_status = RowStatusMap::new();
    for caps in ROW_STATUS_LINE.captures_iter(trimmed) {
        row_status.insert(caps[1].to_string(), caps[2].trim().to_string());
    }

    Turn1ProcessedData {
        initial_confirmation,
        machine_structure: None,
        row_status,
        reference_summary,
        markdown: trimmed.to_string(),
    }
}

fn turn1_from_json_value(value: &serde_json::Value, raw: &str) -> Option<Turn1ProcessedData> {
    let obj = value.as_object()?;
    let get_str = |keys: &[&str]| {
        keys.iter()
            .find_map(|k| obj.get(*k).and_then(|v| v.as_str()))
            .unwrap_or_default()
            .to_string()
    };
    let machine_structure = obj
        .get("machineStructure")
        .or_else(|| obj.get("machine_structure"))
        .and_then(|v| serde_json::from_value::<MachineStructure>(v.clone()).ok());
    let row_status = obj
        .get("rowStatus")
        .or_else(|| obj.get("row_status"))
        .and_then(|v| serde_json::from_value::<RowStatusMap>(v.clone()).ok())
        .unwrap_or_default();

    Some(Turn1ProcessedData {
        initial_confirmation: get_str(&["initialConfirmation", "initial_confirmation"]),
        machine_structure,
        row_status,
        reference_summary: get_str(&["referenceSummary", "reference_summary"]),
        markdown: raw.to_string(),
    })
}

/// Parse a Turn-2 raw response (spec §4.7).
pub fn parse_turn2_response(raw: &str) -> Turn2ProcessedData {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Turn2ProcessedData::default();
    }

    if let Ok(direct) = serde_json::from_str::<Turn2ProcessedData>(trimmed) {
        return direct;
    }
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(parsed) = turn2_from_json_value(&value, trimmed) {
            return parsed;
        }
    }

    let mut discrepancies = Vec::new();
    for caps in DISCREPANCY_LINE.captures_iter(trimmed) {
        if let Some(kind) = parse_discrepancy_type(&caps[4]) {
            discrepancies.push(Discrepancy {
                item: caps[1].trim().to_string(),
                expected: caps[2].trim().to_string(),
                found: caps.get(3).map(|m| m.as_str().trim().to_string()),
                kind,
            });
        }
    }

    let fields = bullet_fields(trimmed);
    let total_positions_checked = parse_u32_field(field_value(
        &fields,
        &["total positions checked", "total positions"],
    ));
    let correct_positions = parse_u32_field(field_value(&fields, &["correct positions"]));
    let empty_in_checking = parse_u32_field(field_value(&fields, &["empty in checking"]));

    let comparison_summary = comparison_summary_section(trimmed)
        .or_else(|| field_value(&fields, &["comparison summary"]).map(str::to_string))
        .unwrap_or_default();

    let verification_outcome = OUTCOME_TOKEN
        .captures(trimmed)
        .and_then(|c| match c[1].to_uppercase().as_str() {
            "CORRECT" => Some(VerificationOutcome::Correct),
            "INCORRECT" => Some(VerificationOutcome::Incorrect),
            _ => None,
        })
        .unwrap_or(if discrepancies.is_empty() {
            VerificationOutcome::Correct
        } else {
            VerificationOutcome::Incorrect
        });

    Turn2ProcessedData {
        verification_outcome,
        discrepancies,
        comparison_summary,
        total_positions_checked,
        correct_positions,
        empty_in_checking,
        markdown: trimmed.to_string(),
    }
}

fn turn2_from_json_value(value: &serde_json::Value, raw: &str) -> Option<Turn2ProcessedData> {
    let obj = value.as_object()?;
    let outcome_str = obj
        .get("verificationOutcome")
        .or_else(|| obj.get("verification_outcome"))
        .and_then(|v| v.as_str())?;
    let verification_outcome = match outcome_str.to_uppercase().as_str() {
        "CORRECT" => VerificationOutcome::Correct,
        "INCORRECT" => VerificationOutcome::Incorrect,
        _ => return None,
    };
    let discrepancies = obj
        .get("discrepancies")
        .and_then(|v| serde_json::from_value::<Vec<Discrepancy>>(v.clone()).ok())
        .unwrap_or_default();
    let get_u32 = |keys: &[&str]| -> u32 {
        keys.iter()
            .find_map(|k| obj.get(*k).and_then(|v| v.as_u64()))
            .unwrap_or(0) as u32
    };
    let get_str = |keys: &[&str]| {
        keys.iter()
            .find_map(|k| obj.get(*k).and_then(|v| v.as_str()))
            .unwrap_or_default()
            .to_string()
    };

    Some(Turn2ProcessedData {
        verification_outcome,
        discrepancies,
        comparison_summary: get_str(&["comparisonSummary", "comparison_summary"]),
        total_positions_checked: get_u32(&["totalPositionsChecked", "total_positions_checked"]),
        correct_positions: get_u32(&["correctPositions", "correct_positions"]),
        empty_in_checking: get_u32(&["emptyInChecking", "empty_in_checking"]),
        markdown: raw.to_string(),
    })
}

fn comparison_summary_section(text: &str) -> Option<String> {
    let header_match = SECTION_HEADER
        .captures_iter(text)
        .find(|c| c[1].eq_ignore_ascii_case("COMPARISON SUMMARY"))?;
    let start = header_match.get(0)?.end();
    let rest = &text[start..];
    let end = SECTION_HEADER.find(rest).map(|m| m.start()).unwrap_or(rest.len());
    Some(rest[..end].trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_turn1_text_is_a_legitimate_empty_result() {
        let parsed = parse_turn1_response("");
        assert!(parsed.row_status.is_empty());
        assert_eq!(parsed.markdown, "");
    }

    #[test]
    fn empty_turn2_text_is_a_legitimate_empty_result() {
        let parsed = parse_turn2_response("   ");
        assert_eq!(parsed, Turn2ProcessedData::default());
    }

    #[test]
    fn turn1_json_decodes_directly() {
        let json = serde_json::json!({
            "initialConfirmation": "looks correct",
            "rowStatus": {"A1": "present"},
            "referenceSummary": "4 rows, 6 columns",
        })
        .to_string();
        let parsed = parse_turn1_response(&json);
        assert_eq!(parsed.initial_confirmation, "looks correct");
        assert_eq!(parsed.row_status.get("A1").unwrap(), "present");
    }

    #[test]
    fn turn2_falls_back_to_structured_markdown() {
        let text = "- **Verification Outcome:** INCORRECT\n\
                     item: A1, expected: Coca-Cola, found: Sprite, type: MISPLACED\n\
                     - **Total Positions Checked:** 24\n\
                     - **Correct Positions:** 23\n\
                     ## COMPARISON SUMMARY\n\
                     One item swapped at A1.\n";
        let parsed = parse_turn2_response(text);
        assert_eq!(parsed.verification_outcome, VerificationOutcome::Incorrect);
        assert_eq!(parsed.discrepancies.len(), 1);
        assert_eq!(parsed.discrepancies[0].kind, DiscrepancyType::Misplaced);
        assert_eq!(parsed.total_positions_checked, 24);
        assert_eq!(parsed.comparison_summary, "One item swapped at A1.");
    }

    #[test]
    fn turn2_defaults_to_correct_when_no_discrepancies_found() {
        let parsed = parse_turn2_response("Nothing unusual noticed in this comparison.");
        assert_eq!(parsed.verification_outcome, VerificationOutcome::Correct);
        assert!(parsed.discrepancies.is_empty());
    }
}

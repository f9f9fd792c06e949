//! SQLite-backed implementation of the row-store traits, grounded on the
//! single-connection `with_conn` pattern used throughout this crate's
//! reference store.

use super::schema::{initialize_schema, is_initialized};
use super::{
    ConversationRow, ConversationRowStore, ConversationTurnEntry, CreateOutcome, FinalizeOutcome,
    LayoutMetadata, LayoutStore, VerificationRowStore,
};
use crate::envelope::{ErrorTracking, ProcessingMetrics, VerificationContext, VerificationType};
use crate::error::{Error, Result};
use crate::llm::TokenUsage;
use crate::results::{Discrepancy, MachineStructure, VerificationSummary};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

const TERMINAL_STATUSES: [&str; 2] = ["COMPLETED", "VERIFICATION_FAILED"];

/// A row store backed by a single SQLite connection, shared via a mutex the
/// way a single-writer embedded database is normally hosted.
pub struct SqliteRowStore {
    conn: Mutex<Connection>,
}

impl SqliteRowStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| Error::storage("SqliteRowStore", "open", e.to_string()))?;
        if !is_initialized(&conn) {
            initialize_schema(&conn)
                .map_err(|e| Error::storage("SqliteRowStore", "initialize_schema", e.to_string()))?;
        }
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::storage("SqliteRowStore", "open_in_memory", e.to_string()))?;
        initialize_schema(&conn)
            .map_err(|e| Error::storage("SqliteRowStore", "initialize_schema", e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<F, T>(&self, operation: &str, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::internal("SqliteRowStore", operation, e.to_string()))?;
        f(&conn).map_err(|e| Error::storage("SqliteRowStore", operation, e.to_string()))
    }

    fn row_to_context(row: &rusqlite::Row) -> rusqlite::Result<VerificationContext> {
        let context_json: String = row.get("context_json")?;
        serde_json::from_str(&context_json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
    }
}

#[async_trait]
impl VerificationRowStore for SqliteRowStore {
    async fn create_initial(&self, context: &VerificationContext) -> Result<CreateOutcome> {
        let context_json = serde_json::to_string(context)?;
        self.with_conn("create_initial", |conn| {
            let result = conn.execute(
                "INSERT INTO verifications (
                    verification_id, verification_at, reference_image_url, checking_image_url,
                    vending_machine_id, context_json, current_status
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    context.verification_id,
                    context.verification_at.to_rfc3339(),
                    context.reference_image_url,
                    context.checking_image_url,
                    context.vending_machine_id,
                    context_json,
                    context.current_status,
                ],
            );
            match result {
                Ok(_) => Ok(CreateOutcome::Created),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    Ok(CreateOutcome::AlreadyExists)
                }
                Err(e) => Err(e),
            }
        })
    }

    async fn update(&self, context: &VerificationContext) -> Result<()> {
        let context_json = serde_json::to_string(context)?;
        self.with_conn("update", |conn| {
            conn.execute(
                "UPDATE verifications SET context_json = ?3, current_status = ?4
                 WHERE verification_id = ?1 AND verification_at = ?2",
                params![
                    context.verification_id,
                    context.verification_at.to_rfc3339(),
                    context_json,
                    context.current_status,
                ],
            )?;
            Ok(())
        })
    }

    async fn finalize(
        &self,
        context: &VerificationContext,
        summary: &VerificationSummary,
        discrepancies: &[Discrepancy],
    ) -> Result<FinalizeOutcome> {
        let context_json = serde_json::to_string(context)?;
        let summary_json = serde_json::to_string(summary)?;
        let discrepancies_json = serde_json::to_string(discrepancies)?;
        let verification_status = serde_json::to_value(summary.verification_outcome)?
            .as_str()
            .map(str::to_string);

        let verification_at_str = context.verification_at.to_rfc3339();

        self.with_conn("finalize", |conn| {
            let placeholders = TERMINAL_STATUSES
                .iter()
                .map(|_| "?")
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "UPDATE verifications SET
                    context_json = ?3, current_status = ?4, verification_status = ?5,
                    verification_summary_json = ?6, discrepancies_json = ?7
                 WHERE verification_id = ?1 AND verification_at = ?2
                   AND current_status NOT IN ({placeholders})"
            );
            let mut bound: Vec<&dyn rusqlite::ToSql> = vec![
                &context.verification_id,
                &verification_at_str,
                &context_json,
                &context.current_status,
                &verification_status,
                &summary_json,
                &discrepancies_json,
            ];
            for status in TERMINAL_STATUSES.iter() {
                bound.push(status);
            }

            let affected = conn.execute(&sql, bound.as_slice())?;
            if affected > 0 {
                Ok(FinalizeOutcome::Finalized)
            } else {
                Ok(FinalizeOutcome::AlreadyFinalized)
            }
        })
    }

    async fn get(&self, verification_id: &str) -> Result<Option<VerificationContext>> {
        self.with_conn("get", |conn| {
            conn.query_row(
                "SELECT context_json FROM verifications WHERE verification_id = ?1
                 ORDER BY verification_at DESC LIMIT 1",
                params![verification_id],
                Self::row_to_context,
            )
            .optional()
        })
    }

    async fn find_by_reference_image_url(
        &self,
        reference_image_url: &str,
    ) -> Result<Vec<VerificationContext>> {
        self.with_conn("find_by_reference_image_url", |conn| {
            let mut stmt = conn.prepare(
                "SELECT context_json FROM verifications
                 WHERE reference_image_url = ?1
                 ORDER BY created_at DESC",
            )?;
            let rows = stmt
                .query_map(params![reference_image_url], Self::row_to_context)?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })
    }
}

#[async_trait]
impl ConversationRowStore for SqliteRowStore {
    async fn put_conversation(&self, row: &ConversationRow) -> Result<()> {
        self.with_conn("put_conversation", |conn| {
            conn.execute(
                "INSERT INTO conversations (verification_id, conversation_at, current_turn, turn_status)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(verification_id, conversation_at)
                 DO UPDATE SET current_turn = excluded.current_turn, turn_status = excluded.turn_status",
                params![
                    row.verification_id,
                    row.conversation_at.to_rfc3339(),
                    row.current_turn,
                    row.turn_status,
                ],
            )?;
            Ok(())
        })
    }

    async fn put_turn(&self, entry: &ConversationTurnEntry) -> Result<()> {
        self.with_conn("put_turn", |conn| {
            conn.execute(
                "INSERT INTO conversation_turns (
                    verification_id, turn_id, raw_response_bucket, raw_response_key,
                    processed_bucket, processed_key, input_tokens, output_tokens,
                    thinking_tokens, total_tokens, provider_request_id, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT(verification_id, turn_id) DO UPDATE SET
                    raw_response_bucket = excluded.raw_response_bucket,
                    raw_response_key = excluded.raw_response_key,
                    processed_bucket = excluded.processed_bucket,
                    processed_key = excluded.processed_key,
                    input_tokens = excluded.input_tokens,
                    output_tokens = excluded.output_tokens,
                    thinking_tokens = excluded.thinking_tokens,
                    total_tokens = excluded.total_tokens,
                    provider_request_id = excluded.provider_request_id",
                params![
                    entry.verification_id,
                    entry.turn_id,
                    entry.raw_response_bucket,
                    entry.raw_response_key,
                    entry.processed_bucket,
                    entry.processed_key,
                    entry.usage.input_tokens,
                    entry.usage.output_tokens,
                    entry.usage.thinking_tokens,
                    entry.usage.total(),
                    entry.provider_request_id,
                    entry.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    async fn get_turns(&self, verification_id: &str) -> Result<Vec<ConversationTurnEntry>> {
        self.with_conn("get_turns", |conn| {
            let mut stmt = conn.prepare(
                "SELECT verification_id, turn_id, raw_response_bucket, raw_response_key,
                        processed_bucket, processed_key, input_tokens, output_tokens,
                        thinking_tokens, provider_request_id, created_at
                 FROM conversation_turns WHERE verification_id = ?1 ORDER BY turn_id ASC",
            )?;
            let rows = stmt
                .query_map(params![verification_id], |row| {
                    Ok(ConversationTurnEntry {
                        verification_id: row.get(0)?,
                        turn_id: row.get(1)?,
                        raw_response_bucket: row.get(2)?,
                        raw_response_key: row.get(3)?,
                        processed_bucket: row.get(4)?,
                        processed_key: row.get(5)?,
                        usage: TokenUsage {
                            input_tokens: row.get(6)?,
                            output_tokens: row.get(7)?,
                            thinking_tokens: row.get(8)?,
                        },
                        provider_request_id: row.get(9)?,
                        created_at: parse_rfc3339(row, 10)?,
                    })
                })?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })
    }
}

#[async_trait]
impl LayoutStore for SqliteRowStore {
    async fn get_by_reference_image_url(
        &self,
        reference_image_url: &str,
    ) -> Result<Option<LayoutMetadata>> {
        self.with_conn("get_by_reference_image_url", |conn| {
            conn.query_row(
                "SELECT layout_id, layout_prefix, reference_image_url, machine_structure_json
                 FROM layouts WHERE reference_image_url = ?1 LIMIT 1",
                params![reference_image_url],
                Self::row_to_layout,
            )
            .optional()
        })
    }

    async fn put(&self, layout: &LayoutMetadata) -> Result<()> {
        let structure_json = serde_json::to_string(&layout.machine_structure)?;
        self.with_conn("put_layout", |conn| {
            conn.execute(
                "INSERT INTO layouts (layout_id, layout_prefix, reference_image_url, machine_structure_json)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(layout_id, layout_prefix) DO UPDATE SET
                    reference_image_url = excluded.reference_image_url,
                    machine_structure_json = excluded.machine_structure_json",
                params![
                    layout.layout_id,
                    layout.layout_prefix,
                    layout.reference_image_url,
                    structure_json,
                ],
            )?;
            Ok(())
        })
    }
}

impl SqliteRowStore {
    fn row_to_layout(row: &rusqlite::Row) -> rusqlite::Result<LayoutMetadata> {
        let structure_json: String = row.get(3)?;
        let machine_structure: MachineStructure = serde_json::from_str(&structure_json)
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
            })?;
        Ok(LayoutMetadata {
            layout_id: row.get(0)?,
            layout_prefix: row.get(1)?,
            reference_image_url: row.get(2)?,
            machine_structure,
        })
    }
}

fn parse_rfc3339(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::{DiscrepancyBreakdown, VerificationOutcome};

    fn default_context_for_tests(verification_id: &str, now: DateTime<Utc>) -> VerificationContext {
        VerificationContext {
            verification_id: verification_id.to_string(),
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

    fn summary() -> VerificationSummary {
        VerificationSummary {
            verification_outcome: VerificationOutcome::Correct,
            total_positions_checked: 10,
            correct_positions: 10,
            discrepant_positions: 0,
            empty_in_checking: 0,
            discrepancy_breakdown: DiscrepancyBreakdown::default(),
            overall_accuracy: "100%".to_string(),
            overall_confidence: "high".to_string(),
            comparison_summary: "match".to_string(),
        }
    }

    #[tokio::test]
    async fn create_initial_is_idempotent_on_replay() {
        let store = SqliteRowStore::in_memory().unwrap();
        let context = default_context_for_tests("verif-20250101000000-aaaa", Utc::now());

        let first = store.create_initial(&context).await.unwrap();
        let second = store.create_initial(&context).await.unwrap();

        assert_eq!(first, CreateOutcome::Created);
        assert_eq!(second, CreateOutcome::AlreadyExists);
    }

    #[tokio::test]
    async fn finalize_is_a_no_op_once_terminal() {
        let store = SqliteRowStore::in_memory().unwrap();
        let mut context = default_context_for_tests("verif-20250101000000-bbbb", Utc::now());
        store.create_initial(&context).await.unwrap();

        context.current_status = "COMPLETED".to_string();
        let first = store
            .finalize(&context, &summary(), &[])
            .await
            .unwrap();
        let second = store
            .finalize(&context, &summary(), &[])
            .await
            .unwrap();

        assert_eq!(first, FinalizeOutcome::Finalized);
        assert_eq!(second, FinalizeOutcome::AlreadyFinalized);
    }

    #[tokio::test]
    async fn get_returns_the_persisted_context() {
        let store = SqliteRowStore::in_memory().unwrap();
        let context = default_context_for_tests("verif-20250101000000-cccc", Utc::now());
        store.create_initial(&context).await.unwrap();

        let fetched = store.get("verif-20250101000000-cccc").await.unwrap();
        assert_eq!(fetched.unwrap().verification_id, context.verification_id);
    }

    #[tokio::test]
    async fn conversation_turns_round_trip_token_usage() {
        let store = SqliteRowStore::in_memory().unwrap();
        let entry = ConversationTurnEntry {
            verification_id: "verif-20250101000000-dddd".to_string(),
            turn_id: 1,
            raw_response_bucket: "state".to_string(),
            raw_response_key: "responses/turn1-raw.json".to_string(),
            processed_bucket: "state".to_string(),
            processed_key: "responses/turn1-processed.json".to_string(),
            usage: TokenUsage {
                input_tokens: 100,
                output_tokens: 50,
                thinking_tokens: 10,
            },
            provider_request_id: "req-1".to_string(),
            created_at: Utc::now(),
        };
        store.put_turn(&entry).await.unwrap();

        let turns = store.get_turns("verif-20250101000000-dddd").await.unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].usage.total(), 160);
    }

    #[tokio::test]
    async fn layout_lookup_by_reference_image_url() {
        let store = SqliteRowStore::in_memory().unwrap();
        let layout = LayoutMetadata {
            layout_id: 1,
            layout_prefix: "VM-1".to_string(),
            reference_image_url: Some("s3://ref/layout.jpg".to_string()),
            machine_structure: MachineStructure {
                row_count: 4,
                columns_per_row: 6,
                row_order: vec!["A".into(), "B".into(), "C".into(), "D".into()],
                column_order: (1..=6).map(|n| n.to_string()).collect(),
            },
        };
        store.put(&layout).await.unwrap();

        let found = store
            .get_by_reference_image_url("s3://ref/layout.jpg")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.layout_id, 1);
        assert_eq!(found.machine_structure.row_count, 4);
    }
}

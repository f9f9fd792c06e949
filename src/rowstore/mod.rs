//! Row-store ports: the two durable row tables named in spec §3/§6
//! (verification rows, conversation rows) plus the layout-metadata lookup
//! used by the layout-vs-checking verification type. `schema` holds the
//! reference SQLite DDL; `sqlite_store` implements the traits below against
//! it.

mod schema;
mod sqlite_store;

pub use schema::SCHEMA_VERSION;
pub use sqlite_store::SqliteRowStore;

use crate::envelope::VerificationContext;
use crate::error::Result;
use crate::llm::TokenUsage;
use crate::results::{Discrepancy, MachineStructure, VerificationSummary};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Result of a conditional verification-row creation (spec §4.2's
/// `ConditionalCheckFailed`-style idempotent write).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

/// Result of a conditional finalization write (spec §4.9/§4.10).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeOutcome {
    Finalized,
    AlreadyFinalized,
}

/// The status-tracking view of one conversation (spec §6's `conversations`
/// table: primary key `(verificationId, conversationAt)`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationRow {
    pub verification_id: String,
    pub conversation_at: DateTime<Utc>,
    pub current_turn: u32,
    pub turn_status: String,
}

/// The artifact/usage-detail view of one turn (spec §3's `ConversationTurn`
/// entity: primary key `(verificationId, turnId)`). Modeled separately from
/// [`ConversationRow`] because the two primary keys diverge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurnEntry {
    pub verification_id: String,
    pub turn_id: u32,
    pub raw_response_bucket: String,
    pub raw_response_key: String,
    pub processed_bucket: String,
    pub processed_key: String,
    pub usage: TokenUsage,
    pub provider_request_id: String,
    pub created_at: DateTime<Utc>,
}

/// Layout metadata, looked up by reference image URL (spec §4.3's
/// `ReferenceImageIndex`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutMetadata {
    pub layout_id: i64,
    pub layout_prefix: String,
    pub reference_image_url: Option<String>,
    pub machine_structure: MachineStructure,
}

/// The verification-row store (spec §6's `verifications` table).
#[async_trait]
pub trait VerificationRowStore: Send + Sync {
    /// Conditionally create the row for a new verification. Returns
    /// [`CreateOutcome::AlreadyExists`] instead of erroring when the same
    /// `(verification_id, verification_at)` pair was already written,
    /// satisfying the idempotent-replay invariant (spec §8).
    async fn create_initial(&self, context: &VerificationContext) -> Result<CreateOutcome>;

    /// Overwrite the row with the current in-memory context (status
    /// transitions, error tracking, processing metrics).
    async fn update(&self, context: &VerificationContext) -> Result<()>;

    /// Conditionally write the terminal summary and discrepancies. A
    /// verification already in a terminal status is left untouched and
    /// reported as [`FinalizeOutcome::AlreadyFinalized`] (spec §4.9).
    async fn finalize(
        &self,
        context: &VerificationContext,
        summary: &VerificationSummary,
        discrepancies: &[Discrepancy],
    ) -> Result<FinalizeOutcome>;

    async fn get(&self, verification_id: &str) -> Result<Option<VerificationContext>>;

    /// Verifications against the same reference image, most recent first —
    /// used by `FetchHistoricalContext` to locate the prior verification
    /// (spec §4.3).
    async fn find_by_reference_image_url(
        &self,
        reference_image_url: &str,
    ) -> Result<Vec<VerificationContext>>;
}

/// The conversation-row store (spec §6's `conversations` and per-turn
/// tables).
#[async_trait]
pub trait ConversationRowStore: Send + Sync {
    async fn put_conversation(&self, row: &ConversationRow) -> Result<()>;

    async fn put_turn(&self, entry: &ConversationTurnEntry) -> Result<()>;

    async fn get_turns(&self, verification_id: &str) -> Result<Vec<ConversationTurnEntry>>;
}

/// The layout-metadata store (spec §4.3).
#[async_trait]
pub trait LayoutStore: Send + Sync {
    async fn get_by_reference_image_url(
        &self,
        reference_image_url: &str,
    ) -> Result<Option<LayoutMetadata>>;

    async fn put(&self, layout: &LayoutMetadata) -> Result<()>;
}

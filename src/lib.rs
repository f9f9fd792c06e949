//! # vm-verify-core
//!
//! An LLM-orchestrated vending-machine image verification workflow: a
//! seven-stage state machine (`Initialize` → `FetchHistoricalContext`? →
//! `FetchImages` → `PrepareSystemPrompt` → `ExecuteTurn1` → `ExecuteTurn2` →
//! `FinalizeAndStoreResults`, with any stage's exhausted retry budget
//! routing to `FinalizeWithError`) driven by [`workflow::WorkflowEngine`].
//!
//! Stages exchange only [`envelope::Envelope`]s — references to externally
//! stored artifacts, never payload bodies — against three collaborator
//! ports: a [`blob::BlobStore`], the [`rowstore`] row stores, and an
//! [`llm::LLMClient`].

pub mod blob;
pub mod config;
pub mod envelope;
pub mod error;
pub mod ids;
pub mod llm;
pub mod parsing;
pub mod results;
pub mod rowstore;
pub mod templates;
pub mod workflow;

pub use blob::{BlobStore, InMemoryBlobStore};
pub use config::WorkflowConfig;
pub use envelope::{
    ArtifactKind, Envelope, ErrorTracking, ProcessingMetrics, Reference, StatusHistoryEntry,
    TypeCapabilities, VerificationContext, VerificationRequest, VerificationType,
};
pub use error::{Error, Result, RetryStrategy, Severity};
pub use ids::{generate_verification_id, parse_embedded_timestamp};
pub use llm::{
    AnthropicClient, ChatMessage, ChatRole, ClientConfig, CompletionRequest, CompletionResponse,
    ContentBlock, ImageFormat, LLMClient, ModelSpec, Provider, StopReason, ThinkingConfig,
    TokenUsage,
};
pub use parsing::{parse_turn1_response, parse_turn2_response};
pub use results::{
    Discrepancy, DiscrepancyBreakdown, DiscrepancyType, MachineStructure, RowStatusMap,
    Turn1ProcessedData, Turn2ProcessedData, VerificationOutcome, VerificationSummary,
};
pub use rowstore::{
    ConversationRow, ConversationRowStore, ConversationTurnEntry, CreateOutcome, FinalizeOutcome,
    LayoutMetadata, LayoutStore, SqliteRowStore, VerificationRowStore,
};
pub use templates::{CompleteSystemPrompt, RenderedPrompt, TemplateCatalog, TemplateEngine, ThinkingSpec};
pub use workflow::WorkflowEngine;

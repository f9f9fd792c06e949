//! The workflow state machine (spec §2, §4.1): S0 Initialize → S1?
//! FetchHistoricalContext → S2 FetchImages → S3 PrepareSystemPrompt →
//! S4 ExecuteTurn1 → S5 ExecuteTurn2 → S6 FinalizeAndStoreResults, with any
//! stage's exhausted retry budget routing to E FinalizeWithError.
//!
//! [`WorkflowEngine`] bundles the collaborator ports (blob store, row
//! stores, LLM client, template engine) the stages are grounded against.
//! [`WorkflowEngine::run`] drives one verification request through to a
//! terminal envelope and never itself returns an error — per spec §4.10,
//! the error-finalization path must never throw.

pub mod finalize;
pub mod finalize_error;
pub mod fetch_images;
pub mod historical_context;
pub mod initialize;
pub mod system_prompt;
pub mod turn1;
pub mod turn2;
pub mod turn_common;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;

use crate::blob::BlobStore;
use crate::config::WorkflowConfig;
use crate::envelope::{Envelope, VerificationContext, VerificationRequest, VerificationType};
use crate::error::{Error, Result, RetryStrategy};
use crate::ids::generate_verification_id;
use crate::llm::LLMClient;
use crate::rowstore::{ConversationRowStore, LayoutStore, VerificationRowStore};
use crate::templates::TemplateEngine;

/// The collaborator ports one verification run is executed against.
pub struct WorkflowEngine {
    pub config: WorkflowConfig,
    pub blobs: Arc<dyn BlobStore>,
    pub verifications: Arc<dyn VerificationRowStore>,
    pub conversations: Arc<dyn ConversationRowStore>,
    pub layouts: Arc<dyn LayoutStore>,
    pub llm: Arc<dyn LLMClient>,
    pub templates: Arc<dyn TemplateEngine>,
}

impl WorkflowEngine {
    pub fn new(
        config: WorkflowConfig,
        blobs: Arc<dyn BlobStore>,
        verifications: Arc<dyn VerificationRowStore>,
        conversations: Arc<dyn ConversationRowStore>,
        layouts: Arc<dyn LayoutStore>,
        llm: Arc<dyn LLMClient>,
        templates: Arc<dyn TemplateEngine>,
    ) -> Self {
        Self {
            config,
            blobs,
            verifications,
            conversations,
            layouts,
            llm,
            templates,
        }
    }

    /// Run a verification request to a terminal envelope (spec §4.1).
    ///
    /// Every stage is attempted under [`run_with_retry`] and, on retry
    /// exhaustion, control falls through to [`finalize_error::run`] —
    /// mirroring the orchestrator's catch-all transition in spec §4.1.
    pub async fn run(&self, request: VerificationRequest) -> Envelope {
        let now = Utc::now();
        let verification_id = generate_verification_id(now);

        let (mut context, mut envelope) = match run_with_retry(|_attempt| {
            initialize::run(self, &verification_id, now, &request)
        })
        .await
        {
            Ok(pair) => pair,
            Err(e) => return finalize_error::run(self, &verification_id, None, None, e).await,
        };

        if context.verification_type == VerificationType::PreviousVsCurrent {
            if let Err(e) = run_with_retry(|_attempt| {
                historical_context::run(self, &mut context, &mut envelope)
            })
            .await
            {
                return finalize_error::run(self, &verification_id, Some(context), Some(envelope), e).await;
            }
        }

        if let Err(e) =
            run_with_retry(|_attempt| fetch_images::run(self, &mut context, &mut envelope)).await
        {
            return finalize_error::run(self, &verification_id, Some(context), Some(envelope), e).await;
        }

        if let Err(e) =
            run_with_retry(|_attempt| system_prompt::run(self, &mut context, &mut envelope)).await
        {
            return finalize_error::run(self, &verification_id, Some(context), Some(envelope), e).await;
        }

        if let Err(e) =
            run_with_retry(|_attempt| turn1::run(self, &mut context, &mut envelope)).await
        {
            return finalize_error::run(self, &verification_id, Some(context), Some(envelope), e).await;
        }

        if let Err(e) =
            run_with_retry(|_attempt| turn2::run(self, &mut context, &mut envelope)).await
        {
            return finalize_error::run(self, &verification_id, Some(context), Some(envelope), e).await;
        }

        if let Err(e) =
            run_with_retry(|_attempt| finalize::run(self, &mut context, &mut envelope)).await
        {
            return finalize_error::run(self, &verification_id, Some(context), Some(envelope), e).await;
        }

        envelope
    }
}

/// Drive `f` until it succeeds or its error's [`RetryStrategy`] is
/// exhausted (spec §4.1's per-stage attempt table, §7's taxonomy).
///
/// The strategy is read off the *first* error `f` produces; every
/// taxonomy kind maps to exactly one strategy (see
/// [`Error::retry_strategy`]), so re-deriving it per attempt is
/// equivalent and simpler than threading it through the loop.
pub async fn run_with_retry<F, Fut, T>(mut f: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match f(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                let strategy = e.retry_strategy();
                if attempt + 1 >= strategy.max_attempts() {
                    return Err(e);
                }
                tokio::time::sleep(backoff_delay(strategy, attempt)).await;
                attempt += 1;
            }
        }
    }
}

/// Backoff delay for attempt `attempt` (0-indexed) under `strategy`.
/// Exponential doubles from a 1s base; jittered adds up to 50% random
/// jitter on top of the same exponential curve (spec §4.1/§5).
fn backoff_delay(strategy: RetryStrategy, attempt: u32) -> Duration {
    match strategy {
        RetryStrategy::None => Duration::ZERO,
        RetryStrategy::Exponential { .. } => Duration::from_secs(1 << attempt.min(5)),
        RetryStrategy::Jittered { .. } => {
            let base = 1u64 << attempt.min(5);
            let jitter_ms = rand::thread_rng().gen_range(0..=(base * 500));
            Duration::from_millis(base * 1000 + jitter_ms)
        }
    }
}

/// Shared helper: append an `idempotent-skip` status-history entry when a
/// stage is re-invoked and its output references are already present
/// (spec §8's idempotent-replay law).
pub(crate) fn record_idempotent_skip(
    context: &mut VerificationContext,
    function_name: &str,
    stage: &str,
) {
    use crate::envelope::StatusHistoryEntry;
    context.record_status(StatusHistoryEntry::new(
        "IDEMPOTENT_SKIP",
        Utc::now(),
        function_name,
        0,
        stage,
    ));
}

/// Classify an I/O-style error surfaced while loading concurrently-fetched
/// context (spec §4.8 sub-phase 2): the first failure wins and siblings
/// are dropped by virtue of `JoinSet` cancellation on `abort_all`.
pub(crate) fn context_load_error(component: &str, operation: &str, source: Error) -> Error {
    match source {
        Error::Validation { .. } | Error::ResourceValidation { .. } => source,
        other => Error::context_load(component, operation, other.to_string()),
    }
}

/// Parse the `s3://bucket/key` URL convention used throughout the workflow
/// for blob references (spec §6).
pub(crate) fn parse_blob_url(component: &str, url: &str) -> Result<(String, String)> {
    let rest = url
        .strip_prefix("s3://")
        .ok_or_else(|| Error::validation(component, "parse_url", format!("not an s3:// url: {url}")))?;
    let (bucket, key) = rest
        .split_once('/')
        .ok_or_else(|| Error::validation(component, "parse_url", format!("missing key in url: {url}")))?;
    Ok((bucket.to_string(), key.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn run_with_retry_stops_once_strategy_is_exhausted() {
        let attempts = AtomicU32::new(0);
        let result: Result<()> = run_with_retry(|_attempt| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::llm_server("Test", "op", "503")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 4); // 1 initial + 3 retries
    }

    #[tokio::test]
    async fn run_with_retry_returns_first_success() {
        let attempts = AtomicU32::new(0);
        let result = run_with_retry(|_attempt| {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Error::llm_throttling("Test", "op", "429"))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_error_stops_after_one_attempt() {
        let attempts = AtomicU32::new(0);
        let result: Result<()> = run_with_retry(|_attempt| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::validation("Test", "op", "bad input")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}

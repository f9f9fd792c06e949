//! Error taxonomy for the verification workflow (spec §7).
//!
//! Every stage converts whatever it catches (provider errors, I/O errors,
//! row-store conflicts) into one of these variants before returning. The
//! variant alone determines the orchestrator's retry policy via
//! [`Error::retry_strategy`]; stages never need to interpret the message.

use thiserror::Error;

/// Result type alias using the workflow's [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

/// How the orchestrator should respond to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    /// Do not retry; route straight to `FinalizeWithError`.
    None,
    /// Retry with exponential backoff, up to `max_retries`.
    Exponential { max_retries: u32 },
    /// Retry with jittered backoff, up to `max_retries`.
    Jittered { max_retries: u32 },
}

impl RetryStrategy {
    /// Whether at least one retry is permitted under this strategy.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, RetryStrategy::None)
    }

    /// The maximum number of attempts (including the first), or 1 if not retryable.
    pub fn max_attempts(&self) -> u32 {
        match self {
            RetryStrategy::None => 1,
            RetryStrategy::Exponential { max_retries } | RetryStrategy::Jittered { max_retries } => {
                max_retries + 1
            }
        }
    }
}

/// Severity used for observability and alert routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

/// Errors that can occur while running a verification.
///
/// Variant names are the semantic taxonomy from spec §7, not a literal
/// mirror of any upstream SDK's error type. Every taxonomy variant (the
/// ten below with a `component`/`operation` pair) also carries
/// `recovery_hints`/`context` so the error finalization path (spec §4.10)
/// can attach `{severity, suggestions[], recoveryHints[], context{}}` to
/// the persisted error record without reconstructing it from the message
/// string.
#[derive(Error, Debug)]
pub enum Error {
    /// Input schema violation, missing required field, or wrong
    /// verification-type-specific field.
    #[error("validation error in {component}.{operation}: {message}")]
    Validation {
        component: String,
        operation: String,
        message: String,
        recovery_hints: Vec<String>,
        context: serde_json::Map<String, serde_json::Value>,
    },

    /// A referenced bucket, object, or secondary index does not exist.
    #[error("resource validation error in {component}.{operation}: {message}")]
    ResourceValidation {
        component: String,
        operation: String,
        message: String,
        recovery_hints: Vec<String>,
        context: serde_json::Map<String, serde_json::Value>,
    },

    /// Transient blob-store read failure during concurrent context loading.
    #[error("context load error in {component}.{operation}: {message}")]
    ContextLoad {
        component: String,
        operation: String,
        message: String,
        recovery_hints: Vec<String>,
        context: serde_json::Map<String, serde_json::Value>,
    },

    /// Template missing, or rendered with an unbound variable.
    #[error("template processing error in {component}.{operation}: {message}")]
    TemplateProcessing {
        component: String,
        operation: String,
        message: String,
        recovery_hints: Vec<String>,
        context: serde_json::Map<String, serde_json::Value>,
    },

    /// Transient 5xx-class error from the LLM provider.
    #[error("LLM server error in {component}.{operation}: {message}")]
    LlmServer {
        component: String,
        operation: String,
        message: String,
        recovery_hints: Vec<String>,
        context: serde_json::Map<String, serde_json::Value>,
    },

    /// Rate-limit signal from the LLM provider.
    #[error("LLM throttling error in {component}.{operation}: {message}")]
    LlmThrottling {
        component: String,
        operation: String,
        message: String,
        recovery_hints: Vec<String>,
        context: serde_json::Map<String, serde_json::Value>,
    },

    /// Schema/temperature/thinking violation, oversize image/prompt, or
    /// other permanent rejection by the LLM provider.
    #[error("LLM validation error in {component}.{operation}: {message}")]
    LlmValidation {
        component: String,
        operation: String,
        message: String,
        suggestions: Vec<String>,
        recovery_hints: Vec<String>,
        context: serde_json::Map<String, serde_json::Value>,
    },

    /// Blob or row write failed.
    #[error("storage error in {component}.{operation}: {message}")]
    Storage {
        component: String,
        operation: String,
        message: String,
        recovery_hints: Vec<String>,
        context: serde_json::Map<String, serde_json::Value>,
    },

    /// Deadline exceeded for a sub-phase, stage, or LLM call.
    #[error("timeout after {duration_ms}ms in {component}.{operation}")]
    Timeout {
        component: String,
        operation: String,
        duration_ms: u64,
        recovery_hints: Vec<String>,
        context: serde_json::Map<String, serde_json::Value>,
    },

    /// Unclassified error, mapped to a low-cap exponential retry.
    #[error("internal error in {component}.{operation}: {message}")]
    Internal {
        component: String,
        operation: String,
        message: String,
        recovery_hints: Vec<String>,
        context: serde_json::Map<String, serde_json::Value>,
    },

    /// Serialization/deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration is invalid or incomplete.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// The retry policy spec §7 assigns to this error's taxonomy kind.
    pub fn retry_strategy(&self) -> RetryStrategy {
        match self {
            Error::Validation { .. }
            | Error::ResourceValidation { .. }
            | Error::TemplateProcessing { .. }
            | Error::LlmValidation { .. }
            | Error::Config(_) => RetryStrategy::None,
            Error::ContextLoad { .. } | Error::LlmServer { .. } | Error::Storage { .. } => {
                RetryStrategy::Exponential { max_retries: 3 }
            }
            Error::LlmThrottling { .. } => RetryStrategy::Jittered { max_retries: 5 },
            Error::Timeout { .. } => RetryStrategy::Exponential { max_retries: 3 },
            Error::Internal { .. } => RetryStrategy::Exponential { max_retries: 2 },
            Error::Serialization(_) => RetryStrategy::None,
        }
    }

    /// Severity for observability.
    pub fn severity(&self) -> Severity {
        match self {
            Error::Validation { .. } | Error::LlmValidation { .. } => Severity::Warning,
            Error::ResourceValidation { .. } | Error::TemplateProcessing { .. } => Severity::Error,
            Error::ContextLoad { .. }
            | Error::LlmServer { .. }
            | Error::LlmThrottling { .. }
            | Error::Timeout { .. } => Severity::Warning,
            Error::Storage { .. } | Error::Internal { .. } => Severity::Critical,
            Error::Serialization(_) | Error::Config(_) => Severity::Error,
        }
    }

    /// The `{component}.{operation}` pair this error was raised from, if any.
    pub fn component_operation(&self) -> Option<(&str, &str)> {
        match self {
            Error::Validation { component, operation, .. }
            | Error::ResourceValidation { component, operation, .. }
            | Error::ContextLoad { component, operation, .. }
            | Error::TemplateProcessing { component, operation, .. }
            | Error::LlmServer { component, operation, .. }
            | Error::LlmThrottling { component, operation, .. }
            | Error::LlmValidation { component, operation, .. }
            | Error::Storage { component, operation, .. }
            | Error::Timeout { component, operation, .. }
            | Error::Internal { component, operation, .. } => Some((component, operation)),
            Error::Serialization(_) | Error::Config(_) => None,
        }
    }

    /// Permanent-rejection suggestions (spec §7's `suggestions[]`); only
    /// ever populated on [`Error::LlmValidation`].
    pub fn suggestions(&self) -> Vec<String> {
        match self {
            Error::LlmValidation { suggestions, .. } => suggestions.clone(),
            _ => Vec::new(),
        }
    }

    /// Operator-facing next steps (spec §7's `recoveryHints[]`). Empty for
    /// [`Error::Serialization`]/[`Error::Config`], which carry no
    /// `component`/`operation` pair to hang a hint off of.
    pub fn recovery_hints(&self) -> Vec<String> {
        match self {
            Error::Validation { recovery_hints, .. }
            | Error::ResourceValidation { recovery_hints, .. }
            | Error::ContextLoad { recovery_hints, .. }
            | Error::TemplateProcessing { recovery_hints, .. }
            | Error::LlmServer { recovery_hints, .. }
            | Error::LlmThrottling { recovery_hints, .. }
            | Error::LlmValidation { recovery_hints, .. }
            | Error::Storage { recovery_hints, .. }
            | Error::Timeout { recovery_hints, .. }
            | Error::Internal { recovery_hints, .. } => recovery_hints.clone(),
            Error::Serialization(_) | Error::Config(_) => Vec::new(),
        }
    }

    /// Structured diagnostic context (spec §7's `context{}`) attached at
    /// the point the error was raised, e.g. a bucket/key or a request id.
    pub fn context(&self) -> serde_json::Map<String, serde_json::Value> {
        match self {
            Error::Validation { context, .. }
            | Error::ResourceValidation { context, .. }
            | Error::ContextLoad { context, .. }
            | Error::TemplateProcessing { context, .. }
            | Error::LlmServer { context, .. }
            | Error::LlmThrottling { context, .. }
            | Error::LlmValidation { context, .. }
            | Error::Storage { context, .. }
            | Error::Timeout { context, .. }
            | Error::Internal { context, .. } => context.clone(),
            Error::Serialization(_) | Error::Config(_) => serde_json::Map::new(),
        }
    }

    /// Attach one recovery hint, replacing any constructor default.
    pub fn with_recovery_hint(mut self, hint: impl Into<String>) -> Self {
        let hint = hint.into();
        match &mut self {
            Error::Validation { recovery_hints, .. }
            | Error::ResourceValidation { recovery_hints, .. }
            | Error::ContextLoad { recovery_hints, .. }
            | Error::TemplateProcessing { recovery_hints, .. }
            | Error::LlmServer { recovery_hints, .. }
            | Error::LlmThrottling { recovery_hints, .. }
            | Error::LlmValidation { recovery_hints, .. }
            | Error::Storage { recovery_hints, .. }
            | Error::Timeout { recovery_hints, .. }
            | Error::Internal { recovery_hints, .. } => recovery_hints.push(hint),
            Error::Serialization(_) | Error::Config(_) => {}
        }
        self
    }

    /// Attach one structured context entry.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        match &mut self {
            Error::Validation { context, .. }
            | Error::ResourceValidation { context, .. }
            | Error::ContextLoad { context, .. }
            | Error::TemplateProcessing { context, .. }
            | Error::LlmServer { context, .. }
            | Error::LlmThrottling { context, .. }
            | Error::LlmValidation { context, .. }
            | Error::Storage { context, .. }
            | Error::Timeout { context, .. }
            | Error::Internal { context, .. } => {
                context.insert(key.into(), value.into());
            }
            Error::Serialization(_) | Error::Config(_) => {}
        }
        self
    }

    pub fn validation(
        component: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Validation {
            component: component.into(),
            operation: operation.into(),
            message: message.into(),
            recovery_hints: Vec::new(),
            context: serde_json::Map::new(),
        }
    }

    pub fn resource_validation(
        component: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::ResourceValidation {
            component: component.into(),
            operation: operation.into(),
            message: message.into(),
            recovery_hints: Vec::new(),
            context: serde_json::Map::new(),
        }
    }

    pub fn context_load(
        component: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::ContextLoad {
            component: component.into(),
            operation: operation.into(),
            message: message.into(),
            recovery_hints: Vec::new(),
            context: serde_json::Map::new(),
        }
    }

    pub fn template_processing(
        component: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::TemplateProcessing {
            component: component.into(),
            operation: operation.into(),
            message: message.into(),
            recovery_hints: Vec::new(),
            context: serde_json::Map::new(),
        }
    }

    pub fn llm_server(
        component: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::LlmServer {
            component: component.into(),
            operation: operation.into(),
            message: message.into(),
            recovery_hints: Vec::new(),
            context: serde_json::Map::new(),
        }
    }

    pub fn llm_throttling(
        component: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::LlmThrottling {
            component: component.into(),
            operation: operation.into(),
            message: message.into(),
            recovery_hints: vec!["retry after the provider's rate limit window elapses".to_string()],
            context: serde_json::Map::new(),
        }
    }

    pub fn llm_validation(
        component: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::LlmValidation {
            component: component.into(),
            operation: operation.into(),
            message: message.into(),
            suggestions: Vec::new(),
            recovery_hints: Vec::new(),
            context: serde_json::Map::new(),
        }
    }

    pub fn llm_validation_with_hint(
        component: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::LlmValidation {
            component: component.into(),
            operation: operation.into(),
            message: message.into(),
            suggestions: vec![suggestion.into()],
            recovery_hints: Vec::new(),
            context: serde_json::Map::new(),
        }
    }

    pub fn storage(
        component: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Storage {
            component: component.into(),
            operation: operation.into(),
            message: message.into(),
            recovery_hints: Vec::new(),
            context: serde_json::Map::new(),
        }
    }

    pub fn timeout(component: impl Into<String>, operation: impl Into<String>, duration_ms: u64) -> Self {
        Self::Timeout {
            component: component.into(),
            operation: operation.into(),
            duration_ms,
            recovery_hints: vec!["increase the stage timeout or retry".to_string()],
            context: serde_json::Map::new(),
        }
    }

    pub fn internal(
        component: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Internal {
            component: component.into(),
            operation: operation.into(),
            message: message.into(),
            recovery_hints: Vec::new(),
            context: serde_json::Map::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_not_retryable() {
        let err = Error::validation("FetchImages", "validate_url", "bad url");
        assert_eq!(err.retry_strategy(), RetryStrategy::None);
        assert!(!err.retry_strategy().is_retryable());
    }

    #[test]
    fn throttling_uses_jittered_backoff_with_five_retries() {
        let err = Error::llm_throttling("ExecuteTurn1", "invoke", "429");
        assert_eq!(
            err.retry_strategy(),
            RetryStrategy::Jittered { max_retries: 5 }
        );
        assert_eq!(err.retry_strategy().max_attempts(), 6);
        assert!(!err.recovery_hints().is_empty());
    }

    #[test]
    fn server_error_uses_exponential_backoff_with_three_retries() {
        let err = Error::llm_server("ExecuteTurn2", "invoke", "503");
        assert_eq!(
            err.retry_strategy(),
            RetryStrategy::Exponential { max_retries: 3 }
        );
    }

    #[test]
    fn component_operation_is_recoverable_from_taxonomy_errors() {
        let err = Error::storage("FinalizeAndStoreResults", "write_artifact", "disk full");
        assert_eq!(
            err.component_operation(),
            Some(("FinalizeAndStoreResults", "write_artifact"))
        );
    }

    #[test]
    fn with_context_and_with_recovery_hint_attach_to_taxonomy_variants() {
        let err = Error::storage("FinalizeAndStoreResults", "write_artifact", "disk full")
            .with_recovery_hint("check available disk space")
            .with_context("bucket", "state-bucket");

        assert_eq!(err.recovery_hints(), vec!["check available disk space".to_string()]);
        assert_eq!(
            err.context().get("bucket").and_then(|v| v.as_str()),
            Some("state-bucket")
        );
    }

    #[test]
    fn config_and_serialization_errors_carry_no_recovery_hints_or_context() {
        let err = Error::Config("missing required env var".to_string());
        assert!(err.recovery_hints().is_empty());
        assert!(err.context().is_empty());
        assert!(err.component_operation().is_none());
    }
}

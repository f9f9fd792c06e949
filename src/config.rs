//! Workflow configuration (spec §6's configuration table), loaded from
//! environment-style key/value pairs and validated at construction time.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::time::Duration;

/// Thinking-mode toggle for the LLM request, mirrored from spec §9's
/// `BedrockConfig` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThinkingType {
    Enabled,
    Disabled,
}

impl ThinkingType {
    fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("enabled") {
            ThinkingType::Enabled
        } else {
            ThinkingType::Disabled
        }
    }
}

/// Centralized LLM request configuration (spec §9).
#[derive(Debug, Clone)]
pub struct LlmRequestConfig {
    pub anthropic_version: String,
    pub model_id: String,
    pub max_tokens: u32,
    pub budget_tokens: u32,
    pub thinking_type: ThinkingType,
    pub temperature: f64,
    pub top_p: f64,
}

impl LlmRequestConfig {
    /// Validate the `temperature ≥ 1.0 ⇒ thinking.type = enabled` rule and
    /// the `budget_tokens ≤ max_tokens` rule from spec §6/§9.
    pub fn validate(&self) -> Result<()> {
        if self.max_tokens == 0 || self.budget_tokens == 0 {
            return Err(Error::Config(
                "MAX_TOKENS and BUDGET_TOKENS must both be > 0".into(),
            ));
        }
        if self.budget_tokens > self.max_tokens {
            return Err(Error::Config(
                "BUDGET_TOKENS must be <= MAX_TOKENS".into(),
            ));
        }
        if self.temperature >= 1.0 && self.thinking_type != ThinkingType::Enabled {
            return Err(Error::Config(
                "TEMPERATURE = 1.0 requires THINKING_TYPE = enabled".into(),
            ));
        }
        Ok(())
    }
}

/// Image pipeline limits (spec §4.4).
#[derive(Debug, Clone, Copy)]
pub struct ImageLimits {
    pub max_image_size_bytes: u64,
    pub max_inline_base64_size_bytes: u64,
}

impl Default for ImageLimits {
    fn default() -> Self {
        Self {
            max_image_size_bytes: 100 * 1024 * 1024,
            max_inline_base64_size_bytes: 2 * 1024 * 1024,
        }
    }
}

/// Full workflow configuration, one field per row of spec §6's table.
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    pub state_bucket: String,
    pub reference_bucket: String,
    pub checking_bucket: String,
    pub temp_base64_bucket: Option<String>,
    pub llm: LlmRequestConfig,
    pub image_limits: ImageLimits,
    pub bedrock_timeout: Duration,
    pub function_timeout: Duration,
    pub blob_op_timeout: Duration,
    pub discrepancy_threshold: u32,
    pub template_base_path: String,
    pub date_partition_timezone: String,
}

impl WorkflowConfig {
    /// Construct from a map the way `std::env::vars()` would provide it.
    /// Missing optional keys fall back to the defaults named in spec §6.
    pub fn from_env_map(vars: &HashMap<String, String>) -> Result<Self> {
        let get = |key: &str| vars.get(key).cloned();
        let get_required = |key: &str| {
            get(key).ok_or_else(|| Error::Config(format!("missing required env var {key}")))
        };

        let max_tokens: u32 = get("MAX_TOKENS")
            .unwrap_or_else(|| "4096".to_string())
            .parse()
            .map_err(|_| Error::Config("MAX_TOKENS must be an integer".into()))?;
        let budget_tokens: u32 = get("BUDGET_TOKENS")
            .unwrap_or_else(|| "2048".to_string())
            .parse()
            .map_err(|_| Error::Config("BUDGET_TOKENS must be an integer".into()))?;
        let temperature: f64 = get("TEMPERATURE")
            .unwrap_or_else(|| "0.0".to_string())
            .parse()
            .map_err(|_| Error::Config("TEMPERATURE must be a float".into()))?;
        let top_p: f64 = get("TOP_P")
            .unwrap_or_else(|| "1.0".to_string())
            .parse()
            .map_err(|_| Error::Config("TOP_P must be a float".into()))?;
        let thinking_type = ThinkingType::parse(&get("THINKING_TYPE").unwrap_or_default());

        let max_image_size: u64 = get("MAX_IMAGE_SIZE")
            .map(|v| v.parse())
            .transpose()
            .map_err(|_| Error::Config("MAX_IMAGE_SIZE must be an integer".into()))?
            .unwrap_or(ImageLimits::default().max_image_size_bytes);
        let max_inline_base64: u64 = get("MAX_INLINE_BASE64_SIZE")
            .map(|v| v.parse())
            .transpose()
            .map_err(|_| Error::Config("MAX_INLINE_BASE64_SIZE must be an integer".into()))?
            .unwrap_or(ImageLimits::default().max_inline_base64_size_bytes);

        let bedrock_timeout_ms: u64 = get("BEDROCK_TIMEOUT")
            .unwrap_or_else(|| "120000".to_string())
            .parse()
            .map_err(|_| Error::Config("BEDROCK_TIMEOUT must be an integer".into()))?;
        let function_timeout_ms: u64 = get("FUNCTION_TIMEOUT")
            .unwrap_or_else(|| "120000".to_string())
            .parse()
            .map_err(|_| Error::Config("FUNCTION_TIMEOUT must be an integer".into()))?;

        let discrepancy_threshold: u32 = get("DISCREPANCY_THRESHOLD")
            .unwrap_or_else(|| "1".to_string())
            .parse()
            .map_err(|_| Error::Config("DISCREPANCY_THRESHOLD must be an integer".into()))?;

        let temp_base64_bucket = get("TEMP_BASE64_BUCKET");

        let config = Self {
            state_bucket: get_required("STATE_BUCKET")?,
            reference_bucket: get_required("REFERENCE_BUCKET")?,
            checking_bucket: get_required("CHECKING_BUCKET")?,
            temp_base64_bucket,
            llm: LlmRequestConfig {
                anthropic_version: get("ANTHROPIC_VERSION")
                    .unwrap_or_else(|| "2023-06-01".to_string()),
                model_id: get("BEDROCK_MODEL_ID")
                    .unwrap_or_else(|| "claude-3-5-sonnet-20241022".to_string()),
                max_tokens,
                budget_tokens,
                thinking_type,
                temperature,
                top_p,
            },
            image_limits: ImageLimits {
                max_image_size_bytes: max_image_size,
                max_inline_base64_size_bytes: max_inline_base64,
            },
            bedrock_timeout: Duration::from_millis(bedrock_timeout_ms),
            function_timeout: Duration::from_millis(function_timeout_ms),
            blob_op_timeout: Duration::from_secs(30),
            discrepancy_threshold,
            template_base_path: get("TEMPLATE_BASE_PATH").unwrap_or_else(|| "templates".to_string()),
            date_partition_timezone: get("DATE_PARTITION_TIMEZONE").unwrap_or_else(|| "UTC".to_string()),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field rules from spec §6.
    pub fn validate(&self) -> Result<()> {
        self.llm.validate()?;
        if self.image_limits.max_image_size_bytes > self.image_limits.max_inline_base64_size_bytes
            && self.temp_base64_bucket.is_none()
        {
            return Err(Error::Config(
                "TEMP_BASE64_BUCKET is required when images may exceed MAX_INLINE_BASE64_SIZE"
                    .into(),
            ));
        }
        Ok(())
    }

    /// A configuration suitable for tests: in-process buckets, no temp bucket needed.
    #[cfg(any(test, feature = "test-util"))]
    pub fn for_tests() -> Self {
        Self {
            state_bucket: "test-state".to_string(),
            reference_bucket: "test-reference".to_string(),
            checking_bucket: "test-checking".to_string(),
            temp_base64_bucket: Some("test-temp".to_string()),
            llm: LlmRequestConfig {
                anthropic_version: "2023-06-01".to_string(),
                model_id: "claude-3-5-sonnet-20241022".to_string(),
                max_tokens: 4096,
                budget_tokens: 2048,
                thinking_type: ThinkingType::Disabled,
                temperature: 0.0,
                top_p: 1.0,
            },
            image_limits: ImageLimits::default(),
            bedrock_timeout: Duration::from_secs(120),
            function_timeout: Duration::from_secs(120),
            blob_op_timeout: Duration::from_secs(30),
            discrepancy_threshold: 1,
            template_base_path: "templates".to_string(),
            date_partition_timezone: "UTC".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_vars() -> HashMap<String, String> {
        HashMap::from([
            ("STATE_BUCKET".to_string(), "state".to_string()),
            ("REFERENCE_BUCKET".to_string(), "ref".to_string()),
            ("CHECKING_BUCKET".to_string(), "chk".to_string()),
            ("TEMP_BASE64_BUCKET".to_string(), "temp".to_string()),
        ])
    }

    #[test]
    fn missing_required_var_is_a_config_error() {
        let vars = HashMap::new();
        let err = WorkflowConfig::from_env_map(&vars).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn defaults_fill_in_when_optional_vars_absent() {
        let config = WorkflowConfig::from_env_map(&base_vars()).unwrap();
        assert_eq!(config.llm.max_tokens, 4096);
        assert_eq!(
            config.image_limits.max_inline_base64_size_bytes,
            2 * 1024 * 1024
        );
    }

    #[test]
    fn budget_tokens_over_max_tokens_is_rejected() {
        let mut vars = base_vars();
        vars.insert("MAX_TOKENS".to_string(), "100".to_string());
        vars.insert("BUDGET_TOKENS".to_string(), "200".to_string());
        let err = WorkflowConfig::from_env_map(&vars).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn temperature_one_requires_thinking_enabled() {
        let mut vars = base_vars();
        vars.insert("TEMPERATURE".to_string(), "1.0".to_string());
        let err = WorkflowConfig::from_env_map(&vars).unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        vars.insert("THINKING_TYPE".to_string(), "enabled".to_string());
        assert!(WorkflowConfig::from_env_map(&vars).is_ok());
    }

    #[test]
    fn missing_temp_bucket_is_rejected_when_image_size_cap_exceeds_inline_cap() {
        let mut vars = base_vars();
        vars.remove("TEMP_BASE64_BUCKET");
        let err = WorkflowConfig::from_env_map(&vars).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn temp_bucket_is_not_required_once_the_inline_cap_covers_the_image_cap() {
        let mut vars = base_vars();
        vars.remove("TEMP_BASE64_BUCKET");
        vars.insert("MAX_INLINE_BASE64_SIZE".to_string(), (200 * 1024 * 1024).to_string());
        assert!(WorkflowConfig::from_env_map(&vars).is_ok());
    }
}

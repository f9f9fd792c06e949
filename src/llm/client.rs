//! LLM client trait and the Anthropic Messages API implementation used by
//! the Turn-1/Turn-2 stages (spec §4.6/§4.7).

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use crate::error::{Error, Result};

use super::types::{
    ChatRole, CompletionRequest, CompletionResponse, ImageFormat, StopReason, ThinkingConfig,
    TokenUsage,
};

/// An LLM client capable of running one multi-content-block completion.
#[async_trait]
pub trait LLMClient: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse>;
}

/// Configuration for [`AnthropicClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_key: String,
    pub base_url: Option<String>,
    pub timeout_secs: u64,
}

impl ClientConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: None,
            timeout_secs: 120,
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

fn build_http_client(timeout_secs: u64) -> Client {
    let timeout = Duration::from_secs(timeout_secs);

    // Some sandboxed environments can panic during proxy auto-detection in
    // reqwest's default client builder. Fall back to no-proxy in that case.
    match catch_unwind(AssertUnwindSafe(|| Client::builder().timeout(timeout).build())) {
        Ok(Ok(client)) => client,
        Ok(Err(_)) | Err(_) => Client::builder()
            .no_proxy()
            .timeout(timeout)
            .build()
            .expect("failed to create HTTP client"),
    }
}

/// Anthropic Claude client, generalized for multi-turn conversations whose
/// messages carry text and base64-encoded image content blocks.
pub struct AnthropicClient {
    config: ClientConfig,
    http: Client,
}

impl AnthropicClient {
    const DEFAULT_BASE_URL: &'static str = "https://api.anthropic.com";

    pub fn new(config: ClientConfig) -> Self {
        let http = build_http_client(config.timeout_secs);
        Self { config, http }
    }

    fn base_url(&self) -> &str {
        self.config
            .base_url
            .as_deref()
            .unwrap_or(Self::DEFAULT_BASE_URL)
    }
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<AnthropicMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking: Option<AnthropicThinking>,
}

#[derive(Debug, Serialize)]
struct AnthropicThinking {
    #[serde(rename = "type")]
    kind: &'static str,
    budget_tokens: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct AnthropicMessage {
    role: String,
    content: Vec<AnthropicContentBlock>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[allow(dead_code)]
enum AnthropicContentBlock {
    Text {
        text: String,
    },
    Image {
        source: AnthropicImageSource,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Serialize, Deserialize)]
struct AnthropicImageSource {
    #[serde(rename = "type")]
    kind: String,
    media_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    id: String,
    model: String,
    content: Vec<AnthropicResponseBlock>,
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicResponseBlock {
    Text { text: String },
    Thinking { thinking: String },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct AnthropicError {
    error: AnthropicErrorDetail,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorDetail {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
}

fn to_anthropic_message(msg: &super::types::ChatMessage) -> AnthropicMessage {
    AnthropicMessage {
        role: match msg.role {
            ChatRole::User => "user".to_string(),
            ChatRole::Assistant => "assistant".to_string(),
        },
        content: msg
            .content
            .iter()
            .map(|block| match block {
                super::types::ContentBlock::Text { text } => AnthropicContentBlock::Text {
                    text: text.clone(),
                },
                super::types::ContentBlock::Image { format, base64 } => {
                    AnthropicContentBlock::Image {
                        source: AnthropicImageSource {
                            kind: "base64".to_string(),
                            media_type: image_media_type(*format).to_string(),
                            data: base64.clone(),
                        },
                    }
                }
            })
            .collect(),
    }
}

fn image_media_type(format: ImageFormat) -> &'static str {
    format.mime_type()
}

#[async_trait]
impl LLMClient for AnthropicClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let messages: Vec<AnthropicMessage> =
            request.messages.iter().map(to_anthropic_message).collect();

        let api_request = AnthropicRequest {
            model: request.model.clone(),
            messages,
            max_tokens: request.max_tokens,
            system: request.system,
            temperature: request.temperature,
            top_p: request.top_p,
            thinking: request.thinking.map(|t| AnthropicThinking {
                kind: if t.enabled { "enabled" } else { "disabled" },
                budget_tokens: t.budget_tokens,
            }),
        };

        let url = format!("{}/v1/messages", self.base_url());

        let response = self
            .http
            .post(&url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", &request.anthropic_version)
            .header("content-type", "application/json")
            .json(&api_request)
            .send()
            .await
            .map_err(|e| Error::llm_server("AnthropicClient", "complete", e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::llm_server("AnthropicClient", "complete", e.to_string()))?;

        if !status.is_success() {
            let message = serde_json::from_str::<AnthropicError>(&body)
                .map(|e| e.error.message)
                .unwrap_or_else(|_| body.clone());

            return Err(if status.as_u16() == 429 {
                Error::llm_throttling("AnthropicClient", "complete", message)
            } else if status.is_server_error() {
                Error::llm_server("AnthropicClient", "complete", message)
            } else {
                Error::llm_validation("AnthropicClient", "complete", message)
            });
        }

        let api_response: AnthropicResponse = serde_json::from_str(&body)
            .map_err(|e| Error::llm_validation("AnthropicClient", "complete", e.to_string()))?;

        let mut content = String::new();
        let mut thinking: Option<String> = None;
        for block in &api_response.content {
            match block {
                AnthropicResponseBlock::Text { text } => content.push_str(text),
                AnthropicResponseBlock::Thinking { thinking: t } => {
                    thinking.get_or_insert_with(String::new).push_str(t);
                }
                AnthropicResponseBlock::Unknown => {}
            }
        }

        let stop_reason = api_response.stop_reason.as_deref().map(|r| match r {
            "end_turn" => StopReason::EndTurn,
            "max_tokens" => StopReason::MaxTokens,
            "stop_sequence" => StopReason::StopSequence,
            _ => StopReason::EndTurn,
        });

        let usage = TokenUsage {
            input_tokens: api_response.usage.input_tokens,
            output_tokens: api_response.usage.output_tokens,
            thinking_tokens: 0,
        };

        Ok(CompletionResponse {
            id: api_response.id,
            model: api_response.model,
            content,
            thinking,
            stop_reason,
            usage,
            timestamp: Utc::now(),
        })
    }
}

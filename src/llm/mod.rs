//! LLM client abstraction: a single managed Anthropic-compatible provider
//! used to run the Turn-1/Turn-2 completions (spec §4.6/§4.7).

mod client;
mod types;

pub use client::{AnthropicClient, ClientConfig, LLMClient};
pub use types::{
    ChatMessage, ChatRole, CompletionRequest, CompletionResponse, ContentBlock, ImageFormat,
    ModelSpec, Provider, StopReason, ThinkingConfig, TokenUsage,
};

//! The LLM provider abstraction.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::schema::LlmConfig;

use super::anthropic::AnthropicProvider;
use super::openai_compat::OpenAiCompatProvider;
use super::types::{ChatRequest, ChatResponse};

/// Result type for provider operations.
pub type Result<T> = std::result::Result<T, String>;

/// A tool-capable chat model.
///
/// Implementations translate the provider-agnostic block vocabulary
/// into their wire format and back.  A transport or API failure is a
/// turn-aborting error — it never becomes a tool result.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// One full (non-streaming) chat round-trip.
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse>;

    /// Provider id (e.g. `"anthropic"`).
    fn provider_name(&self) -> &str;
}

/// Build the configured provider.
///
/// `openai`, `gemini` and `codex` all speak the OpenAI-compatible chat
/// completions surface and differ only in base URL.
pub fn create_provider(config: &LlmConfig, api_key: String) -> Result<Arc<dyn LlmProvider>> {
    match config.provider.as_str() {
        "anthropic" => Ok(Arc::new(AnthropicProvider::new(
            api_key,
            config.request_timeout_secs,
        ))),
        "openai" => Ok(Arc::new(OpenAiCompatProvider::new(
            "openai",
            "https://api.openai.com/v1",
            api_key,
            config.request_timeout_secs,
        ))),
        "gemini" => Ok(Arc::new(OpenAiCompatProvider::new(
            "gemini",
            "https://generativelanguage.googleapis.com/v1beta/openai",
            api_key,
            config.request_timeout_secs,
        ))),
        "codex" => Ok(Arc::new(OpenAiCompatProvider::new(
            "codex",
            "https://api.openai.com/v1",
            api_key,
            config.request_timeout_secs,
        ))),
        other => Err(format!("unknown LLM provider '{other}'")),
    }
}

//! Anthropic Messages API provider.
//!
//! Translation notes:
//! - `tool_results` turns become `user` turns carrying `tool_result`
//!   blocks (the Messages API has no separate tool role).
//! - The wire vocabulary uses `tool_use` / `tool_use_id` where ours uses
//!   `tool_call` / `tool_call_id`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::provider::{LlmProvider, Result};
use super::types::{
    ChatRequest, ChatResponse, ContentBlock, ConversationTurn, StopReason, TurnContent, TurnRole,
};

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";

// ─── Wire types ───────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    max_tokens: u32,
    system: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: Vec<WireBlock>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

#[derive(Debug, Serialize)]
struct WireTool {
    name: String,
    description: String,
    input_schema: Value,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    content: Vec<WireBlock>,
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    error: WireErrorBody,
}

#[derive(Debug, Deserialize)]
struct WireErrorBody {
    message: String,
}

// ─── AnthropicProvider ────────────────────────────────────────────────────────

pub struct AnthropicProvider {
    client: Client,
    api_key: String,
}

impl AnthropicProvider {
    pub fn new(api_key: String, timeout_secs: u64) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_default();
        Self { client, api_key }
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse> {
        let wire = WireRequest {
            model: request.model.clone(),
            max_tokens: request.max_tokens,
            system: request.system.clone(),
            messages: request.messages.iter().map(turn_to_wire).collect(),
            tools: request
                .tools
                .iter()
                .map(|t| WireTool {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    input_schema: t.input_schema.clone(),
                })
                .collect(),
        };

        let response = self
            .client
            .post(API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&wire)
            .send()
            .await
            .map_err(|e| format!("anthropic request error: {e}"))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| format!("anthropic read error: {e}"))?;

        if !status.is_success() {
            let detail = serde_json::from_str::<WireError>(&body)
                .map(|e| e.error.message)
                .unwrap_or_else(|_| body.clone());
            return Err(format!("anthropic API error ({status}): {detail}"));
        }

        let wire: WireResponse = serde_json::from_str(&body)
            .map_err(|e| format!("anthropic parse error: {e}"))?;

        Ok(ChatResponse {
            stop_reason: parse_stop_reason(wire.stop_reason.as_deref()),
            content: wire.content.into_iter().map(wire_to_block).collect(),
        })
    }

    fn provider_name(&self) -> &str {
        "anthropic"
    }
}

// ─── Translation ──────────────────────────────────────────────────────────────

fn turn_to_wire(turn: &ConversationTurn) -> WireMessage {
    let role = match turn.role {
        TurnRole::Assistant => "assistant",
        // tool_results ride on a user message in the Messages API.
        TurnRole::User | TurnRole::ToolResults => "user",
    };
    let content = match &turn.content {
        TurnContent::Text(text) => vec![WireBlock::Text { text: text.clone() }],
        TurnContent::Blocks(blocks) => blocks.iter().map(block_to_wire).collect(),
    };
    WireMessage { role, content }
}

fn block_to_wire(block: &ContentBlock) -> WireBlock {
    match block {
        ContentBlock::Text { text } => WireBlock::Text { text: text.clone() },
        ContentBlock::ToolCall { id, name, input } => WireBlock::ToolUse {
            id: id.clone(),
            name: name.clone(),
            input: input.clone(),
        },
        ContentBlock::ToolResult {
            tool_call_id,
            content,
        } => WireBlock::ToolResult {
            tool_use_id: tool_call_id.clone(),
            content: content.clone(),
        },
    }
}

fn wire_to_block(block: WireBlock) -> ContentBlock {
    match block {
        WireBlock::Text { text } => ContentBlock::Text { text },
        WireBlock::ToolUse { id, name, input } => ContentBlock::ToolCall { id, name, input },
        WireBlock::ToolResult {
            tool_use_id,
            content,
        } => ContentBlock::ToolResult {
            tool_call_id: tool_use_id,
            content,
        },
    }
}

fn parse_stop_reason(raw: Option<&str>) -> StopReason {
    match raw {
        Some("tool_use") => StopReason::ToolUse,
        Some("max_tokens") => StopReason::MaxTokens,
        _ => StopReason::EndTurn,
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

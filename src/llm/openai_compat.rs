//! OpenAI-compatible chat completions provider.
//!
//! One implementation serves every vendor that speaks the chat
//! completions surface (OpenAI, Gemini's compatibility endpoint, Codex);
//! only the base URL differs.
//!
//! Translation notes:
//! - Our `tool_call` blocks become `tool_calls` entries with
//!   JSON-encoded `arguments`.
//! - `tool_results` turns become one `tool` role message per block.
//! - `finish_reason: "tool_calls"` maps to [`StopReason::ToolUse`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::provider::{LlmProvider, Result};
use super::types::{
    ChatRequest, ChatResponse, ContentBlock, ConversationTurn, StopReason, TurnContent, TurnRole,
};

// ─── Wire types ───────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<Value>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    arguments: String,
}

// ─── OpenAiCompatProvider ─────────────────────────────────────────────────────

pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    api_key: String,
    client: Client,
}

impl OpenAiCompatProvider {
    pub fn new(name: &str, base_url: &str, api_key: String, timeout_secs: u64) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client,
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatProvider {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse> {
        let mut messages = vec![json!({"role": "system", "content": request.system})];
        for turn in &request.messages {
            messages.extend(turn_to_wire(turn));
        }

        let wire = WireRequest {
            model: request.model.clone(),
            messages,
            max_tokens: request.max_tokens,
            tools: request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.input_schema,
                        }
                    })
                })
                .collect(),
        };

        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&wire)
            .send()
            .await
            .map_err(|e| format!("{} request error: {e}", self.name))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| format!("{} read error: {e}", self.name))?;
        if !status.is_success() {
            return Err(format!("{} API error ({status}): {body}", self.name));
        }

        let wire: WireResponse = serde_json::from_str(&body)
            .map_err(|e| format!("{} parse error: {e}", self.name))?;
        let choice = wire
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| format!("{} returned no choices", self.name))?;

        let mut content = Vec::new();
        if let Some(text) = choice.message.content
            && !text.is_empty()
        {
            content.push(ContentBlock::Text { text });
        }
        for call in choice.message.tool_calls {
            let input = serde_json::from_str(&call.function.arguments)
                .unwrap_or(Value::Object(Default::default()));
            content.push(ContentBlock::ToolCall {
                id: call.id,
                name: call.function.name,
                input,
            });
        }

        Ok(ChatResponse {
            stop_reason: parse_finish_reason(choice.finish_reason.as_deref()),
            content,
        })
    }

    fn provider_name(&self) -> &str {
        &self.name
    }
}

// ─── Translation ──────────────────────────────────────────────────────────────

fn turn_to_wire(turn: &ConversationTurn) -> Vec<Value> {
    match (turn.role, &turn.content) {
        (TurnRole::User, content) => {
            vec![json!({"role": "user", "content": content.joined_text()})]
        }
        (TurnRole::Assistant, TurnContent::Text(text)) => {
            vec![json!({"role": "assistant", "content": text})]
        }
        (TurnRole::Assistant, TurnContent::Blocks(blocks)) => {
            let text = turn.content.joined_text();
            let tool_calls: Vec<Value> = blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolCall { id, name, input } => Some(json!({
                        "id": id,
                        "type": "function",
                        "function": { "name": name, "arguments": input.to_string() }
                    })),
                    _ => None,
                })
                .collect();
            let mut msg = json!({"role": "assistant", "content": text});
            if !tool_calls.is_empty() {
                msg["tool_calls"] = Value::Array(tool_calls);
            }
            vec![msg]
        }
        (TurnRole::ToolResults, TurnContent::Blocks(blocks)) => blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolResult {
                    tool_call_id,
                    content,
                } => Some(json!({
                    "role": "tool",
                    "tool_call_id": tool_call_id,
                    "content": content,
                })),
                _ => None,
            })
            .collect(),
        (TurnRole::ToolResults, TurnContent::Text(text)) => {
            vec![json!({"role": "user", "content": text})]
        }
    }
}

fn parse_finish_reason(raw: Option<&str>) -> StopReason {
    match raw {
        Some("tool_calls") => StopReason::ToolUse,
        Some("length") => StopReason::MaxTokens,
        _ => StopReason::EndTurn,
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assistant_tool_calls_translate() {
        let turn = ConversationTurn::assistant_blocks(vec![
            ContentBlock::text("let me check"),
            ContentBlock::ToolCall {
                id: "c1".to_string(),
                name: "read_file".to_string(),
                input: json!({"path": "/a"}),
            },
        ]);
        let wire = turn_to_wire(&turn);
        assert_eq!(wire.len(), 1);
        assert_eq!(wire[0]["role"], "assistant");
        assert_eq!(wire[0]["tool_calls"][0]["function"]["name"], "read_file");
    }

    #[test]
    fn tool_results_become_tool_messages() {
        let turn = ConversationTurn::tool_results(vec![
            ContentBlock::tool_result("c1", "one"),
            ContentBlock::tool_result("c2", "two"),
        ]);
        let wire = turn_to_wire(&turn);
        assert_eq!(wire.len(), 2);
        assert_eq!(wire[0]["role"], "tool");
        assert_eq!(wire[1]["tool_call_id"], "c2");
    }

    #[test]
    fn finish_reason_mapping() {
        assert_eq!(parse_finish_reason(Some("tool_calls")), StopReason::ToolUse);
        assert_eq!(parse_finish_reason(Some("length")), StopReason::MaxTokens);
        assert_eq!(parse_finish_reason(Some("stop")), StopReason::EndTurn);
        assert_eq!(parse_finish_reason(None), StopReason::EndTurn);
    }

    #[test]
    fn response_with_tool_calls_parses() {
        let raw = r#"{"choices":[{"message":{"content":null,
            "tool_calls":[{"id":"x","type":"function",
                "function":{"name":"t","arguments":"{\"a\":1}"}}]},
            "finish_reason":"tool_calls"}]}"#;
        let wire: WireResponse = serde_json::from_str(raw).unwrap();
        let call = &wire.choices[0].message.tool_calls[0];
        assert_eq!(call.function.name, "t");
    }
}

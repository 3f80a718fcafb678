//! Provider-agnostic conversation vocabulary.
//!
//! Turns are sequences of content blocks — text, tool calls, tool
//! results — in the tagged-union shape tool-using LLM APIs exchange.
//! Provider implementations translate into and out of this vocabulary;
//! nothing outside `llm/` speaks a vendor wire format.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tools::ToolSpec;

// ─── Content blocks ───────────────────────────────────────────────────────────

/// A fragment of an LLM turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_call_id: String,
        content: String,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        ContentBlock::ToolResult {
            tool_call_id: tool_call_id.into(),
            content: content.into(),
        }
    }
}

// ─── Turns ────────────────────────────────────────────────────────────────────

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Assistant,
    ToolResults,
}

/// Turn content: plain text or an ordered block sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TurnContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl TurnContent {
    /// Concatenated text of all text blocks.
    pub fn joined_text(&self) -> String {
        match self {
            TurnContent::Text(s) => s.clone(),
            TurnContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }

    /// All tool-call blocks, in order.
    pub fn tool_calls(&self) -> Vec<(&str, &str, &Value)> {
        match self {
            TurnContent::Text(_) => Vec::new(),
            TurnContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolCall { id, name, input } => {
                        Some((id.as_str(), name.as_str(), input))
                    }
                    _ => None,
                })
                .collect(),
        }
    }
}

/// One turn in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: TurnRole,
    pub content: TurnContent,
}

impl ConversationTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: TurnContent::Text(text.into()),
        }
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: TurnContent::Text(text.into()),
        }
    }

    pub fn assistant_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: TurnContent::Blocks(blocks),
        }
    }

    pub fn tool_results(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: TurnRole::ToolResults,
            content: TurnContent::Blocks(blocks),
        }
    }
}

// ─── Requests / responses ─────────────────────────────────────────────────────

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
}

/// One round-trip request to the LLM.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub system: String,
    pub tools: Vec<ToolSpec>,
    pub messages: Vec<ConversationTurn>,
    pub max_tokens: u32,
}

/// The model's reply.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub stop_reason: StopReason,
    pub content: Vec<ContentBlock>,
}

impl ChatResponse {
    /// Concatenated text of all text blocks.
    pub fn joined_text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn content_block_serialises_tagged() {
        let block = ContentBlock::ToolCall {
            id: "t1".to_string(),
            name: "read_file".to_string(),
            input: json!({"path": "/a"}),
        };
        let v = serde_json::to_value(&block).unwrap();
        assert_eq!(v["type"], "tool_call");
        assert_eq!(v["name"], "read_file");

        let back: ContentBlock = serde_json::from_value(v).unwrap();
        assert_eq!(back, block);
    }

    #[test]
    fn turn_content_untagged_round_trip() {
        let text: TurnContent = serde_json::from_str("\"hello\"").unwrap();
        assert_eq!(text, TurnContent::Text("hello".to_string()));

        let blocks: TurnContent =
            serde_json::from_str(r#"[{"type":"text","text":"hi"}]"#).unwrap();
        assert_eq!(blocks.joined_text(), "hi");
    }

    #[test]
    fn joined_text_skips_non_text_blocks() {
        let content = TurnContent::Blocks(vec![
            ContentBlock::text("a"),
            ContentBlock::ToolCall {
                id: "1".to_string(),
                name: "x".to_string(),
                input: json!({}),
            },
            ContentBlock::text("b"),
        ]);
        assert_eq!(content.joined_text(), "ab");
    }

    #[test]
    fn tool_calls_preserve_order() {
        let content = TurnContent::Blocks(vec![
            ContentBlock::ToolCall {
                id: "1".to_string(),
                name: "first".to_string(),
                input: json!({}),
            },
            ContentBlock::text("between"),
            ContentBlock::ToolCall {
                id: "2".to_string(),
                name: "second".to_string(),
                input: json!({}),
            },
        ]);
        let calls = content.tool_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].1, "first");
        assert_eq!(calls[1].1, "second");
    }

    #[test]
    fn role_serialises_snake_case() {
        assert_eq!(serde_json::to_string(&TurnRole::ToolResults).unwrap(), "\"tool_results\"");
    }
}

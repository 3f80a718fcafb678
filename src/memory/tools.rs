//! Agent-callable memory tools.
//!
//! `save_memory` and `search_memory` run in-process — they never touch
//! the HITL gate or a sandbox, and are always treated as auto-approve by
//! the orchestrator.  The acting user is bound by the orchestrator, not
//! by the LLM's arguments.

use std::sync::Arc;

use serde_json::{Value, json};

use crate::tools::ToolSpec;

use super::traits::{MemoryCategory, MemoryStore};

/// Names of the in-process memory tools.
pub const SAVE_MEMORY: &str = "save_memory";
pub const SEARCH_MEMORY: &str = "search_memory";

/// True when `name` is an in-process memory tool.
pub fn is_memory_tool(name: &str) -> bool {
    name == SAVE_MEMORY || name == SEARCH_MEMORY
}

/// Specs for the memory tools.
pub fn memory_tool_specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec::new(
            SAVE_MEMORY,
            "Save a fact about the user or their work to persistent memory. \
             Re-saving the same category and topic overwrites the previous content.",
            json!({
                "type": "object",
                "required": ["category", "topic", "content"],
                "properties": {
                    "category": {
                        "type": "string",
                        "enum": ["user", "preference", "project", "fact", "environment"],
                        "description": "Semantic category of the memory."
                    },
                    "topic": {
                        "type": "string",
                        "description": "Short topic label, e.g. 'name' or 'deploy-process'."
                    },
                    "content": {
                        "type": "string",
                        "description": "The fact to remember."
                    }
                }
            }),
        ),
        ToolSpec::new(
            SEARCH_MEMORY,
            "Search persistent memory for facts relevant to a query.",
            json!({
                "type": "object",
                "required": ["query"],
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "Natural-language search query."
                    },
                    "limit": {
                        "type": "integer",
                        "description": "Maximum number of results. Default: 5.",
                        "default": 5
                    }
                }
            }),
        ),
    ]
}

/// Execute a memory tool for `user_id`.  Returns the tool-result text.
pub async fn execute_memory_tool(
    store: &Arc<dyn MemoryStore>,
    user_id: &str,
    tool_name: &str,
    args: &Value,
) -> Result<String, String> {
    match tool_name {
        SAVE_MEMORY => {
            let category_raw = args
                .get("category")
                .and_then(|v| v.as_str())
                .ok_or("missing required parameter 'category'")?;
            let category = MemoryCategory::parse(category_raw)
                .ok_or_else(|| format!("unknown memory category '{category_raw}'"))?;
            let topic = args
                .get("topic")
                .and_then(|v| v.as_str())
                .ok_or("missing required parameter 'topic'")?;
            let content = args
                .get("content")
                .and_then(|v| v.as_str())
                .ok_or("missing required parameter 'content'")?;

            let entry = store.save(user_id, category, topic, content).await?;
            Ok(format!("Saved memory {}/{}", entry.category, entry.topic))
        }
        SEARCH_MEMORY => {
            let query = args
                .get("query")
                .and_then(|v| v.as_str())
                .ok_or("missing required parameter 'query'")?;
            let limit = args.get("limit").and_then(|v| v.as_u64()).unwrap_or(5) as usize;

            let entries = store.search(user_id, query, limit).await?;
            if entries.is_empty() {
                return Ok("No matching memories found.".to_string());
            }
            let lines: Vec<String> = entries
                .iter()
                .map(|e| format!("[{}/{}] {}", e.category, e.topic, e.content))
                .collect();
            Ok(lines.join("\n"))
        }
        other => Err(format!("'{other}' is not a memory tool")),
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::sqlite_store::SqliteMemoryStore;

    fn make_store() -> Arc<dyn MemoryStore> {
        Arc::new(SqliteMemoryStore::in_memory().expect("store"))
    }

    #[tokio::test]
    async fn save_then_search_round_trip() {
        let store = make_store();
        let out = execute_memory_tool(
            &store,
            "u1",
            SAVE_MEMORY,
            &json!({"category": "preference", "topic": "editor", "content": "Prefers helix"}),
        )
        .await
        .unwrap();
        assert!(out.contains("preference/editor"));

        let found = execute_memory_tool(
            &store,
            "u1",
            SEARCH_MEMORY,
            &json!({"query": "helix"}),
        )
        .await
        .unwrap();
        assert!(found.contains("Prefers helix"));
    }

    #[tokio::test]
    async fn search_with_no_hits_reports_nothing_found() {
        let store = make_store();
        let out = execute_memory_tool(&store, "u1", SEARCH_MEMORY, &json!({"query": "nothing"}))
            .await
            .unwrap();
        assert_eq!(out, "No matching memories found.");
    }

    #[tokio::test]
    async fn save_rejects_unknown_category() {
        let store = make_store();
        let err = execute_memory_tool(
            &store,
            "u1",
            SAVE_MEMORY,
            &json!({"category": "secrets", "topic": "t", "content": "c"}),
        )
        .await
        .unwrap_err();
        assert!(err.contains("unknown memory category"));
    }

    #[tokio::test]
    async fn save_requires_all_fields() {
        let store = make_store();
        let err = execute_memory_tool(
            &store,
            "u1",
            SAVE_MEMORY,
            &json!({"category": "fact", "topic": "t"}),
        )
        .await
        .unwrap_err();
        assert!(err.contains("content"));
    }

    #[test]
    fn memory_tool_detection() {
        assert!(is_memory_tool(SAVE_MEMORY));
        assert!(is_memory_tool(SEARCH_MEMORY));
        assert!(!is_memory_tool("read_file"));
    }
}

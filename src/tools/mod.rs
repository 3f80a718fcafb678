//! The tool catalog presented to the LLM.
//!
//! Tools are not executed through a common trait here: the orchestrator
//! routes each call by name (memory tools in-process, `mcp_*` tools to
//! the MCP manager, everything else through the HITL gate to an
//! executor container).  What this module owns is the *contract* — one
//! [`ToolSpec`] per tool, carrying the JSON-schema parameter shape the
//! LLM sees.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Summary of a callable tool, suitable for inclusion in LLM requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

impl ToolSpec {
    pub fn new(name: &str, description: &str, input_schema: Value) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            input_schema,
        }
    }
}

// ─── Executor-routed tools ────────────────────────────────────────────────────

/// Which ephemeral executor a tool call is dispatched to.
pub fn executor_type_for(tool_name: &str) -> Option<&'static str> {
    match tool_name {
        "run_shell_command" => Some("shell"),
        "read_file" | "write_file" | "list_directory" | "search_files" => Some("file"),
        "browse_web" => Some("web"),
        _ => None,
    }
}

/// Spec for the in-process soul-update tool.  The tool name is pinned to
/// require-approval in the classifier and exempt from session grants.
pub fn soul_update_tool_spec() -> ToolSpec {
    ToolSpec::new(
        "propose_soul_update",
        "Propose replacing the assistant's identity (soul) file. \
         Always requires explicit user approval.",
        json!({
            "type": "object",
            "required": ["content"],
            "properties": {
                "content": {
                    "type": "string",
                    "description": "The full replacement soul text."
                }
            }
        }),
    )
}

/// Specs for the built-in executor-routed tools.
pub fn executor_tool_specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec::new(
            "run_shell_command",
            "Run a shell command in an ephemeral sandboxed container and return its output.",
            json!({
                "type": "object",
                "required": ["command"],
                "properties": {
                    "command": {
                        "type": "string",
                        "description": "The shell command to execute."
                    },
                    "cwd": {
                        "type": "string",
                        "description": "Working directory inside the sandbox."
                    }
                }
            }),
        ),
        ToolSpec::new(
            "read_file",
            "Read a file from the sandboxed workspace.",
            json!({
                "type": "object",
                "required": ["path"],
                "properties": {
                    "path": { "type": "string", "description": "Absolute path of the file." }
                }
            }),
        ),
        ToolSpec::new(
            "write_file",
            "Write content to a file in the sandboxed workspace.",
            json!({
                "type": "object",
                "required": ["path", "content"],
                "properties": {
                    "path": { "type": "string", "description": "Absolute path of the file." },
                    "content": { "type": "string", "description": "Full file content to write." }
                }
            }),
        ),
        ToolSpec::new(
            "list_directory",
            "List the entries of a directory in the sandboxed workspace.",
            json!({
                "type": "object",
                "required": ["path"],
                "properties": {
                    "path": { "type": "string", "description": "Absolute path of the directory." }
                }
            }),
        ),
        ToolSpec::new(
            "search_files",
            "Search file contents in the sandboxed workspace.",
            json!({
                "type": "object",
                "required": ["pattern"],
                "properties": {
                    "pattern": { "type": "string", "description": "Text or regex to search for." },
                    "path": { "type": "string", "description": "Directory to search under." }
                }
            }),
        ),
        ToolSpec::new(
            "browse_web",
            "Fetch a web page through the sandboxed web executor.",
            json!({
                "type": "object",
                "required": ["url"],
                "properties": {
                    "url": { "type": "string", "description": "The URL to fetch." }
                }
            }),
        ),
    ]
}

// ─── Tests ────────────────────────────────────────────────────────────────────

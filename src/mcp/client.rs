//! JSON-RPC 2.0 channel to one MCP server over stdio.
//!
//! Requests carry a per-server monotonic id; a background reader task
//! parses newline-delimited responses and dispatches each to the waiter
//! registered under its id.  Interleaved notifications (no `id`) are
//! logged and dropped.  When the server's stdout closes, every pending
//! call fails with a fixed error.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{ChildStdin, ChildStdout},
    sync::oneshot,
};

/// Error every pending call fails with when the server goes away.
pub const SERVER_GONE: &str = "MCP server exited";

// ─── Wire types ───────────────────────────────────────────────────────────────

/// A JSON-RPC 2.0 request sent to the MCP server.
#[derive(Debug, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// A JSON-RPC 2.0 response received from the MCP server.
#[derive(Debug, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

impl JsonRpcResponse {
    /// Convert into `Ok(result)` or `Err(message)`.
    pub fn into_result(self) -> Result<Value, String> {
        if let Some(err) = self.error {
            return Err(format!(
                "MCP error {} ({}): {}",
                err.code,
                err.message,
                err.data.unwrap_or(Value::Null)
            ));
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

// ─── McpChannel ───────────────────────────────────────────────────────────────

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

/// Live stdio channel to a running MCP server.
pub struct McpChannel {
    stdin: tokio::sync::Mutex<ChildStdin>,
    pending: PendingMap,
    next_id: AtomicU64,
    reader: tokio::task::JoinHandle<()>,
}

impl McpChannel {
    /// Attach to a spawned child's stdio and start the reader task.
    pub fn new(stdin: ChildStdin, stdout: ChildStdout, server_name: &str) -> Self {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let reader_pending = Arc::clone(&pending);
        let name = server_name.to_string();

        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<JsonRpcResponse>(&line) {
                            Ok(response) => match response.id {
                                Some(id) => {
                                    let waiter = reader_pending
                                        .lock()
                                        .unwrap_or_else(|e| e.into_inner())
                                        .remove(&id);
                                    match waiter {
                                        Some(tx) => {
                                            let _ = tx.send(response);
                                        }
                                        None => log::debug!(
                                            "mcp[{name}]: response for unknown id {id}"
                                        ),
                                    }
                                }
                                // A notification from the server; nothing waits on it.
                                None => log::debug!("mcp[{name}]: notification: {line}"),
                            },
                            Err(e) => log::warn!("mcp[{name}]: unparseable line: {e}"),
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }
            // Stdout closed: dropping the senders fails every pending call.
            reader_pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clear();
            log::info!("mcp[{name}]: stdout closed, channel down");
        });

        Self {
            stdin: tokio::sync::Mutex::new(stdin),
            pending,
            next_id: AtomicU64::new(1),
            reader,
        }
    }

    /// One request/response round-trip.
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, String> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);

        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: Some(id),
            method: method.to_string(),
            params,
        };
        if let Err(e) = self.write_line(&request).await {
            // A failed stdin write means the server process is gone.
            log::debug!("mcp: write failed, treating channel as down: {e}");
            self.pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&id);
            return Err(SERVER_GONE.to_string());
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response.into_result(),
            Ok(Err(_)) => Err(SERVER_GONE.to_string()),
            Err(_) => {
                self.pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&id);
                Err(format!("MCP call '{method}' timed out"))
            }
        }
    }

    /// Fire-and-forget notification (no id, no response).
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), String> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: None,
            method: method.to_string(),
            params,
        };
        self.write_line(&request).await
    }

    async fn write_line(&self, request: &JsonRpcRequest) -> Result<(), String> {
        let mut line = serde_json::to_string(request)
            .map_err(|e| format!("MCP serialise error: {e}"))?;
        line.push('\n');
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| format!("MCP write error: {e}"))?;
        stdin.flush().await.map_err(|e| format!("MCP flush error: {e}"))
    }
}

impl Drop for McpChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

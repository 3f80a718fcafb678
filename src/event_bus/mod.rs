//! Central pub/sub bus for gateway events.
//!
//! The HITL gate, the task loop and the heartbeat scheduler publish
//! user-facing events here; the bridge transport subscribes and fans
//! frames out to connected clients.  The bus is the only coupling
//! between those components — the gate never holds a transport handle.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 1024;

// ─── Events ───────────────────────────────────────────────────────────────────

/// Events that flow from the core toward the bridges.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayEvent {
    /// A tool call is blocked awaiting a human decision.
    ApprovalRequested {
        approval_id: String,
        chat_id: String,
        tool_name: String,
        tool_input: Value,
        reason: String,
        plan_context: Option<String>,
    },
    /// A pending approval timed out.
    ApprovalExpired {
        approval_id: String,
        chat_id: String,
    },
    /// Informational message for the user (notify-tier actions,
    /// heartbeat results).
    Notification { chat_id: String, text: String },
    /// Progress report from a running multi-step task.
    TaskProgress { chat_id: String, text: String },
    /// A session idled out and was dropped.
    SessionExpired { user_id: String },
}

/// Central pub/sub bus for gateway events.
pub trait EventBus: Send + Sync {
    /// Publish an event to all active subscribers.
    fn publish(&self, event: GatewayEvent) -> Result<(), String>;

    /// Subscribe to all events.
    fn subscribe(&self) -> broadcast::Receiver<GatewayEvent>;
}

// ─── TokioBroadcastBus ────────────────────────────────────────────────────────

/// [`EventBus`] implementation backed by a `tokio::sync::broadcast` channel.
pub struct TokioBroadcastBus {
    sender: broadcast::Sender<GatewayEvent>,
}

impl TokioBroadcastBus {
    /// Create with the default channel capacity (1024).
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create with an explicit channel capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }
}

impl Default for TokioBroadcastBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus for TokioBroadcastBus {
    fn publish(&self, event: GatewayEvent) -> Result<(), String> {
        // `send` errors only when there are no receivers — that is fine
        // for fire-and-forget notifications.
        let _ = self.sender.send(event);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.sender.subscribe()
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

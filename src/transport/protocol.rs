//! The bridge↔gateway wire vocabulary.
//!
//! Frames are newline-delimited JSON objects tagged by `type`
//! (kebab-case).  Bridges send [`BridgeFrame`]s; the gateway answers
//! with [`GatewayFrame`]s.  Approval frames and socket responses are
//! *critical*: the transport may drop notifications under backpressure
//! but never these.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::approval::ApprovalStatus;

// ─── Bridge → Gateway ─────────────────────────────────────────────────────────

/// A user message as the bridge delivers it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IncomingMessage {
    pub content: String,
    /// Opaque platform user id; defaults to the chat id when absent.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Source platform tag (`telegram`, `slack`, `web`).
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Where the reply should land.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplyTo {
    pub chat_id: String,
    #[serde(default)]
    pub message_id: Option<String>,
}

/// A human decision on a pending approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Decision {
    Approved,
    Rejected,
    SessionApproved,
}

impl Decision {
    pub fn to_status(self) -> ApprovalStatus {
        match self {
            Decision::Approved => ApprovalStatus::Approved,
            Decision::Rejected => ApprovalStatus::Rejected,
            Decision::SessionApproved => ApprovalStatus::SessionApproved,
        }
    }
}

/// Frames a bridge may send.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BridgeFrame {
    SocketRequest {
        request_id: String,
        message: IncomingMessage,
        reply_to: ReplyTo,
    },
    ApprovalDecision {
        approval_id: String,
        decision: Decision,
    },
    MemoryList {
        user_id: String,
    },
    MemoryDelete {
        user_id: String,
        memory_id: String,
    },
    SessionList,
    TaskStop {
        user_id: String,
    },
    HeartbeatList,
    HeartbeatToggle {
        name: String,
        enabled: bool,
    },
    /// OAuth broker hand-off; the flow itself lives outside the core.
    Auth {
        action: String,
        #[serde(default)]
        payload: Value,
    },
}

// ─── Gateway → Bridge ─────────────────────────────────────────────────────────

/// The reply payload for one socket request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Outgoing {
    pub chat_id: String,
    pub content: String,
    #[serde(default)]
    pub reply_to_id: Option<String>,
}

/// One memory row as shown to bridges.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemorySummary {
    pub id: String,
    pub category: String,
    pub topic: String,
    pub content: String,
}

/// One session row as shown to bridges.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSummary {
    pub id: String,
    pub user_id: String,
    pub turns: usize,
    pub updated_at: String,
}

/// One heartbeat row as shown to bridges.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatSummary {
    pub name: String,
    pub schedule: String,
    pub enabled: bool,
}

/// Frames the gateway may send.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum GatewayFrame {
    SocketResponse {
        request_id: String,
        outgoing: Outgoing,
    },
    ApprovalRequest {
        approval_id: String,
        tool_name: String,
        tool_input: Value,
        reason: String,
        #[serde(default)]
        plan_context: Option<String>,
        chat_id: String,
        #[serde(default)]
        metadata: Option<Value>,
    },
    ApprovalExpired {
        approval_id: String,
        chat_id: String,
    },
    Notification {
        chat_id: String,
        text: String,
    },
    TaskProgress {
        chat_id: String,
        text: String,
    },
    MemoryListResponse {
        memories: Vec<MemorySummary>,
    },
    MemoryDeleteResponse {
        deleted: bool,
    },
    SessionListResponse {
        sessions: Vec<SessionSummary>,
    },
    TaskStopResponse {
        cancelled: bool,
    },
    HeartbeatListResponse {
        heartbeats: Vec<HeartbeatSummary>,
    },
    HeartbeatToggleResponse {
        name: String,
        found: bool,
        enabled: bool,
    },
    AuthResponse {
        ok: bool,
        #[serde(default)]
        error: Option<String>,
    },
}

impl GatewayFrame {
    /// Critical frames are never dropped under backpressure; the client
    /// is disconnected instead.
    pub fn is_critical(&self) -> bool {
        !matches!(
            self,
            GatewayFrame::Notification { .. } | GatewayFrame::TaskProgress { .. }
        )
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

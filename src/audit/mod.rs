//! Append-only audit log.
//!
//! Every security-relevant action in the gateway is recorded as one JSON
//! object per line in `audit-YYYY-MM-DD.jsonl` (UTC date).  Files are
//! opened in append mode and never rewritten; the logger rolls to a new
//! file when the UTC date changes.
//!
//! Events for one session are totally ordered: all writes go through a
//! single internal mutex, and the timestamp is taken while the lock is
//! held.

use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::Mutex,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Event types ──────────────────────────────────────────────────────────────

/// The kind of audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    MessageReceived,
    LlmRequest,
    LlmResponse,
    MessageSent,
    ToolCall,
    ToolResult,
    ActionClassified,
    ApprovalRequested,
    ApprovalResolved,
    Error,
    SoulLoaded,
    SoulIntegrityFailure,
    SkillLoaded,
    SkillIntegrityFailure,
    McpProxy,
}

/// One entry in the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: AuditEventType,
    pub session_id: String,
    pub data: Value,
}

// ─── AuditLogger ──────────────────────────────────────────────────────────────

struct OpenFile {
    date: String,
    file: File,
}

/// Process-wide append-only audit logger.
///
/// Shared via `Arc<AuditLogger>`; all interior state is behind a `Mutex`
/// so concurrent sessions interleave at line granularity and per-session
/// ordering follows call order.
pub struct AuditLogger {
    dir: PathBuf,
    state: Mutex<Option<OpenFile>>,
}

impl AuditLogger {
    /// Create a logger writing under `dir`, creating the directory if needed.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, String> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .map_err(|e| format!("failed to create audit dir {dir:?}: {e}"))?;
        Ok(Self {
            dir,
            state: Mutex::new(None),
        })
    }

    /// Append one event.  Failures are logged and swallowed — an audit
    /// write error must never abort the action being audited.
    pub fn log(&self, event_type: AuditEventType, session_id: &str, data: Value) {
        if let Err(e) = self.try_log(event_type, session_id, data) {
            log::error!("audit: write failed: {e}");
        }
    }

    fn try_log(
        &self,
        event_type: AuditEventType,
        session_id: &str,
        data: Value,
    ) -> Result<(), String> {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());

        // Timestamp taken under the lock so per-session events are
        // monotonic in file order.
        let now = Utc::now();
        let date = now.format("%Y-%m-%d").to_string();

        let needs_roll = match guard.as_ref() {
            Some(open) => open.date != date,
            None => true,
        };
        if needs_roll {
            let path = self.dir.join(format!("audit-{date}.jsonl"));
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| format!("failed to open audit file {path:?}: {e}"))?;
            *guard = Some(OpenFile { date, file });
        }

        let event = AuditEvent {
            timestamp: now,
            event_type,
            session_id: session_id.to_string(),
            data,
        };
        let mut line = serde_json::to_string(&event)
            .map_err(|e| format!("failed to serialise audit event: {e}"))?;
        line.push('\n');

        let open = guard.as_mut().ok_or("audit file not open")?;
        open.file
            .write_all(line.as_bytes())
            .map_err(|e| format!("failed to append audit event: {e}"))?;
        Ok(())
    }

    /// Path of the file the next write would land in (used by tests).
    pub fn current_path(&self) -> PathBuf {
        let date = Utc::now().format("%Y-%m-%d").to_string();
        self.dir.join(format!("audit-{date}.jsonl"))
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

//! SQLite-backed approval store.
//!
//! Approval rows are terminal once they leave `pending`: `resolve` and
//! the expiry sweeper guard every transition with `WHERE status =
//! 'pending'`, so the first resolution wins and later ones are no-ops.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─── Types ────────────────────────────────────────────────────────────────────

/// Lifecycle state of an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    SessionApproved,
    Expired,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
            ApprovalStatus::SessionApproved => "session-approved",
            ApprovalStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ApprovalStatus::Pending),
            "approved" => Some(ApprovalStatus::Approved),
            "rejected" => Some(ApprovalStatus::Rejected),
            "session-approved" => Some(ApprovalStatus::SessionApproved),
            "expired" => Some(ApprovalStatus::Expired),
            _ => None,
        }
    }

    /// True for every state except `pending`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }
}

/// One approval request row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    pub id: String,
    pub session_id: String,
    pub tool_name: String,
    /// Serialised tool input (JSON).
    pub tool_input: String,
    /// Serialised capability claims the call would run under (JSON).
    pub capability: String,
    pub reason: String,
    pub plan_context: String,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub status: ApprovalStatus,
}

/// Input for [`ApprovalStore::create`].
#[derive(Debug, Clone)]
pub struct NewApproval {
    pub session_id: String,
    pub tool_name: String,
    pub tool_input: String,
    pub capability: String,
    pub reason: String,
    pub plan_context: String,
}

// ─── Store ────────────────────────────────────────────────────────────────────

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS approvals (
    id TEXT PRIMARY KEY NOT NULL,
    session_id TEXT NOT NULL,
    tool_name TEXT NOT NULL,
    tool_input TEXT NOT NULL,
    capability TEXT NOT NULL,
    reason TEXT NOT NULL,
    plan_context TEXT NOT NULL,
    created_at TEXT NOT NULL,
    resolved_at TEXT,
    status TEXT NOT NULL DEFAULT 'pending'
);

CREATE INDEX IF NOT EXISTS idx_approvals_status ON approvals (status);
CREATE INDEX IF NOT EXISTS idx_approvals_created ON approvals (created_at);
"#;

const SELECT_COLUMNS: &str =
    "id, session_id, tool_name, tool_input, capability, reason, plan_context, \
     created_at, resolved_at, status";

/// SQLite-backed, thread-safe approval store.
pub struct ApprovalStore {
    conn: Arc<Mutex<Connection>>,
}

impl ApprovalStore {
    pub fn open(path: &str) -> Result<Self, String> {
        let conn = Connection::open(path).map_err(|e| format!("SQLite open error: {e}"))?;
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| format!("SQLite schema error: {e}"))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> Result<Self, String> {
        let conn =
            Connection::open_in_memory().map_err(|e| format!("SQLite in-memory error: {e}"))?;
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| format!("SQLite schema error: {e}"))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Share an already-open connection with the other stores.
    pub fn with_connection(conn: Arc<Mutex<Connection>>) -> Result<Self, String> {
        {
            let guard = conn.lock().map_err(|e| format!("SQLite lock error: {e}"))?;
            guard
                .execute_batch(SCHEMA_SQL)
                .map_err(|e| format!("SQLite schema error: {e}"))?;
        }
        Ok(Self { conn })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, String> {
        self.conn
            .lock()
            .map_err(|e| format!("SQLite lock error: {e}"))
    }

    /// Create a new pending approval with a fresh id.
    pub fn create(&self, input: NewApproval) -> Result<Approval, String> {
        let approval = Approval {
            id: Uuid::new_v4().to_string(),
            session_id: input.session_id,
            tool_name: input.tool_name,
            tool_input: input.tool_input,
            capability: input.capability,
            reason: input.reason,
            plan_context: input.plan_context,
            created_at: Utc::now(),
            resolved_at: None,
            status: ApprovalStatus::Pending,
        };

        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO approvals
                (id, session_id, tool_name, tool_input, capability, reason, plan_context,
                 created_at, resolved_at, status)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL, 'pending')
            "#,
            params![
                approval.id,
                approval.session_id,
                approval.tool_name,
                approval.tool_input,
                approval.capability,
                approval.reason,
                approval.plan_context,
                approval.created_at.to_rfc3339(),
            ],
        )
        .map_err(|e| format!("SQLite insert error: {e}"))?;

        Ok(approval)
    }

    pub fn get_by_id(&self, id: &str) -> Result<Option<Approval>, String> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {SELECT_COLUMNS} FROM approvals WHERE id = ?1"),
            params![id],
            row_to_approval,
        )
        .optional()
        .map_err(|e| format!("SQLite query error: {e}"))
    }

    /// Transition a pending approval to a terminal status.
    ///
    /// Returns `true` when the row was transitioned; `false` when it was
    /// already terminal (or absent) — the caller treats that as "someone
    /// else resolved first".
    pub fn resolve(&self, id: &str, status: ApprovalStatus) -> Result<bool, String> {
        if !status.is_terminal() {
            return Err("cannot resolve an approval back to pending".to_string());
        }
        let conn = self.lock()?;
        let n = conn
            .execute(
                "UPDATE approvals SET status = ?1, resolved_at = ?2
                 WHERE id = ?3 AND status = 'pending'",
                params![status.as_str(), Utc::now().to_rfc3339(), id],
            )
            .map_err(|e| format!("SQLite update error: {e}"))?;
        Ok(n > 0)
    }

    /// Expire every pending approval older than `max_age_ms`.
    ///
    /// Returns the expired rows so the caller can fire their rendezvous
    /// and notify bridges.
    pub fn expire_stale_pending(&self, max_age_ms: u64) -> Result<Vec<Approval>, String> {
        let cutoff = Utc::now() - Duration::milliseconds(max_age_ms as i64);
        let cutoff_str = cutoff.to_rfc3339();
        let conn = self.lock()?;

        let stale: Vec<Approval> = {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {SELECT_COLUMNS} FROM approvals
                     WHERE status = 'pending' AND created_at < ?1"
                ))
                .map_err(|e| format!("SQLite prepare error: {e}"))?;
            let rows = stmt
                .query_map(params![cutoff_str], row_to_approval)
                .map_err(|e| format!("SQLite query error: {e}"))?;
            rows.filter_map(|r| r.ok()).collect()
        };

        let now = Utc::now().to_rfc3339();
        let mut expired = Vec::with_capacity(stale.len());
        for mut approval in stale {
            let n = conn
                .execute(
                    "UPDATE approvals SET status = 'expired', resolved_at = ?1
                     WHERE id = ?2 AND status = 'pending'",
                    params![now, approval.id],
                )
                .map_err(|e| format!("SQLite update error: {e}"))?;
            if n > 0 {
                approval.status = ApprovalStatus::Expired;
                approval.resolved_at = DateTime::parse_from_rfc3339(&now)
                    .ok()
                    .map(|t| t.with_timezone(&Utc));
                expired.push(approval);
            }
        }
        Ok(expired)
    }

    /// Most recent approvals, newest first.
    pub fn get_recent(&self, limit: usize) -> Result<Vec<Approval>, String> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM approvals
                 ORDER BY created_at DESC LIMIT ?1"
            ))
            .map_err(|e| format!("SQLite prepare error: {e}"))?;
        let rows = stmt
            .query_map(params![limit as i64], row_to_approval)
            .map_err(|e| format!("SQLite query error: {e}"))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

fn row_to_approval(row: &rusqlite::Row<'_>) -> rusqlite::Result<Approval> {
    let created_raw: String = row.get(7)?;
    let resolved_raw: Option<String> = row.get(8)?;
    let status_raw: String = row.get(9)?;
    Ok(Approval {
        id: row.get(0)?,
        session_id: row.get(1)?,
        tool_name: row.get(2)?,
        tool_input: row.get(3)?,
        capability: row.get(4)?,
        reason: row.get(5)?,
        plan_context: row.get(6)?,
        created_at: DateTime::parse_from_rfc3339(&created_raw)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        resolved_at: resolved_raw
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|t| t.with_timezone(&Utc)),
        status: ApprovalStatus::parse(&status_raw).unwrap_or(ApprovalStatus::Expired),
    })
}

// ─── Tests ────────────────────────────────────────────────────────────────────

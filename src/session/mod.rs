//! In-memory session and task-session stores.
//!
//! Sessions hold bounded per-user conversation state: at most
//! `max_turns` turns (oldest dropped) and a 60-minute idle TTL enforced
//! by a periodic sweeper.  Task sessions track multi-iteration tasks;
//! at most one may be `active` per user.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::llm::types::{ConversationTurn, TurnContent, TurnRole};

// ─── Session ──────────────────────────────────────────────────────────────────

/// Bounded conversation state for one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub turns: Vec<ConversationTurn>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// In-memory session table keyed by user id.
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Session>>,
    max_turns: usize,
    ttl_minutes: i64,
}

impl SessionStore {
    pub fn new(max_turns: usize, ttl_minutes: i64) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            max_turns,
            ttl_minutes,
        })
    }

    /// Fetch the user's session, creating a fresh one if absent.
    pub fn get_or_create(&self, user_id: &str) -> Session {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions
            .entry(user_id.to_string())
            .or_insert_with(|| {
                let now = Utc::now();
                Session {
                    id: Uuid::new_v4().to_string(),
                    user_id: user_id.to_string(),
                    turns: Vec::new(),
                    created_at: now,
                    updated_at: now,
                }
            })
            .clone()
    }

    pub fn get(&self, user_id: &str) -> Option<Session> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(user_id)
            .cloned()
    }

    /// Replace the user's turn history, enforcing the turn cap.
    pub fn set_turns(&self, user_id: &str, turns: Vec<ConversationTurn>) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();
        let session = sessions.entry(user_id.to_string()).or_insert_with(|| Session {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            turns: Vec::new(),
            created_at: now,
            updated_at: now,
        });
        session.turns = turns;
        Self::enforce_cap(&mut session.turns, self.max_turns);
        session.updated_at = now;
    }

    /// Append one turn, enforcing the turn cap.
    pub fn append(&self, user_id: &str, role: TurnRole, content: TurnContent) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();
        let session = sessions.entry(user_id.to_string()).or_insert_with(|| Session {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            turns: Vec::new(),
            created_at: now,
            updated_at: now,
        });
        session.turns.push(ConversationTurn { role, content });
        Self::enforce_cap(&mut session.turns, self.max_turns);
        session.updated_at = now;
    }

    fn enforce_cap(turns: &mut Vec<ConversationTurn>, max: usize) {
        if turns.len() > max {
            let excess = turns.len() - max;
            turns.drain(0..excess);
        }
    }

    /// Summaries of all live sessions (for the `session-list` command).
    pub fn list(&self) -> Vec<Session> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Drop sessions idle past the TTL, returning the dropped sessions
    /// so the caller can release per-session state (grants, locks).
    pub fn sweep_once(&self) -> Vec<Session> {
        let cutoff = Utc::now() - chrono::Duration::minutes(self.ttl_minutes);
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let expired_users: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| s.updated_at < cutoff)
            .map(|(user, _)| user.clone())
            .collect();
        expired_users
            .iter()
            .filter_map(|user| sessions.remove(user))
            .collect()
    }
}

// ─── Task sessions ────────────────────────────────────────────────────────────

/// Lifecycle state of a task session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Active,
    Completed,
    Failed,
    Paused,
    Cancelled,
}

/// One step of a task plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    pub description: String,
    pub status: String,
    #[serde(default)]
    pub result: Option<String>,
}

/// The evolving plan a task session carries across iterations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskPlan {
    pub goal: String,
    pub steps: Vec<PlanStep>,
    pub assumptions: Vec<String>,
    pub log: Vec<String>,
}

/// A multi-iteration task with its own lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSession {
    pub id: String,
    pub user_id: String,
    pub original_request: String,
    pub status: TaskStatus,
    pub iteration: u32,
    pub max_iterations: u32,
    pub plan: TaskPlan,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// In-memory task-session table.
pub struct TaskSessionStore {
    tasks: Mutex<HashMap<String, TaskSession>>,
}

impl TaskSessionStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tasks: Mutex::new(HashMap::new()),
        })
    }

    /// Create a new active task for `user_id`.
    ///
    /// Fails when the user already has an active task — the invariant is
    /// at most one `active` task session per user.
    pub fn create(
        &self,
        user_id: &str,
        original_request: &str,
        max_iterations: u32,
    ) -> Result<TaskSession, String> {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let already_active = tasks
            .values()
            .any(|t| t.user_id == user_id && t.status == TaskStatus::Active);
        if already_active {
            return Err(format!("user '{user_id}' already has an active task"));
        }

        let now = Utc::now();
        let task = TaskSession {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            original_request: original_request.to_string(),
            status: TaskStatus::Active,
            iteration: 0,
            max_iterations,
            plan: TaskPlan::default(),
            created_at: now,
            updated_at: now,
        };
        tasks.insert(task.id.clone(), task.clone());
        Ok(task)
    }

    pub fn get(&self, id: &str) -> Option<TaskSession> {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    /// The user's active task, if any.
    pub fn get_active(&self, user_id: &str) -> Option<TaskSession> {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .find(|t| t.user_id == user_id && t.status == TaskStatus::Active)
            .cloned()
    }

    /// Apply a mutation to a task.  Returns the updated copy.
    pub fn update<F>(&self, id: &str, mutate: F) -> Option<TaskSession>
    where
        F: FnOnce(&mut TaskSession),
    {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let task = tasks.get_mut(id)?;
        mutate(task);
        task.updated_at = Utc::now();
        Some(task.clone())
    }

    pub fn set_status(&self, id: &str, status: TaskStatus) -> Option<TaskSession> {
        self.update(id, |t| t.status = status)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

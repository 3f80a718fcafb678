//! Multi-iteration task driver.
//!
//! Complex tasks must not share an ever-growing context window: each
//! iteration starts from a **fresh** history containing only the
//! original request plus the compressed plan state, and the assistant
//! signals "more to do" with a `[CONTINUE]` sentinel in its final text.
//!
//! Cancellation is edge-triggered: `cancel()` sets a flag the loop
//! observes between iterations and the orchestrator observes at its own
//! suspension points — never mid-dispatch, so audit integrity holds.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use crate::{
    event_bus::{EventBus, GatewayEvent},
    llm::types::ConversationTurn,
    orchestrator::{ChatTurn, Orchestrator},
    session::{TaskSessionStore, TaskStatus},
};

/// Sentinel the assistant appends when the task needs another iteration.
pub const CONTINUE_SENTINEL: &str = "[CONTINUE]";

/// Default iteration budget for one task.
pub const DEFAULT_MAX_ITERATIONS: u32 = 10;

// ─── Outcome ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub text: String,
    pub session_id: String,
    pub iterations: u32,
    pub completed: bool,
}

// ─── TaskLoop ─────────────────────────────────────────────────────────────────

pub struct TaskLoop {
    orchestrator: Arc<Orchestrator>,
    tasks: Arc<TaskSessionStore>,
    bus: Arc<dyn EventBus>,
    cancel_flags: Mutex<HashMap<String, Arc<AtomicBool>>>,
    max_iterations: u32,
}

impl TaskLoop {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        tasks: Arc<TaskSessionStore>,
        bus: Arc<dyn EventBus>,
        max_iterations: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            orchestrator,
            tasks,
            bus,
            cancel_flags: Mutex::new(HashMap::new()),
            max_iterations,
        })
    }

    /// Drive one task to completion, cancellation, or the iteration cap.
    #[tracing::instrument(name = "task.execute", skip_all, fields(user = user_id))]
    pub async fn execute(
        &self,
        user_id: &str,
        original_request: &str,
        chat_id: &str,
    ) -> Result<TaskOutcome, String> {
        let task = self
            .tasks
            .create(user_id, original_request, self.max_iterations)?;
        let flag = Arc::new(AtomicBool::new(false));
        self.cancel_flags
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(user_id.to_string(), Arc::clone(&flag));

        let result = self
            .run_iterations(&task.id, user_id, original_request, chat_id, &flag)
            .await;

        self.cancel_flags
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(user_id);
        result
    }

    async fn run_iterations(
        &self,
        task_id: &str,
        user_id: &str,
        original_request: &str,
        chat_id: &str,
        flag: &Arc<AtomicBool>,
    ) -> Result<TaskOutcome, String> {
        let mut last_text = String::new();

        for iteration in 0..self.max_iterations {
            if flag.load(Ordering::SeqCst) {
                self.tasks.set_status(task_id, TaskStatus::Cancelled);
                return Ok(TaskOutcome {
                    text: last_text,
                    session_id: task_id.to_string(),
                    iterations: iteration,
                    completed: false,
                });
            }

            // Fresh context every iteration: the original request plus the
            // compressed plan state, nothing else.
            let message = self.iteration_message(task_id, original_request);
            let history = vec![ConversationTurn::user(message)];

            let outcome = match self
                .orchestrator
                .chat(
                    ChatTurn {
                        session_id: task_id.to_string(),
                        chat_id: chat_id.to_string(),
                        user_id: user_id.to_string(),
                        history,
                    },
                    Some(Arc::clone(flag)),
                )
                .await
            {
                Ok(outcome) => outcome,
                Err(e) if e == "cancelled" => {
                    self.tasks.set_status(task_id, TaskStatus::Cancelled);
                    return Ok(TaskOutcome {
                        text: last_text,
                        session_id: task_id.to_string(),
                        iterations: iteration,
                        completed: false,
                    });
                }
                Err(e) => {
                    self.tasks.update(task_id, |t| {
                        t.status = TaskStatus::Failed;
                        t.plan.log.push(format!("provider error: {e}"));
                    });
                    return Err(e);
                }
            };

            let text = outcome.final_text;
            self.tasks.update(task_id, |t| t.iteration = iteration + 1);

            if let Some(stripped) = strip_sentinel(&text) {
                last_text = stripped.clone();
                // Persist the iteration's report as plan state for the
                // next fresh context.
                self.tasks.update(task_id, |t| t.plan.log.push(stripped.clone()));
                let _ = self.bus.publish(GatewayEvent::TaskProgress {
                    chat_id: chat_id.to_string(),
                    text: stripped,
                });
                continue;
            }

            self.tasks.set_status(task_id, TaskStatus::Completed);
            return Ok(TaskOutcome {
                text,
                session_id: task_id.to_string(),
                iterations: iteration + 1,
                completed: true,
            });
        }

        self.tasks.update(task_id, |t| {
            t.status = TaskStatus::Failed;
            t.plan.log.push("iteration-cap".to_string());
        });
        Ok(TaskOutcome {
            text: last_text,
            session_id: task_id.to_string(),
            iterations: self.max_iterations,
            completed: false,
        })
    }

    fn iteration_message(&self, task_id: &str, original_request: &str) -> String {
        let plan_state = self
            .tasks
            .get(task_id)
            .map(|t| {
                let mut lines = Vec::new();
                if !t.plan.goal.is_empty() {
                    lines.push(format!("Goal: {}", t.plan.goal));
                }
                for entry in t.plan.log.iter().rev().take(5).rev() {
                    lines.push(format!("- {entry}"));
                }
                lines.join("\n")
            })
            .unwrap_or_default();

        if plan_state.is_empty() {
            format!(
                "{original_request}\n\nWork step by step. End your reply with {CONTINUE_SENTINEL} \
                 if the task needs another iteration; otherwise give the final answer."
            )
        } else {
            format!(
                "{original_request}\n\nProgress so far:\n{plan_state}\n\nContinue the task. \
                 End your reply with {CONTINUE_SENTINEL} if it needs another iteration; \
                 otherwise give the final answer."
            )
        }
    }

    /// Cancel the user's running task, if any.  Edge-triggered; the loop
    /// stops at its next safe point.
    pub fn cancel(&self, user_id: &str) -> bool {
        let flags = self.cancel_flags.lock().unwrap_or_else(|e| e.into_inner());
        match flags.get(user_id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }
}

/// Strip the continue sentinel.  `None` when the text is terminal.
fn strip_sentinel(text: &str) -> Option<String> {
    if text.contains(CONTINUE_SENTINEL) {
        Some(text.replace(CONTINUE_SENTINEL, "").trim().to_string())
    } else {
        None
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

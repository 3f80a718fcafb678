//! System prompt assembly.
//!
//! The prompt is layered, in order: identity (hash-verified soul) →
//! skills catalog → what we know about the user → context relevant to
//! the last message → active task state → ground rules.  Every layer
//! draws from integrity-checked or store-owned data; executor output
//! never reaches the prompt.

use std::sync::Arc;

use crate::audit::AuditLogger;
use crate::identity::{SkillCatalog, SoulLoader};
use crate::memory::{MemoryCategory, MemoryStore};
use crate::session::TaskSessionStore;

/// Fixed closing section of every system prompt.
const GROUND_RULES: &str = "\
## Ground rules

- Use tools for any action with effects; never pretend an action happened.
- Risky actions require user approval. A rejected or expired approval is \
final for this turn; adapt instead of retrying.
- Keep replies concise and concrete.";

/// How many relevant memories ride along with each prompt.
const CONTEXT_MEMORIES: usize = 5;

// ─── PromptBuilder ────────────────────────────────────────────────────────────

pub struct PromptBuilder {
    soul: Arc<SoulLoader>,
    skills: Arc<SkillCatalog>,
    memory: Arc<dyn MemoryStore>,
    tasks: Arc<TaskSessionStore>,
    audit: Arc<AuditLogger>,
}

impl PromptBuilder {
    pub fn new(
        soul: Arc<SoulLoader>,
        skills: Arc<SkillCatalog>,
        memory: Arc<dyn MemoryStore>,
        tasks: Arc<TaskSessionStore>,
        audit: Arc<AuditLogger>,
    ) -> Arc<Self> {
        Arc::new(Self {
            soul,
            skills,
            memory,
            tasks,
            audit,
        })
    }

    /// Assemble the system prompt for one LLM round-trip.
    pub async fn build(&self, user_id: &str, last_user_message: &str) -> String {
        let mut sections: Vec<String> = Vec::new();

        // 1. Identity.
        sections.push(self.soul.read(&self.audit));

        // 2. Skills catalog.
        let skills = self.skills.enabled_skills(&self.audit);
        if !skills.is_empty() {
            let mut lines = vec!["## Skills".to_string()];
            for skill in &skills {
                lines.push(format!("- {} — {}", skill.name, skill.description));
            }
            // Inline always-load skills under the character budget.
            let mut budget = self.skills.char_budget;
            for skill in skills.iter().filter(|s| s.always_load) {
                if skill.content.len() > budget {
                    log::debug!("prompt: skill '{}' over budget, not inlined", skill.name);
                    continue;
                }
                budget -= skill.content.len();
                lines.push(format!("\n### {}\n{}", skill.name, skill.content));
            }
            sections.push(lines.join("\n"));
        }

        // 3. What we know about the user.
        let mut known = Vec::new();
        for category in [MemoryCategory::User, MemoryCategory::Preference] {
            if let Ok(entries) = self.memory.get_by_category(user_id, category).await {
                known.extend(entries);
            }
        }
        if !known.is_empty() {
            let mut lines = vec!["## What you know about the user".to_string()];
            for entry in &known {
                lines.push(format!("- {}: {}", entry.topic, entry.content));
            }
            sections.push(lines.join("\n"));
        }

        // 4. Context relevant to the last message.
        if !last_user_message.is_empty()
            && let Ok(hits) = self
                .memory
                .search(user_id, last_user_message, CONTEXT_MEMORIES)
                .await
            && !hits.is_empty()
        {
            let mut lines = vec!["## Relevant context".to_string()];
            for hit in &hits {
                lines.push(format!("- [{}/{}] {}", hit.category, hit.topic, hit.content));
            }
            sections.push(lines.join("\n"));
        }

        // 5. Active task.
        if let Some(task) = self.tasks.get_active(user_id) {
            let mut lines = vec![
                "## Active task".to_string(),
                format!("Goal: {}", task.plan.goal),
                format!("Iteration: {}/{}", task.iteration, task.max_iterations),
            ];
            for step in &task.plan.steps {
                lines.push(format!("- [{}] {}", step.status, step.description));
            }
            sections.push(lines.join("\n"));
        }

        // 6. Ground rules.
        sections.push(GROUND_RULES.to_string());

        sections.join("\n\n")
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

//! Core types and the `MemoryStore` trait for the memory subsystem.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// ─── MemoryCategory ───────────────────────────────────────────────────────────

/// Semantic classification of a memory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryCategory {
    /// Who the user is.
    User,
    /// How the user likes things done.
    Preference,
    /// Ongoing work.
    Project,
    /// Standalone facts.
    Fact,
    /// Machines, paths, deployment details.
    Environment,
}

impl MemoryCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryCategory::User => "user",
            MemoryCategory::Preference => "preference",
            MemoryCategory::Project => "project",
            MemoryCategory::Fact => "fact",
            MemoryCategory::Environment => "environment",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(MemoryCategory::User),
            "preference" => Some(MemoryCategory::Preference),
            "project" => Some(MemoryCategory::Project),
            "fact" => Some(MemoryCategory::Fact),
            "environment" => Some(MemoryCategory::Environment),
            _ => None,
        }
    }
}

impl std::fmt::Display for MemoryCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── MemoryEntry ──────────────────────────────────────────────────────────────

/// A single memory record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    /// Unique identifier.
    pub id: String,
    /// Owning user.
    pub user_id: String,
    /// Semantic category.
    pub category: MemoryCategory,
    /// Short topic label; `(user_id, category, topic)` is unique.
    pub topic: String,
    /// The text content of this memory.
    pub content: String,
    /// How many times this entry has been returned by a search.
    pub access_count: i64,
    /// ISO 8601 creation timestamp.
    pub created_at: String,
    /// ISO 8601 last-access timestamp.
    pub last_accessed_at: String,
}

// ─── MemoryStore trait ────────────────────────────────────────────────────────

/// Abstraction over the agent's persistent memory.
///
/// Implementations must make `save` an upsert on `(user_id, category,
/// topic)` and must increment `access_count` exactly once per hit per
/// `search` call.  Search results are sorted by descending relevance.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Store or overwrite the entry at `(user_id, category, topic)`.
    async fn save(
        &self,
        user_id: &str,
        category: MemoryCategory,
        topic: &str,
        content: &str,
    ) -> Result<MemoryEntry, String>;

    /// All entries for a user in one category, most recently created first.
    async fn get_by_category(
        &self,
        user_id: &str,
        category: MemoryCategory,
    ) -> Result<Vec<MemoryEntry>, String>;

    /// Full-text search over `topic + content`.  Each returned hit has its
    /// `access_count` incremented.
    async fn search(
        &self,
        user_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<MemoryEntry>, String>;

    /// Delete by id.  Returns `true` when an entry was removed.
    async fn delete_by_id(&self, user_id: &str, id: &str) -> Result<bool, String>;

    /// Delete by `(category, topic)`.  Returns `true` when an entry was removed.
    async fn delete_by_topic(
        &self,
        user_id: &str,
        category: MemoryCategory,
        topic: &str,
    ) -> Result<bool, String>;

    /// All entries for a user, most recently created first.
    async fn list(&self, user_id: &str) -> Result<Vec<MemoryEntry>, String>;
}

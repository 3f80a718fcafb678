//! SQLite-backed implementation of the [`MemoryStore`] trait.
//!
//! [`SqliteMemoryStore`] persists memory entries to a SQLite database and
//! uses an FTS5 virtual table over `topic` and `content` for full-text
//! recall.
//!
//! # Schema
//! The `memories` table carries the unique `(user_id, category, topic)`
//! key; `memories_fts` mirrors the searchable columns via triggers.
//!
//! # Connection
//! A [`rusqlite::Connection`] wrapped in an `Arc<Mutex<…>>` is held
//! internally, making the store `Send + Sync` while keeping SQLite's
//! single-writer requirement.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, params};
use uuid::Uuid;

use super::traits::{MemoryCategory, MemoryEntry, MemoryStore};

// ─── Schema setup ─────────────────────────────────────────────────────────────

/// DDL executed when the store is opened.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS memories (
    id TEXT PRIMARY KEY NOT NULL,
    user_id TEXT NOT NULL,
    category TEXT NOT NULL,
    topic TEXT NOT NULL,
    content TEXT NOT NULL,
    access_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    last_accessed_at TEXT NOT NULL,
    UNIQUE (user_id, category, topic)
);

CREATE INDEX IF NOT EXISTS idx_memories_user_category ON memories (user_id, category);

CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(
    topic,
    content,
    content='memories',
    content_rowid='rowid'
);

CREATE TRIGGER IF NOT EXISTS memories_ai AFTER INSERT ON memories BEGIN
    INSERT INTO memories_fts(rowid, topic, content) VALUES (new.rowid, new.topic, new.content);
END;
CREATE TRIGGER IF NOT EXISTS memories_ad AFTER DELETE ON memories BEGIN
    INSERT INTO memories_fts(memories_fts, rowid, topic, content)
    VALUES('delete', old.rowid, old.topic, old.content);
END;
CREATE TRIGGER IF NOT EXISTS memories_au AFTER UPDATE ON memories BEGIN
    INSERT INTO memories_fts(memories_fts, rowid, topic, content)
    VALUES('delete', old.rowid, old.topic, old.content);
    INSERT INTO memories_fts(rowid, topic, content) VALUES (new.rowid, new.topic, new.content);
END;
"#;

// ─── SqliteMemoryStore ────────────────────────────────────────────────────────

/// SQLite-backed, thread-safe memory store with FTS5 full-text search.
pub struct SqliteMemoryStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteMemoryStore {
    /// Open (or create) a SQLite database at `path` and initialise the schema.
    pub fn open(path: &str) -> Result<Self, String> {
        let conn = Connection::open(path).map_err(|e| format!("SQLite open error: {e}"))?;
        // WAL for better concurrent read performance.  `PRAGMA journal_mode`
        // returns a result row, so query_row rather than execute_batch.
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))
            .map_err(|e| format!("SQLite PRAGMA error: {e}"))?;
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| format!("SQLite schema error: {e}"))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory SQLite store — useful for tests.
    pub fn in_memory() -> Result<Self, String> {
        let conn =
            Connection::open_in_memory().map_err(|e| format!("SQLite in-memory error: {e}"))?;
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| format!("SQLite schema error: {e}"))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Share an already-open connection (memory and approval stores live in
    /// the same database file).
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
}

const SELECT_COLUMNS: &str =
    "id, user_id, category, topic, content, access_count, created_at, last_accessed_at";

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryEntry> {
    let category_raw: String = row.get(2)?;
    Ok(MemoryEntry {
        id: row.get(0)?,
        user_id: row.get(1)?,
        category: MemoryCategory::parse(&category_raw).unwrap_or(MemoryCategory::Fact),
        topic: row.get(3)?,
        content: row.get(4)?,
        access_count: row.get(5)?,
        created_at: row.get(6)?,
        last_accessed_at: row.get(7)?,
    })
}

// ─── MemoryStore implementation ───────────────────────────────────────────────

#[async_trait]
impl MemoryStore for SqliteMemoryStore {
    /// Upsert on `(user_id, category, topic)`.  The `id`, `created_at` and
    /// `access_count` of an existing entry are preserved.
    async fn save(
        &self,
        user_id: &str,
        category: MemoryCategory,
        topic: &str,
        content: &str,
    ) -> Result<MemoryEntry, String> {
        let now = Utc::now().to_rfc3339();
        let id = Uuid::new_v4().to_string();
        let conn = self.lock()?;

        conn.execute(
            r#"
            INSERT INTO memories
                (id, user_id, category, topic, content, access_count, created_at, last_accessed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?6)
            ON CONFLICT(user_id, category, topic) DO UPDATE SET
                content = excluded.content,
                last_accessed_at = excluded.last_accessed_at
            "#,
            params![id, user_id, category.as_str(), topic, content, now],
        )
        .map_err(|e| format!("SQLite insert error: {e}"))?;

        conn.query_row(
            &format!(
                "SELECT {SELECT_COLUMNS} FROM memories
                 WHERE user_id = ?1 AND category = ?2 AND topic = ?3"
            ),
            params![user_id, category.as_str(), topic],
            row_to_entry,
        )
        .map_err(|e| format!("SQLite readback error: {e}"))
    }

    async fn get_by_category(
        &self,
        user_id: &str,
        category: MemoryCategory,
    ) -> Result<Vec<MemoryEntry>, String> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM memories
                 WHERE user_id = ?1 AND category = ?2
                 ORDER BY created_at DESC"
            ))
            .map_err(|e| format!("SQLite prepare error: {e}"))?;
        let rows = stmt
            .query_map(params![user_id, category.as_str()], row_to_entry)
            .map_err(|e| format!("SQLite query error: {e}"))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// FTS5 search over `topic + content`, falling back to a LIKE scan when
    /// FTS matches nothing.  Every returned hit has its `access_count`
    /// incremented exactly once.
    async fn search(
        &self,
        user_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<MemoryEntry>, String> {
        if limit == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.lock()?;
        let fts_query = sanitise_fts_query(query);

        // Columns qualified with `m.` — the FTS table carries its own
        // `topic`/`content` and would otherwise make them ambiguous.
        let mut stmt = conn
            .prepare(
                r#"
                SELECT m.id, m.user_id, m.category, m.topic, m.content,
                       m.access_count, m.created_at, m.last_accessed_at
                FROM memories_fts
                JOIN memories m ON m.rowid = memories_fts.rowid
                WHERE memories_fts MATCH ?1 AND m.user_id = ?2
                ORDER BY bm25(memories_fts)
                LIMIT ?3
                "#,
            )
            .map_err(|e| format!("SQLite prepare error: {e}"))?;
        let rows = stmt
            .query_map(params![fts_query, user_id, limit as i64], row_to_entry)
            .map_err(|e| format!("SQLite query error: {e}"))?;
        let mut results: Vec<MemoryEntry> = rows.filter_map(|r| r.ok()).collect();

        // Very short queries (or stemming mismatches) can miss in FTS even
        // when entries exist; a keyword LIKE scan keeps recall useful.
        if results.is_empty() {
            let like_pat = format!("%{}%", query.replace('%', "\\%").replace('_', "\\_"));
            let mut fallback = conn
                .prepare(&format!(
                    r#"
                    SELECT {SELECT_COLUMNS} FROM memories
                    WHERE user_id = ?1
                      AND (content LIKE ?2 ESCAPE '\' OR topic LIKE ?2 ESCAPE '\')
                    ORDER BY last_accessed_at DESC
                    LIMIT ?3
                    "#
                ))
                .map_err(|e| format!("SQLite prepare error: {e}"))?;
            let fb_rows = fallback
                .query_map(params![user_id, like_pat, limit as i64], row_to_entry)
                .map_err(|e| format!("SQLite query error: {e}"))?;
            results = fb_rows.filter_map(|r| r.ok()).collect();
        }

        // One access_count bump per hit per call.
        let now = Utc::now().to_rfc3339();
        for entry in &mut results {
            conn.execute(
                "UPDATE memories
                 SET access_count = access_count + 1, last_accessed_at = ?1
                 WHERE id = ?2",
                params![now, entry.id],
            )
            .map_err(|e| format!("SQLite access-count error: {e}"))?;
            entry.access_count += 1;
            entry.last_accessed_at = now.clone();
        }

        Ok(results)
    }

    async fn delete_by_id(&self, user_id: &str, id: &str) -> Result<bool, String> {
        let conn = self.lock()?;
        let n = conn
            .execute(
                "DELETE FROM memories WHERE user_id = ?1 AND id = ?2",
                params![user_id, id],
            )
            .map_err(|e| format!("SQLite delete error: {e}"))?;
        Ok(n > 0)
    }

    async fn delete_by_topic(
        &self,
        user_id: &str,
        category: MemoryCategory,
        topic: &str,
    ) -> Result<bool, String> {
        let conn = self.lock()?;
        let n = conn
            .execute(
                "DELETE FROM memories WHERE user_id = ?1 AND category = ?2 AND topic = ?3",
                params![user_id, category.as_str(), topic],
            )
            .map_err(|e| format!("SQLite delete error: {e}"))?;
        Ok(n > 0)
    }

    async fn list(&self, user_id: &str) -> Result<Vec<MemoryEntry>, String> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM memories
                 WHERE user_id = ?1 ORDER BY created_at DESC"
            ))
            .map_err(|e| format!("SQLite prepare error: {e}"))?;
        let rows = stmt
            .query_map(params![user_id], row_to_entry)
            .map_err(|e| format!("SQLite query error: {e}"))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

// ─── FTS query sanitisation ───────────────────────────────────────────────────

/// Convert a free-text query into a safe FTS5 MATCH expression.
///
/// Each whitespace-separated token is double-quoted so FTS5 treats it as
/// a literal phrase rather than an operator.  Double-quote characters
/// inside tokens are escaped by doubling them.
fn sanitise_fts_query(query: &str) -> String {
    let tokens: Vec<String> = query
        .split_whitespace()
        .map(|tok| {
            let escaped = tok.replace('"', "\"\"");
            format!("\"{escaped}\"")
        })
        .collect();
    tokens.join(" OR ")
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn make_store() -> SqliteMemoryStore {
        SqliteMemoryStore::in_memory().expect("in-memory SQLite store")
    }

    #[tokio::test]
    async fn save_and_search_round_trip() {
        let store = make_store();
        store
            .save("u1", MemoryCategory::User, "name", "The user's name is Alice")
            .await
            .unwrap();

        let results = store.search("u1", "Alice", 5).await.unwrap();
        assert!(!results.is_empty(), "stored entry should be found");
        assert_eq!(results[0].topic, "name");
    }

    #[tokio::test]
    async fn save_is_an_upsert_on_user_category_topic() {
        let store = make_store();
        let first = store
            .save("u1", MemoryCategory::Preference, "editor", "vim")
            .await
            .unwrap();
        let second = store
            .save("u1", MemoryCategory::Preference, "editor", "helix")
            .await
            .unwrap();

        assert_eq!(first.id, second.id, "upsert must preserve the id");
        assert_eq!(second.content, "helix");

        let all = store.list("u1").await.unwrap();
        assert_eq!(all.len(), 1, "no duplicate rows after upsert");
    }

    #[tokio::test]
    async fn same_topic_different_category_is_distinct() {
        let store = make_store();
        store
            .save("u1", MemoryCategory::Fact, "deploy", "deploys run on Fridays")
            .await
            .unwrap();
        store
            .save("u1", MemoryCategory::Project, "deploy", "migrating deploy to CI")
            .await
            .unwrap();
        assert_eq!(store.list("u1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn users_are_isolated() {
        let store = make_store();
        store
            .save("u1", MemoryCategory::Fact, "t", "only for user one")
            .await
            .unwrap();
        let results = store.search("u2", "user one", 5).await.unwrap();
        assert!(results.is_empty(), "another user's memories must not leak");
    }

    #[tokio::test]
    async fn search_increments_access_count_once_per_hit() {
        let store = make_store();
        store
            .save("u1", MemoryCategory::Fact, "rust", "rust is a systems language")
            .await
            .unwrap();

        let first = store.search("u1", "rust", 5).await.unwrap();
        assert_eq!(first[0].access_count, 1);

        let second = store.search("u1", "rust", 5).await.unwrap();
        assert_eq!(second[0].access_count, 2);
    }

    #[tokio::test]
    async fn search_misses_do_not_touch_access_count() {
        let store = make_store();
        store
            .save("u1", MemoryCategory::Fact, "rust", "rust is a systems language")
            .await
            .unwrap();
        store.search("u1", "zzz-no-match-zzz", 5).await.unwrap();

        let all = store.list("u1").await.unwrap();
        assert_eq!(all[0].access_count, 0);
    }

    #[tokio::test]
    async fn search_matches_topic_as_well_as_content() {
        let store = make_store();
        store
            .save("u1", MemoryCategory::Environment, "staging-host", "ssh bastion at 10.0.0.2")
            .await
            .unwrap();
        let results = store.search("u1", "staging-host", 5).await.unwrap();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn search_respects_limit() {
        let store = make_store();
        for i in 0..10 {
            store
                .save("u1", MemoryCategory::Fact, &format!("topic-{i}"), "common keyword entry")
                .await
                .unwrap();
        }
        let results = store.search("u1", "common keyword", 3).await.unwrap();
        assert!(results.len() <= 3);
    }

    #[tokio::test]
    async fn search_limit_zero_returns_empty() {
        let store = make_store();
        store
            .save("u1", MemoryCategory::Fact, "t", "content")
            .await
            .unwrap();
        assert!(store.search("u1", "content", 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn get_by_category_filters() {
        let store = make_store();
        store
            .save("u1", MemoryCategory::User, "name", "Alice")
            .await
            .unwrap();
        store
            .save("u1", MemoryCategory::Preference, "editor", "vim")
            .await
            .unwrap();
        let prefs = store
            .get_by_category("u1", MemoryCategory::Preference)
            .await
            .unwrap();
        assert_eq!(prefs.len(), 1);
        assert_eq!(prefs[0].topic, "editor");
    }

    #[tokio::test]
    async fn delete_by_id_and_topic() {
        let store = make_store();
        let entry = store
            .save("u1", MemoryCategory::Fact, "a", "alpha")
            .await
            .unwrap();
        store
            .save("u1", MemoryCategory::Fact, "b", "beta")
            .await
            .unwrap();

        assert!(store.delete_by_id("u1", &entry.id).await.unwrap());
        assert!(!store.delete_by_id("u1", &entry.id).await.unwrap());

        assert!(
            store
                .delete_by_topic("u1", MemoryCategory::Fact, "b")
                .await
                .unwrap()
        );
        assert!(store.list("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn deleted_entries_leave_the_fts_index() {
        let store = make_store();
        let entry = store
            .save("u1", MemoryCategory::Fact, "gone", "ephemeral content")
            .await
            .unwrap();
        store.delete_by_id("u1", &entry.id).await.unwrap();
        let results = store.search("u1", "ephemeral", 5).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn fts_operators_in_query_are_neutralised() {
        let store = make_store();
        store
            .save("u1", MemoryCategory::Fact, "t", "plain content")
            .await
            .unwrap();
        // Must not error even though the raw string contains FTS syntax.
        let results = store.search("u1", "content AND \"unclosed", 5).await.unwrap();
        assert!(results.len() <= 1);
    }

    #[tokio::test]
    async fn open_with_tempfile() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("memory.db");
        let store = SqliteMemoryStore::open(path.to_str().unwrap()).expect("open on disk");
        store
            .save("u1", MemoryCategory::Fact, "persist", "hello world")
            .await
            .unwrap();
        assert!(!store.search("u1", "hello", 5).await.unwrap().is_empty());
    }
}

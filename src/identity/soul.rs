//! The integrity-protected soul file.
//!
//! The soul is the identity section of every system prompt.  Its SHA-256
//! is recorded when the file is loaded and re-verified on every read; a
//! mismatch means something other than the gateway modified the file, so
//! the resource is disabled and the embedded default takes its place.
//! Executor output can never reach the prompt through this path.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};

use serde_json::json;
use sha2::{Digest, Sha256};

use crate::audit::{AuditEventType, AuditLogger};

/// Fallback soul used when no file is configured or verification fails.
pub const DEFAULT_SOUL: &str = include_str!("defaults/SOUL.md");

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

// ─── SoulLoader ───────────────────────────────────────────────────────────────

struct SoulState {
    /// Hash recorded at load time; `None` when the soul is disabled.
    expected_hash: Option<String>,
    disabled: bool,
}

/// Loads and integrity-checks the soul file.
pub struct SoulLoader {
    path: Option<PathBuf>,
    state: Mutex<SoulState>,
}

impl SoulLoader {
    /// Create a loader for `path`.  An empty path means "embedded default
    /// only".  A configured file that cannot be read at startup is a
    /// startup error; a file that later fails verification degrades.
    pub fn new(path: &str) -> Result<Self, String> {
        if path.is_empty() {
            return Ok(Self {
                path: None,
                state: Mutex::new(SoulState {
                    expected_hash: None,
                    disabled: false,
                }),
            });
        }

        let path_buf = PathBuf::from(path);
        let content = fs::read(&path_buf)
            .map_err(|e| format!("failed to read soul file {path_buf:?}: {e}"))?;
        let hash = sha256_hex(&content);
        Ok(Self {
            path: Some(path_buf),
            state: Mutex::new(SoulState {
                expected_hash: Some(hash),
                disabled: false,
            }),
        })
    }

    /// The soul text for prompt assembly.
    ///
    /// Re-reads and re-hashes the file on every call.  On mismatch the
    /// soul is disabled, an audit event is recorded, and the embedded
    /// default is returned — now and on every later read until
    /// [`SoulLoader::rehash`].
    pub fn read(&self, audit: &AuditLogger) -> String {
        let Some(path) = &self.path else {
            return DEFAULT_SOUL.to_string();
        };

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.disabled {
            return DEFAULT_SOUL.to_string();
        }

        match fs::read(path) {
            Ok(content) => {
                let hash = sha256_hex(&content);
                if state.expected_hash.as_deref() == Some(hash.as_str()) {
                    String::from_utf8_lossy(&content).into_owned()
                } else {
                    state.disabled = true;
                    audit.log(
                        AuditEventType::SoulIntegrityFailure,
                        "system",
                        json!({ "path": path.display().to_string() }),
                    );
                    log::warn!("soul: integrity mismatch at {path:?}; using fallback");
                    DEFAULT_SOUL.to_string()
                }
            }
            Err(e) => {
                state.disabled = true;
                audit.log(
                    AuditEventType::SoulIntegrityFailure,
                    "system",
                    json!({ "path": path.display().to_string(), "error": e.to_string() }),
                );
                DEFAULT_SOUL.to_string()
            }
        }
    }

    /// Re-record the on-disk hash after a gateway-approved soul update.
    pub fn rehash(&self) -> Result<(), String> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let content =
            fs::read(path).map_err(|e| format!("failed to re-read soul file: {e}"))?;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.expected_hash = Some(sha256_hex(&content));
        state.disabled = false;
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

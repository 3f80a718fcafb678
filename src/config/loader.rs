//! TOML configuration loading and env-var overrides.
//!
//! # Loading order
//! 1. Parse `~/.wardenclaw/config.toml` (or the path in `WARDENCLAW_CONFIG`)
//! 2. Apply `WARDENCLAW_*` environment variable overrides
//! 3. Fall back to [`GatewayConfig::default()`] if the file is missing
//!
//! A file that exists but fails to parse is a fatal error — the gateway
//! refuses to start on a half-read security configuration.

use std::{
    env, fs,
    path::{Path, PathBuf},
};

use super::schema::GatewayConfig;

// ─── default_config_path ─────────────────────────────────────────────────────

/// Return the default config file path: `~/.wardenclaw/config.toml`.
pub fn default_config_path() -> Result<PathBuf, String> {
    dirs::home_dir()
        .map(|h| h.join(".wardenclaw").join("config.toml"))
        .ok_or_else(|| "could not determine home directory".to_string())
}

// ─── load_config ─────────────────────────────────────────────────────────────

/// Load [`GatewayConfig`] from the given path, falling back to defaults if
/// the file does not exist, then applying environment variable overrides.
pub fn load_config(path: &Path) -> Result<GatewayConfig, String> {
    let mut config = match fs::read_to_string(path) {
        Ok(content) => toml::from_str::<GatewayConfig>(&content)
            .map_err(|e| format!("failed to parse config at {path:?}: {e}"))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => GatewayConfig::default(),
        Err(e) => return Err(format!("failed to read config at {path:?}: {e}")),
    };

    apply_env_overrides(&mut config);
    Ok(config)
}

/// Resolve the config path from `WARDENCLAW_CONFIG` or the default location
/// and load it.
pub fn load_default_config() -> Result<GatewayConfig, String> {
    let path = env::var("WARDENCLAW_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            default_config_path().unwrap_or_else(|_| PathBuf::from("config.toml"))
        });
    load_config(&path)
}

// ─── apply_env_overrides ─────────────────────────────────────────────────────

/// Apply `WARDENCLAW_*` environment variable overrides to `config`.
///
/// Supported overrides:
/// - `WARDENCLAW_AUDIT_DIR`   → `audit.dir`
/// - `WARDENCLAW_SOCKET`      → `transport.socket_path`
/// - `WARDENCLAW_DB`          → `database_path`
/// - `WARDENCLAW_LLM_MODEL`   → `llm.model`
fn apply_env_overrides(config: &mut GatewayConfig) {
    if let Ok(v) = env::var("WARDENCLAW_AUDIT_DIR") {
        config.audit.dir = v;
    }
    if let Ok(v) = env::var("WARDENCLAW_SOCKET") {
        config.transport.socket_path = v;
    }
    if let Ok(v) = env::var("WARDENCLAW_DB") {
        config.database_path = v;
    }
    if let Ok(v) = env::var("WARDENCLAW_LLM_MODEL") {
        config.llm.model = v;
    }
}

// ─── Required environment ────────────────────────────────────────────────────

/// Read the capability-signing secret from `WARDENCLAW_CAPABILITY_SECRET`.
///
/// The secret is process-wide init state; a missing or empty value is a
/// fatal startup error.
pub fn capability_secret() -> Result<Vec<u8>, String> {
    match env::var("WARDENCLAW_CAPABILITY_SECRET") {
        Ok(v) if !v.is_empty() => Ok(v.into_bytes()),
        Ok(_) => Err("WARDENCLAW_CAPABILITY_SECRET is set but empty".to_string()),
        Err(_) => Err("WARDENCLAW_CAPABILITY_SECRET is not set".to_string()),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(unsafe_code)] // env::set_var / remove_var are unsafe in Rust 2024; tests are single-threaded.
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, content: &str) -> PathBuf {
        let path = dir.path().join("config.toml");
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nonexistent.toml");
        let config = load_config(&path).unwrap();
        assert_eq!(config.llm.provider, GatewayConfig::default().llm.provider);
    }

    #[test]
    fn load_partial_config_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"
[llm]
provider = "openai"
"#,
        );
        let config = load_config(&path).unwrap();
        assert_eq!(config.llm.provider, "openai");
        assert_eq!(config.sessions.max_turns, 50);
    }

    #[test]
    fn load_invalid_toml_returns_error() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "this is not valid toml!!!");
        assert!(load_config(&path).is_err(), "invalid TOML should be fatal");
    }

    #[test]
    fn env_override_audit_dir() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("none.toml");
        // SAFETY: single-threaded test context; no other threads read this var.
        unsafe {
            env::set_var("WARDENCLAW_AUDIT_DIR", "/var/log/wardenclaw");
        }
        let config = load_config(&path).unwrap();
        // SAFETY: same as set_var above.
        unsafe {
            env::remove_var("WARDENCLAW_AUDIT_DIR");
        }
        assert_eq!(config.audit.dir, "/var/log/wardenclaw");
    }

    #[test]
    fn capability_secret_missing_is_error() {
        // SAFETY: single-threaded test context.
        unsafe {
            env::remove_var("WARDENCLAW_CAPABILITY_SECRET");
        }
        assert!(capability_secret().is_err());
    }

    #[test]
    fn capability_secret_round_trip() {
        // SAFETY: single-threaded test context.
        unsafe {
            env::set_var("WARDENCLAW_CAPABILITY_SECRET", "s3cret");
        }
        let secret = capability_secret().unwrap();
        // SAFETY: same as set_var above.
        unsafe {
            env::remove_var("WARDENCLAW_CAPABILITY_SECRET");
        }
        assert_eq!(secret, b"s3cret");
    }
}

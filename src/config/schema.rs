//! TOML configuration schema for the gateway.
//!
//! All fields have `#[serde(default)]` so a partially-filled
//! `config.toml` works correctly.  Missing sections fall back to their
//! `Default` impl.
//!
//! Example `~/.wardenclaw/config.toml`:
//! ```toml
//! [llm]
//! provider = "anthropic"
//! model = "claude-sonnet-4-20250514"
//!
//! [executors.shell]
//! image = "wardenclaw/shell-executor:latest"
//! default_timeout_secs = 120
//!
//! [[action_tiers.auto_approve]]
//! tool = "list_directory"
//!
//! [[action_tiers.auto_approve]]
//! tool = "read_file"
//! [action_tiers.auto_approve.conditions]
//! path = "/workspace/**"
//!
//! [[heartbeats]]
//! name = "morning-brief"
//! schedule = "0 0 7 * * *"
//! prompt = "Summarise my calendar for today."
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ─── LlmConfig ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LlmConfig {
    /// Provider id: `"anthropic"`, `"openai"`, `"gemini"` or `"codex"`.
    pub provider: String,
    /// Model identifier passed through to the provider.
    pub model: String,
    /// Maximum tokens per response.
    pub max_tokens: u32,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    /// Request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".to_owned(),
            model: "claude-sonnet-4-20250514".to_owned(),
            max_tokens: 4096,
            api_key_env: "ANTHROPIC_API_KEY".to_owned(),
            request_timeout_secs: 120,
        }
    }
}

// ─── ExecutorConfig ───────────────────────────────────────────────────────────

/// Sandbox policy for one ephemeral executor type (`shell`, `file`, `web`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Container image for this executor.
    pub image: String,
    /// Memory limit in megabytes.
    pub memory_limit_mb: u64,
    /// CPU limit (fractional cores, passed as `--cpus`).
    pub cpu_limit: f64,
    /// Default wall-clock timeout in seconds.
    pub default_timeout_secs: u64,
    /// Default cap on concatenated stdout+stderr, in bytes.
    pub default_max_output: usize,
    /// Whether this executor type gets outbound network access.
    pub network_enabled: bool,
    /// `"structured"` or `"legacy"` browse output (web executor only).
    pub result_format: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            image: "wardenclaw/executor:latest".to_owned(),
            memory_limit_mb: 512,
            cpu_limit: 1.0,
            default_timeout_secs: 120,
            default_max_output: 64 * 1024,
            network_enabled: false,
            result_format: "structured".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ExecutorsConfig {
    pub shell: ExecutorConfig,
    pub file: ExecutorConfig,
    pub web: ExecutorConfig,
}

// ─── MountConfig ──────────────────────────────────────────────────────────────

/// A host directory exposed to executor containers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MountConfig {
    pub host_path: String,
    pub container_path: String,
    #[serde(default)]
    pub read_only: bool,
}

// ─── Action tiers ─────────────────────────────────────────────────────────────

/// One classification rule: matches a tool name, optionally narrowed by
/// glob conditions on individual input fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TierRule {
    pub tool: String,
    /// Field → glob pattern.  All conditions must match; a missing field
    /// means the rule does not match.
    #[serde(default)]
    pub conditions: HashMap<String, String>,
}

/// The three rule lists, walked in order auto-approve → notify →
/// require-approval.  Anything unmatched defaults to require-approval.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ActionTiersConfig {
    pub auto_approve: Vec<TierRule>,
    pub notify: Vec<TierRule>,
    pub require_approval: Vec<TierRule>,
}

// ─── SecurityConfig ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SecurityConfig {
    /// Base allow-list for `browse_web` classification.
    pub trusted_domains: Vec<String>,
    /// Hard cap on capability-token lifetime in seconds.
    pub capability_hard_cap_secs: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            trusted_domains: Vec::new(),
            capability_hard_cap_secs: 900,
        }
    }
}

// ─── Soul / skills ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct SoulConfig {
    /// Path to the integrity-protected soul file.  Empty → embedded default.
    pub file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SkillsConfig {
    /// Directory scanned for skill definition files.
    pub directory: String,
    /// Character budget for inlined `always_load` skill content.
    pub char_budget: usize,
    /// Per-skill enable/disable overrides by skill name.
    pub overrides: HashMap<String, bool>,
}

impl Default for SkillsConfig {
    fn default() -> Self {
        Self {
            directory: String::new(),
            char_budget: 6_000,
            overrides: HashMap::new(),
        }
    }
}

// ─── Heartbeats ───────────────────────────────────────────────────────────────

/// A scheduled synthetic user turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatConfig {
    pub name: String,
    /// Cron expression (six fields, seconds first).
    pub schedule: String,
    pub prompt: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Chat id to deliver the result to; `None` → broadcast notification.
    #[serde(default)]
    pub channel: Option<String>,
}

fn default_true() -> bool {
    true
}

// ─── MCP servers ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct McpResourceLimits {
    pub memory_limit_mb: u64,
    pub cpu_limit: f64,
}

impl Default for McpResourceLimits {
    fn default() -> Self {
        Self {
            memory_limit_mb: 256,
            cpu_limit: 0.5,
        }
    }
}

/// One long-lived MCP plug-in server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct McpServerConfig {
    pub name: String,
    /// Container image; empty → run `command` as a native child process.
    #[serde(default)]
    pub image: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub mounts: Vec<MountConfig>,
    #[serde(default)]
    pub resource_limits: McpResourceLimits,
    /// Hostnames this server may CONNECT to through the proxy.
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    /// Default action tier for this server's tools.
    #[serde(default = "default_mcp_tier")]
    pub default_tier: String,
    #[serde(default)]
    pub include_tools: Vec<String>,
    #[serde(default)]
    pub exclude_tools: Vec<String>,
    #[serde(default)]
    pub max_tools: Option<usize>,
}

fn default_mcp_tier() -> String {
    "require-approval".to_owned()
}

// ─── Transport / approvals / sessions / audit ────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    /// UNIX socket path the bridge transport binds.
    pub socket_path: String,
    /// Per-client outbound frame buffer size.
    pub send_buffer: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            send_buffer: 64,
        }
    }
}

fn default_socket_path() -> String {
    dirs::home_dir()
        .map(|h| h.join(".wardenclaw").join("gateway.sock"))
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|| "/tmp/wardenclaw.sock".to_owned())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApprovalsConfig {
    /// How long a pending approval waits before expiring, in milliseconds.
    pub timeout_ms: u64,
    /// Sweeper period in seconds.
    pub sweep_interval_secs: u64,
}

impl Default for ApprovalsConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5 * 60 * 1000,
            sweep_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionsConfig {
    /// Maximum turns retained per session.
    pub max_turns: usize,
    /// Idle TTL in minutes.
    pub ttl_minutes: i64,
    /// Sweeper period in minutes.
    pub sweep_interval_minutes: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            max_turns: 50,
            ttl_minutes: 60,
            sweep_interval_minutes: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AuditConfig {
    /// Audit directory; overridden by `WARDENCLAW_AUDIT_DIR` when set.
    pub dir: String,
}

// ─── GatewayConfig ────────────────────────────────────────────────────────────

/// Root configuration object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct GatewayConfig {
    pub llm: LlmConfig,
    pub executors: ExecutorsConfig,
    pub mounts: Vec<MountConfig>,
    pub action_tiers: ActionTiersConfig,
    pub security: SecurityConfig,
    pub soul: SoulConfig,
    pub skills: SkillsConfig,
    pub heartbeats: Vec<HeartbeatConfig>,
    pub mcp_servers: Vec<McpServerConfig>,
    pub transport: TransportConfig,
    pub approvals: ApprovalsConfig,
    pub sessions: SessionsConfig,
    pub audit: AuditConfig,
    /// SQLite database path for memory/approval stores.  Empty → in-memory.
    pub database_path: String,
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_produces_defaults() {
        let cfg: GatewayConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.llm.provider, "anthropic");
        assert_eq!(cfg.sessions.max_turns, 50);
        assert_eq!(cfg.approvals.timeout_ms, 300_000);
        assert!(cfg.action_tiers.auto_approve.is_empty());
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let cfg: GatewayConfig = toml::from_str(
            r#"
            [llm]
            model = "claude-3-haiku"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.llm.model, "claude-3-haiku");
        assert_eq!(cfg.llm.provider, "anthropic");
        assert_eq!(cfg.llm.max_tokens, 4096);
    }

    #[test]
    fn tier_rules_parse_with_conditions() {
        let cfg: GatewayConfig = toml::from_str(
            r#"
            [[action_tiers.auto_approve]]
            tool = "read_file"
            [action_tiers.auto_approve.conditions]
            path = "/workspace/**"

            [[action_tiers.notify]]
            tool = "write_file"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.action_tiers.auto_approve.len(), 1);
        let rule = &cfg.action_tiers.auto_approve[0];
        assert_eq!(rule.tool, "read_file");
        assert_eq!(rule.conditions.get("path").unwrap(), "/workspace/**");
        assert_eq!(cfg.action_tiers.notify.len(), 1);
        assert!(cfg.action_tiers.notify[0].conditions.is_empty());
    }

    #[test]
    fn heartbeat_enabled_defaults_to_true() {
        let cfg: GatewayConfig = toml::from_str(
            r#"
            [[heartbeats]]
            name = "ping"
            schedule = "0 */30 * * * *"
            prompt = "Check in."
            "#,
        )
        .unwrap();
        assert_eq!(cfg.heartbeats.len(), 1);
        assert!(cfg.heartbeats[0].enabled);
        assert!(cfg.heartbeats[0].channel.is_none());
    }

    #[test]
    fn mcp_server_defaults() {
        let cfg: GatewayConfig = toml::from_str(
            r#"
            [[mcp_servers]]
            name = "github"
            image = "ghcr.io/acme/mcp-github:1"
            command = "mcp-github"
            allowed_domains = ["api.github.com"]
            "#,
        )
        .unwrap();
        let s = &cfg.mcp_servers[0];
        assert_eq!(s.default_tier, "require-approval");
        assert_eq!(s.resource_limits.memory_limit_mb, 256);
        assert!(s.max_tools.is_none());
    }
}

pub mod loader;
pub mod schema;

pub use loader::{capability_secret, default_config_path, load_config, load_default_config};
pub use schema::{
    ActionTiersConfig, ApprovalsConfig, ExecutorConfig, ExecutorsConfig, GatewayConfig,
    HeartbeatConfig, LlmConfig, McpServerConfig, MountConfig, SecurityConfig, SessionsConfig,
    SkillsConfig, SoulConfig, TierRule, TransportConfig,
};

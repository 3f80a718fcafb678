//! Error types for the gateway.
//!
//! Module-internal operations follow the codebase convention of
//! `Result<T, String>` with formatted context; `GatewayError` is the
//! typed taxonomy used at the binary boundary, where the propagation
//! policy is decided: config/transport failures at startup are fatal
//! (exit code 1), integrity failures degrade, everything else is
//! surfaced per call site.

use thiserror::Error;

/// Errors that can occur in the gateway core.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("LLM provider error: {0}")]
    Llm(String),

    #[error("dispatch error: {0}")]
    Dispatch(String),

    #[error("capability token error: {0}")]
    Capability(String),

    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("MCP server error: {0}")]
    Mcp(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for gateway-boundary operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

impl From<toml::de::Error> for GatewayError {
    fn from(err: toml::de::Error) -> Self {
        GatewayError::Config(err.to_string())
    }
}

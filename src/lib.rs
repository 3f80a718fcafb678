pub mod approval;
pub mod audit;
pub mod capability;
pub mod classifier;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod executor;
pub mod gateway;
pub mod identity;
pub mod llm;
pub mod logging;
pub mod mcp;
pub mod memory;
pub mod orchestrator;
pub mod scheduler;
pub mod session;
pub mod tasks;
pub mod tools;
pub mod transport;

/// Convenience re-exports for the most commonly used traits and types.
///
/// ```rust
/// use wardenclaw::prelude::*;
/// ```
pub mod prelude {
    // Configuration
    pub use crate::config::{GatewayConfig, load_config, load_default_config};

    // LLM abstraction
    pub use crate::llm::provider::{LlmProvider, create_provider};
    pub use crate::llm::types::{
        ChatRequest, ChatResponse, ContentBlock, ConversationTurn, StopReason, TurnRole,
    };

    // Gate + classification
    pub use crate::approval::{ApprovalStatus, GateDecision, GateRequest, HitlGate};
    pub use crate::classifier::ActionTier;

    // Stores
    pub use crate::memory::{MemoryCategory, MemoryEntry, MemoryStore, SqliteMemoryStore};
    pub use crate::session::{SessionStore, TaskSessionStore, TaskStatus};

    // Execution
    pub use crate::executor::{Dispatcher, ExecutorResult, ExecutorTask};
    pub use crate::mcp::McpManager;

    // Gateway assembly
    pub use crate::event_bus::{EventBus, GatewayEvent, TokioBroadcastBus};
    pub use crate::gateway::Gateway;
    pub use crate::transport::{BridgeFrame, GatewayFrame, UnixSocketClient, UnixSocketServer};
}

//! Gateway assembly: stores, gate, dispatcher, MCP manager, transport,
//! sweepers, and the frame-handling loop.
//!
//! Every inbound `socket-request` runs on its own task; turns within one
//! session are serialised by a per-user async mutex.  Core components
//! publish user-facing events on the internal bus; a forwarder task fans
//! them out to every connected bridge.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use serde_json::json;
use tokio::sync::mpsc;

use crate::{
    approval::{ApprovalStore, HitlGate},
    audit::{AuditEventType, AuditLogger},
    config::schema::GatewayConfig,
    error::{GatewayError, GatewayResult},
    event_bus::{EventBus, GatewayEvent, TokioBroadcastBus},
    executor::{Dispatcher, runtime::ContainerRuntime},
    identity::{SkillCatalog, SoulLoader},
    llm::provider::LlmProvider,
    llm::types::ConversationTurn,
    mcp::McpManager,
    memory::{MemoryStore, SqliteMemoryStore},
    orchestrator::{ChatTurn, Orchestrator, prompt::PromptBuilder},
    scheduler::HeartbeatScheduler,
    session::{SessionStore, TaskSessionStore},
    tasks::TaskLoop,
    transport::{
        BridgeFrame, GatewayFrame, ServerEvent, UnixSocketServer,
        protocol::{HeartbeatSummary, MemorySummary, Outgoing, SessionSummary},
    },
};

/// Reply sent when the LLM provider fails mid-turn.
const PROVIDER_DOWN_MESSAGE: &str =
    "I'm temporarily unavailable — the language model could not be reached. Please try again.";

/// Bridge-level prefix that routes a message into the task loop.
const TASK_COMMAND: &str = "/task ";

// ─── Gateway ──────────────────────────────────────────────────────────────────

pub struct Gateway {
    config: GatewayConfig,
    orchestrator: Arc<Orchestrator>,
    task_loop: Arc<TaskLoop>,
    gate: Arc<HitlGate>,
    sessions: Arc<SessionStore>,
    memory: Arc<dyn MemoryStore>,
    mcp: Arc<McpManager>,
    heartbeats: Arc<HeartbeatScheduler>,
    bus: Arc<dyn EventBus>,
    audit: Arc<AuditLogger>,
    server: Arc<UnixSocketServer>,
    /// Per-user turn serialisation.
    session_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Gateway {
    /// Wire the full gateway from config, a provider, and an optional
    /// container runtime, binding the bridge socket.
    pub async fn build(
        config: GatewayConfig,
        provider: Arc<dyn LlmProvider>,
        runtime: Arc<dyn ContainerRuntime>,
        capability_secret: Vec<u8>,
    ) -> GatewayResult<(Arc<Self>, mpsc::Receiver<ServerEvent>)> {
        if config.audit.dir.is_empty() {
            return Err(GatewayError::Config(
                "audit directory is not configured (set WARDENCLAW_AUDIT_DIR)".to_string(),
            ));
        }
        let audit =
            Arc::new(AuditLogger::new(&config.audit.dir).map_err(GatewayError::Config)?);

        // Stores: one database file shared by memory and approvals.
        let (memory, approvals): (Arc<dyn MemoryStore>, Arc<ApprovalStore>) =
            if config.database_path.is_empty() {
                (
                    Arc::new(SqliteMemoryStore::in_memory().map_err(GatewayError::Store)?),
                    Arc::new(ApprovalStore::in_memory().map_err(GatewayError::Store)?),
                )
            } else {
                let conn = rusqlite::Connection::open(&config.database_path)
                    .map_err(|e| GatewayError::Store(format!("SQLite open error: {e}")))?;
                let shared = Arc::new(Mutex::new(conn));
                (
                    Arc::new(
                        SqliteMemoryStore::with_connection(Arc::clone(&shared))
                            .map_err(GatewayError::Store)?,
                    ),
                    Arc::new(
                        ApprovalStore::with_connection(shared).map_err(GatewayError::Store)?,
                    ),
                )
            };

        let bus: Arc<dyn EventBus> = Arc::new(TokioBroadcastBus::new());
        let sessions = SessionStore::new(
            config.sessions.max_turns,
            config.sessions.ttl_minutes,
        );
        let tasks = TaskSessionStore::new();

        // Trusted domains become implicit auto-approve rules for browse_web.
        let mut tiers = config.action_tiers.clone();
        tiers.auto_approve.extend(crate::classifier::trusted_domain_rules(
            &config.security.trusted_domains,
        ));
        let gate = HitlGate::new(
            tiers,
            Arc::clone(&approvals),
            Arc::clone(&bus),
            Arc::clone(&audit),
            config.approvals.timeout_ms,
            config.approvals.sweep_interval_secs,
        );

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&runtime),
            config.executors.clone(),
            config.mounts.clone(),
            config.security.trusted_domains.clone(),
            capability_secret,
            config.security.capability_hard_cap_secs,
        ));

        // Servers with declared domains get their egress through the
        // filtering proxy; bind it only when something will use it.
        let proxy = if config
            .mcp_servers
            .iter()
            .any(|s| !s.allowed_domains.is_empty())
        {
            Some(
                crate::mcp::DomainProxy::start(Arc::clone(&audit))
                    .await
                    .map_err(GatewayError::Mcp)?,
            )
        } else {
            None
        };
        let mcp = McpManager::new(Some(Arc::clone(&runtime)), proxy);
        mcp.boot(&config.mcp_servers).await;

        let soul = Arc::new(SoulLoader::new(&config.soul.file).map_err(GatewayError::Integrity)?);
        audit.log(
            AuditEventType::SoulLoaded,
            "system",
            json!({ "path": config.soul.file }),
        );
        let skills = Arc::new(SkillCatalog::load(&config.skills));
        for skill in skills.enabled_skills(&audit) {
            audit.log(
                AuditEventType::SkillLoaded,
                "system",
                json!({ "skill": skill.name }),
            );
        }
        let prompts = PromptBuilder::new(
            Arc::clone(&soul),
            skills,
            Arc::clone(&memory),
            Arc::clone(&tasks),
            Arc::clone(&audit),
        );

        let orchestrator = Orchestrator::new(
            provider,
            Arc::clone(&gate),
            dispatcher,
            Arc::clone(&mcp),
            Arc::clone(&memory),
            prompts,
            soul,
            Arc::clone(&audit),
            config.llm.model.clone(),
            config.llm.max_tokens,
            config.executors.file.default_max_output,
        );

        let task_loop = TaskLoop::new(
            Arc::clone(&orchestrator),
            Arc::clone(&tasks),
            Arc::clone(&bus),
            crate::tasks::DEFAULT_MAX_ITERATIONS,
        );

        let heartbeats = HeartbeatScheduler::new(&config.heartbeats);

        let (server, events) = UnixSocketServer::start(
            &config.transport.socket_path,
            config.transport.send_buffer,
        )
        .await
        .map_err(GatewayError::Transport)?;

        let gateway = Arc::new(Self {
            config,
            orchestrator,
            task_loop,
            gate,
            sessions,
            memory,
            mcp,
            heartbeats,
            bus,
            audit,
            server,
            session_locks: Mutex::new(HashMap::new()),
        });
        Ok((gateway, events))
    }

    /// Run the gateway: background sweepers, the bus forwarder, the
    /// heartbeat loop, and the frame loop.  Returns when the transport
    /// event stream closes.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<ServerEvent>) {
        self.gate.spawn_sweeper();
        self.spawn_session_sweeper();
        self.spawn_bus_forwarder();
        self.spawn_heartbeat_loop();

        while let Some(event) = events.recv().await {
            match event {
                ServerEvent::Connection(id) => log::debug!("gateway: bridge {id} attached"),
                ServerEvent::Disconnection(id) => log::debug!("gateway: bridge {id} detached"),
                ServerEvent::Message { client_id, frame } => {
                    let gateway = Arc::clone(&self);
                    tokio::spawn(async move {
                        gateway.handle_frame(client_id, frame).await;
                    });
                }
            }
        }
    }

    /// Graceful shutdown: stop the transport and terminate MCP children.
    pub async fn shutdown(&self) {
        self.server.stop().await;
        self.mcp.shutdown().await;
    }

    // ── Background tasks ─────────────────────────────────────────────────

    fn spawn_session_sweeper(self: &Arc<Self>) {
        let gateway = Arc::clone(self);
        let period = Duration::from_secs(
            gateway.config.sessions.sweep_interval_minutes.max(1) * 60,
        );
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                for session in gateway.sessions.sweep_once() {
                    // Grants are keyed by session id; locks by user id.
                    gateway.gate.clear_session(&session.id);
                    gateway
                        .session_locks
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .remove(&session.user_id);
                    let _ = gateway.bus.publish(GatewayEvent::SessionExpired {
                        user_id: session.user_id,
                    });
                }
            }
        });
    }

    /// Map internal events onto bridge frames and broadcast them.
    fn spawn_bus_forwarder(self: &Arc<Self>) {
        let gateway = Arc::clone(self);
        let mut rx = self.bus.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if let Some(frame) = event_to_frame(event) {
                            gateway.server.broadcast(frame).await;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("gateway: bus forwarder lagged {n} events");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    fn spawn_heartbeat_loop(self: &Arc<Self>) {
        let gateway = Arc::clone(self);
        self.heartbeats.spawn(move |heartbeat| {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move {
                let session_id = format!("heartbeat:{}", heartbeat.name);
                let chat_id = heartbeat.channel.clone().unwrap_or_default();
                let outcome = gateway
                    .orchestrator
                    .chat(
                        ChatTurn {
                            session_id: session_id.clone(),
                            chat_id: chat_id.clone(),
                            user_id: session_id.clone(),
                            history: vec![ConversationTurn::user(heartbeat.prompt.clone())],
                        },
                        None,
                    )
                    .await;
                match outcome {
                    Ok(outcome) => {
                        let _ = gateway.bus.publish(GatewayEvent::Notification {
                            chat_id,
                            text: outcome.final_text,
                        });
                    }
                    Err(e) => log::warn!("heartbeat '{}' failed: {e}", heartbeat.name),
                }
            });
        });
    }

    // ── Frame handling ───────────────────────────────────────────────────

    /// Handle one inbound bridge frame.
    pub async fn handle_frame(self: &Arc<Self>, client_id: u64, frame: BridgeFrame) {
        match frame {
            BridgeFrame::SocketRequest {
                request_id,
                message,
                reply_to,
            } => {
                let user_id = message
                    .user_id
                    .clone()
                    .unwrap_or_else(|| reply_to.chat_id.clone());
                self.handle_user_message(
                    client_id,
                    request_id,
                    user_id,
                    message.content,
                    reply_to.chat_id,
                    reply_to.message_id,
                )
                .await;
            }
            BridgeFrame::ApprovalDecision {
                approval_id,
                decision,
            } => {
                self.gate.resolve(&approval_id, decision.to_status());
            }
            BridgeFrame::MemoryList { user_id } => {
                let memories = self
                    .memory
                    .list(&user_id)
                    .await
                    .unwrap_or_default()
                    .into_iter()
                    .map(|m| MemorySummary {
                        id: m.id,
                        category: m.category.to_string(),
                        topic: m.topic,
                        content: m.content,
                    })
                    .collect();
                let _ = self
                    .server
                    .send(client_id, GatewayFrame::MemoryListResponse { memories })
                    .await;
            }
            BridgeFrame::MemoryDelete { user_id, memory_id } => {
                let deleted = self
                    .memory
                    .delete_by_id(&user_id, &memory_id)
                    .await
                    .unwrap_or(false);
                let _ = self
                    .server
                    .send(client_id, GatewayFrame::MemoryDeleteResponse { deleted })
                    .await;
            }
            BridgeFrame::SessionList => {
                let sessions = self
                    .sessions
                    .list()
                    .into_iter()
                    .map(|s| SessionSummary {
                        id: s.id,
                        user_id: s.user_id,
                        turns: s.turns.len(),
                        updated_at: s.updated_at.to_rfc3339(),
                    })
                    .collect();
                let _ = self
                    .server
                    .send(client_id, GatewayFrame::SessionListResponse { sessions })
                    .await;
            }
            BridgeFrame::TaskStop { user_id } => {
                let cancelled = self.task_loop.cancel(&user_id);
                let _ = self
                    .server
                    .send(client_id, GatewayFrame::TaskStopResponse { cancelled })
                    .await;
            }
            BridgeFrame::HeartbeatList => {
                let heartbeats = self
                    .heartbeats
                    .list()
                    .into_iter()
                    .map(|h| HeartbeatSummary {
                        name: h.name,
                        schedule: h.schedule,
                        enabled: h.enabled,
                    })
                    .collect();
                let _ = self
                    .server
                    .send(client_id, GatewayFrame::HeartbeatListResponse { heartbeats })
                    .await;
            }
            BridgeFrame::HeartbeatToggle { name, enabled } => {
                let found = self.heartbeats.toggle(&name, enabled);
                let _ = self
                    .server
                    .send(
                        client_id,
                        GatewayFrame::HeartbeatToggleResponse {
                            name,
                            found,
                            enabled,
                        },
                    )
                    .await;
            }
            BridgeFrame::Auth { action, .. } => {
                let _ = self
                    .server
                    .send(
                        client_id,
                        GatewayFrame::AuthResponse {
                            ok: false,
                            error: Some(format!("auth action '{action}' is handled by the broker")),
                        },
                    )
                    .await;
            }
        }
    }

    async fn handle_user_message(
        self: &Arc<Self>,
        client_id: u64,
        request_id: String,
        user_id: String,
        content: String,
        chat_id: String,
        reply_to_id: Option<String>,
    ) {
        // Serialise turns per user session.
        let lock = {
            let mut locks = self.session_locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(user_id.clone()).or_default())
        };
        let _turn_guard = lock.lock().await;

        let session = self.sessions.get_or_create(&user_id);
        self.audit.log(
            AuditEventType::MessageReceived,
            &session.id,
            json!({ "user": user_id, "chat": chat_id, "len": content.len() }),
        );

        // Bridge command: "/task …" routes into the multi-step task loop.
        let reply = if let Some(request) = content.strip_prefix(TASK_COMMAND) {
            match self.task_loop.execute(&user_id, request, &chat_id).await {
                Ok(outcome) if outcome.completed => outcome.text,
                Ok(outcome) => {
                    if outcome.text.is_empty() {
                        "The task ended without completing.".to_string()
                    } else {
                        outcome.text
                    }
                }
                Err(e) => {
                    log::warn!("gateway: task loop error for {user_id}: {e}");
                    PROVIDER_DOWN_MESSAGE.to_string()
                }
            }
        } else {
            let mut history = session.turns.clone();
            history.push(ConversationTurn::user(content.clone()));

            match self
                .orchestrator
                .chat(
                    ChatTurn {
                        session_id: session.id.clone(),
                        chat_id: chat_id.clone(),
                        user_id: user_id.clone(),
                        history,
                    },
                    None,
                )
                .await
            {
                Ok(outcome) => {
                    // Write the updated history back through the store.
                    self.sessions.set_turns(&user_id, outcome.history);
                    outcome.final_text
                }
                Err(e) => {
                    // Turn aborted: session history unchanged.
                    log::warn!("gateway: turn failed for {user_id}: {e}");
                    self.audit.log(
                        AuditEventType::Error,
                        &session.id,
                        json!({ "error": e }),
                    );
                    PROVIDER_DOWN_MESSAGE.to_string()
                }
            }
        };

        self.audit.log(
            AuditEventType::MessageSent,
            &session.id,
            json!({ "chat": chat_id, "len": reply.len() }),
        );
        let _ = self
            .server
            .send(
                client_id,
                GatewayFrame::SocketResponse {
                    request_id,
                    outgoing: Outgoing {
                        chat_id,
                        content: reply,
                        reply_to_id,
                    },
                },
            )
            .await;
    }

    /// Test/introspection accessor: the user's current session turns.
    pub fn session_turns(&self, user_id: &str) -> Vec<ConversationTurn> {
        self.sessions
            .get(user_id)
            .map(|s| s.turns)
            .unwrap_or_default()
    }
}

/// Map an internal event to its bridge frame, if it has one.
fn event_to_frame(event: GatewayEvent) -> Option<GatewayFrame> {
    match event {
        GatewayEvent::ApprovalRequested {
            approval_id,
            chat_id,
            tool_name,
            tool_input,
            reason,
            plan_context,
        } => Some(GatewayFrame::ApprovalRequest {
            approval_id,
            tool_name,
            tool_input,
            reason,
            plan_context,
            chat_id,
            metadata: None,
        }),
        GatewayEvent::ApprovalExpired {
            approval_id,
            chat_id,
        } => Some(GatewayFrame::ApprovalExpired {
            approval_id,
            chat_id,
        }),
        GatewayEvent::Notification { chat_id, text } => {
            Some(GatewayFrame::Notification { chat_id, text })
        }
        GatewayEvent::TaskProgress { chat_id, text } => {
            Some(GatewayFrame::TaskProgress { chat_id, text })
        }
        // Session expiry is internal housekeeping.
        GatewayEvent::SessionExpired { .. } => None,
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

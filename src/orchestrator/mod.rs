//! The agentic tool-use loop.
//!
//! # Algorithm
//!
//! ```text
//! build system prompt (soul + skills + memories + task state)
//!       │
//!       ▼
//! LLM.chat()  ──► end_turn? ──► append assistant turn, return text
//!       │
//!       ▼ tool_use
//! for each tool_call, in order:
//!   memory tool  → execute in-process (always auto-approve)
//!   other tool   → HITL gate → (dispatcher | MCP manager)
//!   failures/rejections become tool_result text; the loop continues
//!       │
//!       ▼
//! append one tool_results turn; iteration += 1; repeat (max 10)
//! ```
//!
//! The orchestrator is stateless across turns: conversation state lives
//! in the caller-supplied history and is written back by the gateway.

pub mod prompt;

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use serde_json::{Value, json};

use crate::{
    approval::{GateRequest, HitlGate},
    audit::{AuditEventType, AuditLogger},
    classifier::SOUL_UPDATE_TOOL,
    executor::{Dispatcher, ExecutorTask},
    identity::SoulLoader,
    llm::{
        provider::LlmProvider,
        types::{ChatRequest, ContentBlock, ConversationTurn, StopReason, TurnRole},
    },
    mcp::{self, McpManager},
    memory::{MemoryStore, tools as memory_tools},
    tools::{self, ToolSpec},
};

use prompt::PromptBuilder;

/// Hard cap on LLM↔tool iterations per user turn.
pub const MAX_ITERATIONS: usize = 10;

/// Reply used when the iteration cap is hit without a terminal stop.
pub const MAX_ITERATIONS_MESSAGE: &str =
    "I reached the maximum number of tool iterations for this request. \
     Here is where things stand; ask me to continue if you want me to keep going.";

// ─── Turn types ───────────────────────────────────────────────────────────────

/// One user turn handed to the orchestrator.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub session_id: String,
    pub chat_id: String,
    pub user_id: String,
    pub history: Vec<ConversationTurn>,
}

/// What a completed turn produced.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub final_text: String,
    pub history: Vec<ConversationTurn>,
    pub iterations: usize,
}

// ─── Orchestrator ─────────────────────────────────────────────────────────────

pub struct Orchestrator {
    provider: Arc<dyn LlmProvider>,
    gate: Arc<HitlGate>,
    dispatcher: Arc<Dispatcher>,
    mcp: Arc<McpManager>,
    memory: Arc<dyn MemoryStore>,
    prompts: Arc<PromptBuilder>,
    soul: Arc<SoulLoader>,
    audit: Arc<AuditLogger>,
    model: String,
    max_tokens: u32,
    /// Cap applied to every tool result fed back to the LLM.
    max_tool_output: usize,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        gate: Arc<HitlGate>,
        dispatcher: Arc<Dispatcher>,
        mcp: Arc<McpManager>,
        memory: Arc<dyn MemoryStore>,
        prompts: Arc<PromptBuilder>,
        soul: Arc<SoulLoader>,
        audit: Arc<AuditLogger>,
        model: String,
        max_tokens: u32,
        max_tool_output: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            provider,
            gate,
            dispatcher,
            mcp,
            memory,
            prompts,
            soul,
            audit,
            model,
            max_tokens,
            max_tool_output,
        })
    }

    /// Run one user turn to completion.
    ///
    /// A provider transport error aborts the turn (`Err`); everything
    /// tool-local becomes a tool_result and the loop continues.  The
    /// cancel flag is honoured at iteration boundaries only.
    #[tracing::instrument(
        name = "orchestrator.chat",
        skip_all,
        fields(session = %turn.session_id, user = %turn.user_id, history_len = turn.history.len())
    )]
    pub async fn chat(
        &self,
        turn: ChatTurn,
        cancel: Option<Arc<AtomicBool>>,
    ) -> Result<TurnOutcome, String> {
        let mut history = turn.history.clone();
        let last_user_message = history
            .iter()
            .rev()
            .find(|t| t.role == TurnRole::User)
            .map(|t| t.content.joined_text())
            .unwrap_or_default();

        let tools = self.tool_catalog().await;

        for iteration in 0..MAX_ITERATIONS {
            if let Some(flag) = &cancel
                && flag.load(Ordering::SeqCst)
            {
                return Err("cancelled".to_string());
            }

            let system = self.prompts.build(&turn.user_id, &last_user_message).await;

            self.audit.log(
                AuditEventType::LlmRequest,
                &turn.session_id,
                json!({ "iteration": iteration, "history_len": history.len() }),
            );

            let response = self
                .provider
                .chat(ChatRequest {
                    model: self.model.clone(),
                    system,
                    tools: tools.clone(),
                    messages: history.clone(),
                    max_tokens: self.max_tokens,
                })
                .await?;

            self.audit.log(
                AuditEventType::LlmResponse,
                &turn.session_id,
                json!({ "iteration": iteration, "stop_reason": response.stop_reason }),
            );

            if response.stop_reason != StopReason::ToolUse {
                let final_text = response.joined_text();
                history.push(ConversationTurn::assistant_blocks(response.content));
                return Ok(TurnOutcome {
                    final_text,
                    history,
                    iterations: iteration + 1,
                });
            }

            // Assistant turn with the raw interleaved blocks, then every
            // tool call in order.
            let reason = response.joined_text();
            let calls: Vec<(String, String, Value)> = response
                .content
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolCall { id, name, input } => {
                        Some((id.clone(), name.clone(), input.clone()))
                    }
                    _ => None,
                })
                .collect();
            history.push(ConversationTurn::assistant_blocks(response.content));

            let mut results = Vec::with_capacity(calls.len());
            for (call_id, name, input) in calls {
                self.audit.log(
                    AuditEventType::ToolCall,
                    &turn.session_id,
                    json!({ "tool": name, "input": input }),
                );

                let output = self
                    .run_tool(&turn, &name, &input, &reason, &last_user_message)
                    .await;
                let output = truncate_tool_output(output, self.max_tool_output);

                self.audit.log(
                    AuditEventType::ToolResult,
                    &turn.session_id,
                    json!({ "tool": name, "output_len": output.len() }),
                );
                results.push(ContentBlock::tool_result(call_id, output));
            }
            history.push(ConversationTurn::tool_results(results));
        }

        Ok(TurnOutcome {
            final_text: MAX_ITERATIONS_MESSAGE.to_string(),
            history,
            iterations: MAX_ITERATIONS,
        })
    }

    /// Execute one tool call end to end, producing the tool_result text.
    async fn run_tool(
        &self,
        turn: &ChatTurn,
        name: &str,
        input: &Value,
        reason: &str,
        plan_context: &str,
    ) -> String {
        // Memory tools run in-process and skip the gate entirely.
        if memory_tools::is_memory_tool(name) {
            return match memory_tools::execute_memory_tool(
                &self.memory,
                &turn.user_id,
                name,
                input,
            )
            .await
            {
                Ok(output) => output,
                Err(e) => format!("Error: {e}"),
            };
        }

        let decision = self
            .gate
            .gate(GateRequest {
                session_id: turn.session_id.clone(),
                tool_name: name.to_string(),
                tool_input: input.clone(),
                chat_id: turn.chat_id.clone(),
                reason: reason.to_string(),
                plan_context: Some(plan_context.to_string()),
                capability: "{}".to_string(),
            })
            .await;
        if !decision.proceed {
            return decision
                .denial_message
                .unwrap_or_else(|| "The action was not approved.".to_string());
        }

        if name == SOUL_UPDATE_TOOL {
            return self.apply_soul_update(input);
        }

        if mcp::is_mcp_tool(name) {
            return match self.mcp.call_tool(name, input.clone()).await {
                Ok(result) if result.is_error => {
                    format!("Error: {}", result.to_tool_output())
                }
                Ok(result) => result.to_tool_output(),
                Err(e) => format!("Error: {e}"),
            };
        }

        match tools::executor_type_for(name) {
            Some(executor_type) => {
                let result = self
                    .dispatcher
                    .dispatch(
                        executor_type,
                        ExecutorTask {
                            tool: name.to_string(),
                            input: input.clone(),
                            timeout_secs: None,
                        },
                    )
                    .await;
                result.to_tool_output()
            }
            None => format!("Tool '{name}' is not available."),
        }
    }

    /// Replace the soul file with approved content and re-record its hash.
    fn apply_soul_update(&self, input: &Value) -> String {
        let Some(content) = input.get("content").and_then(|v| v.as_str()) else {
            return "Error: missing required parameter 'content'".to_string();
        };
        let Some(path) = self.soul.path() else {
            return "No soul file is configured; the update was not applied.".to_string();
        };
        if let Err(e) = std::fs::write(path, content) {
            return format!("Error: failed to write the soul file: {e}");
        }
        match self.soul.rehash() {
            Ok(()) => "Soul updated.".to_string(),
            Err(e) => format!("Error: soul updated on disk but re-hash failed: {e}"),
        }
    }

    async fn tool_catalog(&self) -> Vec<ToolSpec> {
        let mut catalog = tools::executor_tool_specs();
        catalog.extend(memory_tools::memory_tool_specs());
        catalog.push(tools::soul_update_tool_spec());
        catalog.extend(self.mcp.tool_specs().await);
        catalog
    }
}

fn truncate_tool_output(mut output: String, max_bytes: usize) -> String {
    if output.len() > max_bytes {
        let mut cut = max_bytes;
        while cut > 0 && !output.is_char_boundary(cut) {
            cut -= 1;
        }
        output.truncate(cut);
        output.push_str("\n[output truncated]");
    }
    output
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        approval::{ApprovalStatus, ApprovalStore},
        config::schema::{ActionTiersConfig, ExecutorsConfig, SkillsConfig, TierRule},
        event_bus::{EventBus, GatewayEvent, TokioBroadcastBus},
        executor::runtime::{ContainerRuntime, ContainerSpec},
        identity::{SkillCatalog, SoulLoader},
        llm::types::{ChatResponse, TurnContent},
        memory::SqliteMemoryStore,
        session::TaskSessionStore,
    };
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    // ── Mock LLM provider ───────────────────────────────────────────────

    struct MockProvider {
        responses: Vec<ChatResponse>,
        index: AtomicUsize,
    }

    impl MockProvider {
        fn new(responses: Vec<ChatResponse>) -> Arc<Self> {
            Arc::new(Self {
                responses,
                index: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl LlmProvider for MockProvider {
        async fn chat(&self, _request: ChatRequest) -> Result<ChatResponse, String> {
            let i = self.index.fetch_add(1, Ordering::SeqCst);
            self.responses
                .get(i % self.responses.len())
                .cloned()
                .ok_or_else(|| "no scripted responses".to_string())
        }
        fn provider_name(&self) -> &str {
            "mock"
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl LlmProvider for FailingProvider {
        async fn chat(&self, _request: ChatRequest) -> Result<ChatResponse, String> {
            Err("connection reset".to_string())
        }
        fn provider_name(&self) -> &str {
            "failing"
        }
    }

    // ── Stub container runtime ──────────────────────────────────────────

    struct StubRuntime {
        script: String,
        spawns: Mutex<usize>,
    }

    impl StubRuntime {
        fn new(script: &str) -> Arc<Self> {
            Arc::new(Self {
                script: script.to_string(),
                spawns: Mutex::new(0),
            })
        }
    }

    #[async_trait]
    impl ContainerRuntime for StubRuntime {
        fn binary_name(&self) -> &str {
            "stub"
        }
        fn is_available(&self) -> bool {
            true
        }
        async fn pull_image(&self, _image: &str) -> Result<(), String> {
            Ok(())
        }
        async fn spawn(&self, _spec: &ContainerSpec) -> Result<tokio::process::Child, String> {
            *self.spawns.lock().unwrap() += 1;
            tokio::process::Command::new("sh")
                .arg("-c")
                .arg(&self.script)
                .stdin(std::process::Stdio::piped())
                .stdout(std::process::Stdio::piped())
                .stderr(std::process::Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| e.to_string())
        }
        async fn remove(&self, _name: &str) -> Result<(), String> {
            Ok(())
        }
    }

    // ── Fixture ─────────────────────────────────────────────────────────

    struct Fixture {
        orchestrator: Arc<Orchestrator>,
        bus: Arc<dyn EventBus>,
        gate: Arc<HitlGate>,
        memory: Arc<dyn MemoryStore>,
        soul: Arc<SoulLoader>,
        runtime: Arc<StubRuntime>,
        _dirs: Vec<tempfile::TempDir>,
    }

    fn fixture(
        provider: Arc<dyn LlmProvider>,
        tiers: ActionTiersConfig,
        runtime_script: &str,
    ) -> Fixture {
        fixture_with_soul(provider, tiers, runtime_script, "")
    }

    fn fixture_with_soul(
        provider: Arc<dyn LlmProvider>,
        tiers: ActionTiersConfig,
        runtime_script: &str,
        soul_path: &str,
    ) -> Fixture {
        let audit_dir = tempfile::tempdir().unwrap();
        let audit = Arc::new(AuditLogger::new(audit_dir.path()).unwrap());
        let bus: Arc<dyn EventBus> = Arc::new(TokioBroadcastBus::new());
        let approval_store = Arc::new(ApprovalStore::in_memory().unwrap());
        let gate = HitlGate::new(
            tiers,
            approval_store,
            Arc::clone(&bus),
            Arc::clone(&audit),
            60_000,
            1,
        );
        let runtime = StubRuntime::new(runtime_script);
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&runtime) as Arc<dyn ContainerRuntime>,
            ExecutorsConfig::default(),
            vec![],
            vec![],
            b"test-secret".to_vec(),
            900,
        ));
        let mcp = McpManager::new(None, None);
        let memory: Arc<dyn MemoryStore> = Arc::new(SqliteMemoryStore::in_memory().unwrap());
        let soul = Arc::new(SoulLoader::new(soul_path).unwrap());
        let prompts = PromptBuilder::new(
            Arc::clone(&soul),
            Arc::new(SkillCatalog::load(&SkillsConfig::default())),
            Arc::clone(&memory),
            TaskSessionStore::new(),
            Arc::clone(&audit),
        );
        let orchestrator = Orchestrator::new(
            provider,
            Arc::clone(&gate),
            dispatcher,
            mcp,
            Arc::clone(&memory),
            prompts,
            Arc::clone(&soul),
            audit,
            "mock-model".to_string(),
            1024,
            64 * 1024,
        );
        Fixture {
            orchestrator,
            bus,
            gate,
            memory,
            soul,
            runtime,
            _dirs: vec![audit_dir],
        }
    }

    fn turn(text: &str) -> ChatTurn {
        ChatTurn {
            session_id: "s1".to_string(),
            chat_id: "c1".to_string(),
            user_id: "u1".to_string(),
            history: vec![ConversationTurn::user(text)],
        }
    }

    fn end_turn(text: &str) -> ChatResponse {
        ChatResponse {
            stop_reason: StopReason::EndTurn,
            content: vec![ContentBlock::text(text)],
        }
    }

    fn tool_use(id: &str, name: &str, input: Value) -> ChatResponse {
        ChatResponse {
            stop_reason: StopReason::ToolUse,
            content: vec![
                ContentBlock::text("working on it"),
                ContentBlock::ToolCall {
                    id: id.to_string(),
                    name: name.to_string(),
                    input,
                },
            ],
        }
    }

    fn auto_tier(tool: &str) -> ActionTiersConfig {
        ActionTiersConfig {
            auto_approve: vec![TierRule {
                tool: tool.to_string(),
                conditions: Default::default(),
            }],
            notify: vec![],
            require_approval: vec![],
        }
    }

    // ── Scenarios ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn simple_chat_appends_assistant_turn() {
        let f = fixture(
            MockProvider::new(vec![end_turn("Hello!")]),
            ActionTiersConfig::default(),
            "true",
        );
        let outcome = f.orchestrator.chat(turn("Hi"), None).await.unwrap();
        assert_eq!(outcome.final_text, "Hello!");
        assert_eq!(outcome.history.len(), 2, "user + assistant");
        assert_eq!(outcome.iterations, 1);
    }

    #[tokio::test]
    async fn auto_approved_tool_dispatches_and_continues() {
        let f = fixture(
            MockProvider::new(vec![
                tool_use("t1", "list_directory", json!({"path": "/workspace"})),
                end_turn("Files: a.txt, b.txt"),
            ]),
            auto_tier("list_directory"),
            r#"echo '{"success":true,"exit_code":0,"stdout":"a.txt b.txt","stderr":""}'"#,
        );
        let mut rx = f.bus.subscribe();

        let outcome = f.orchestrator.chat(turn("What files?"), None).await.unwrap();
        assert_eq!(outcome.final_text, "Files: a.txt, b.txt");
        assert!(rx.try_recv().is_err(), "no approval frames for auto-approved calls");

        // user, assistant(tool_call), tool_results, assistant(final).
        assert_eq!(outcome.history.len(), 4);
        let tool_results: usize = outcome
            .history
            .iter()
            .map(|t| {
                t.content
                    .tool_calls()
                    .len()
            })
            .sum();
        let result_blocks: usize = outcome
            .history
            .iter()
            .filter(|t| t.role == TurnRole::ToolResults)
            .map(|t| match &t.content {
                TurnContent::Blocks(blocks) => blocks.len(),
                _ => 0,
            })
            .sum();
        assert_eq!(tool_results, result_blocks, "one result per call");
        assert_eq!(*f.runtime.spawns.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn rejected_tool_never_dispatches() {
        let f = fixture(
            MockProvider::new(vec![
                tool_use("t1", "run_shell_command", json!({"command": "rm -rf /"})),
                end_turn("Understood, I won't do that."),
            ]),
            ActionTiersConfig::default(),
            "true",
        );
        let mut rx = f.bus.subscribe();
        let gate = Arc::clone(&f.gate);

        // Resolve the approval as rejected as soon as it appears.
        tokio::spawn(async move {
            loop {
                if let Ok(GatewayEvent::ApprovalRequested { approval_id, .. }) = rx.recv().await {
                    gate.resolve(&approval_id, ApprovalStatus::Rejected);
                    break;
                }
            }
        });

        let outcome = f
            .orchestrator
            .chat(turn("clean the disk"), None)
            .await
            .unwrap();
        assert_eq!(outcome.final_text, "Understood, I won't do that.");
        assert_eq!(*f.runtime.spawns.lock().unwrap(), 0, "dispatcher never invoked");

        // The rejection is visible to the LLM as a tool result.
        let results_turn = outcome
            .history
            .iter()
            .find(|t| t.role == TurnRole::ToolResults)
            .unwrap();
        match &results_turn.content {
            TurnContent::Blocks(blocks) => match &blocks[0] {
                ContentBlock::ToolResult { content, .. } => {
                    assert!(content.contains("rejected by the user"))
                }
                other => panic!("unexpected block: {other:?}"),
            },
            other => panic!("unexpected content: {other:?}"),
        }
    }

    #[tokio::test]
    async fn memory_tools_run_in_process_without_gate() {
        let f = fixture(
            MockProvider::new(vec![
                tool_use(
                    "t1",
                    "save_memory",
                    json!({"category": "preference", "topic": "editor", "content": "uses helix"}),
                ),
                end_turn("Noted."),
            ]),
            ActionTiersConfig::default(),
            "true",
        );
        let mut rx = f.bus.subscribe();

        let outcome = f
            .orchestrator
            .chat(turn("remember my editor"), None)
            .await
            .unwrap();
        assert_eq!(outcome.final_text, "Noted.");
        assert!(rx.try_recv().is_err(), "memory tools bypass the gate");

        let saved = f.memory.list("u1").await.unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].topic, "editor");
    }

    #[tokio::test]
    async fn halts_at_max_iterations() {
        // The model calls save_memory forever.
        let f = fixture(
            MockProvider::new(vec![tool_use(
                "t1",
                "save_memory",
                json!({"category": "fact", "topic": "loop", "content": "again"}),
            )]),
            ActionTiersConfig::default(),
            "true",
        );
        let outcome = f.orchestrator.chat(turn("loop forever"), None).await.unwrap();
        assert_eq!(outcome.final_text, MAX_ITERATIONS_MESSAGE);
        assert_eq!(outcome.iterations, MAX_ITERATIONS);
    }

    #[tokio::test]
    async fn provider_error_aborts_the_turn() {
        let f = fixture(
            Arc::new(FailingProvider),
            ActionTiersConfig::default(),
            "true",
        );
        let err = f.orchestrator.chat(turn("hi"), None).await.unwrap_err();
        assert!(err.contains("connection reset"));
    }

    #[tokio::test]
    async fn cancel_flag_stops_before_llm_call() {
        let f = fixture(
            MockProvider::new(vec![end_turn("should not be reached")]),
            ActionTiersConfig::default(),
            "true",
        );
        let flag = Arc::new(AtomicBool::new(true));
        let err = f
            .orchestrator
            .chat(turn("hi"), Some(flag))
            .await
            .unwrap_err();
        assert_eq!(err, "cancelled");
    }

    #[tokio::test]
    async fn unknown_tool_produces_error_result_and_continues() {
        let f = fixture(
            MockProvider::new(vec![
                tool_use("t1", "teleport", json!({})),
                end_turn("That tool does not exist."),
            ]),
            auto_tier("teleport"),
            "true",
        );
        let outcome = f.orchestrator.chat(turn("teleport me"), None).await.unwrap();
        assert_eq!(outcome.final_text, "That tool does not exist.");
    }

    #[tokio::test]
    async fn approved_soul_update_rewrites_and_rehashes() {
        let soul_dir = tempfile::tempdir().unwrap();
        let soul_path = soul_dir.path().join("SOUL.md");
        std::fs::write(&soul_path, "original identity").unwrap();

        let f = fixture_with_soul(
            MockProvider::new(vec![
                tool_use(
                    "t1",
                    SOUL_UPDATE_TOOL,
                    json!({"content": "refreshed identity"}),
                ),
                end_turn("Done."),
            ]),
            ActionTiersConfig::default(),
            "true",
            soul_path.to_str().unwrap(),
        );

        let mut rx = f.bus.subscribe();
        let gate = Arc::clone(&f.gate);
        tokio::spawn(async move {
            loop {
                if let Ok(GatewayEvent::ApprovalRequested { approval_id, .. }) = rx.recv().await {
                    gate.resolve(&approval_id, ApprovalStatus::Approved);
                    break;
                }
            }
        });

        let outcome = f
            .orchestrator
            .chat(turn("update your soul"), None)
            .await
            .unwrap();
        assert_eq!(outcome.final_text, "Done.");
        assert_eq!(
            std::fs::read_to_string(&soul_path).unwrap(),
            "refreshed identity"
        );

        // The new content passes integrity verification.
        let audit_dir = tempfile::tempdir().unwrap();
        let audit = AuditLogger::new(audit_dir.path()).unwrap();
        assert_eq!(f.soul.read(&audit), "refreshed identity");
    }

    #[test]
    fn tool_output_truncation() {
        let out = truncate_tool_output("x".repeat(100), 10);
        assert!(out.starts_with("xxxxxxxxxx"));
        assert!(out.ends_with("[output truncated]"));
    }
}

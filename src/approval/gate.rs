//! Human-in-the-loop gate.
//!
//! Every non-memory tool call passes through [`HitlGate::gate`] before
//! execution:
//!
//! ```text
//! classify(tool, input)
//!   auto-approve      → proceed
//!   notify            → publish Notification (before dispatch) → proceed
//!   require-approval  → create Approval row → publish ApprovalRequested
//!                       → await rendezvous (decision | expiry sweeper)
//! ```
//!
//! The rendezvous is a `tokio::sync::oneshot` keyed by approval id:
//! whoever resolves the store row first (bridge decision or sweeper)
//! fires the channel; later resolutions find the row terminal and are
//! no-ops.
//!
//! A per-session grant set records `session-approved` decisions so a
//! repeat of the same `(tool, canonical input)` in the same session is
//! downgraded to notify.  `propose_soul_update` is exempt.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use serde_json::{Value, json};
use tokio::sync::oneshot;

use crate::{
    audit::{AuditEventType, AuditLogger},
    classifier::{self, ActionTier, SOUL_UPDATE_TOOL},
    config::schema::ActionTiersConfig,
    event_bus::{EventBus, GatewayEvent},
};

use super::store::{ApprovalStatus, ApprovalStore, NewApproval};

// ─── Request / decision types ─────────────────────────────────────────────────

/// What the orchestrator hands the gate for one tool call.
#[derive(Debug, Clone)]
pub struct GateRequest {
    pub session_id: String,
    pub tool_name: String,
    pub tool_input: Value,
    pub chat_id: String,
    /// Assistant text accompanying the call, shown to the approver.
    pub reason: String,
    /// Last user message, shown to the approver as plan context.
    pub plan_context: Option<String>,
    /// Serialised capability claims the call would execute under.
    pub capability: String,
}

/// The gate's verdict on one tool call.
#[derive(Debug, Clone)]
pub struct GateDecision {
    pub proceed: bool,
    pub tier: ActionTier,
    pub approval_id: Option<String>,
    /// Natural-language text for the tool_result when `proceed` is false.
    pub denial_message: Option<String>,
}

impl GateDecision {
    fn allow(tier: ActionTier, approval_id: Option<String>) -> Self {
        Self {
            proceed: true,
            tier,
            approval_id,
            denial_message: None,
        }
    }

    fn deny(tier: ActionTier, approval_id: String, message: impl Into<String>) -> Self {
        Self {
            proceed: false,
            tier,
            approval_id: Some(approval_id),
            denial_message: Some(message.into()),
        }
    }
}

struct PendingRendezvous {
    tx: oneshot::Sender<ApprovalStatus>,
}

// ─── HitlGate ─────────────────────────────────────────────────────────────────

/// Classification + approval coordinator.
pub struct HitlGate {
    tiers: ActionTiersConfig,
    store: Arc<ApprovalStore>,
    bus: Arc<dyn EventBus>,
    audit: Arc<AuditLogger>,
    pending: Mutex<HashMap<String, PendingRendezvous>>,
    /// `session_id` → set of granted `(tool_name, canonical_input_key)`.
    session_grants: Mutex<HashMap<String, HashSet<(String, String)>>>,
    timeout_ms: u64,
    sweep_interval_secs: u64,
}

impl HitlGate {
    pub fn new(
        tiers: ActionTiersConfig,
        store: Arc<ApprovalStore>,
        bus: Arc<dyn EventBus>,
        audit: Arc<AuditLogger>,
        timeout_ms: u64,
        sweep_interval_secs: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            tiers,
            store,
            bus,
            audit,
            pending: Mutex::new(HashMap::new()),
            session_grants: Mutex::new(HashMap::new()),
            timeout_ms,
            sweep_interval_secs,
        })
    }

    // ── Gate ─────────────────────────────────────────────────────────────

    /// Tier a tool call and, for require-approval, block until a human
    /// decision or expiry.
    pub async fn gate(&self, req: GateRequest) -> GateDecision {
        let mut tier = classifier::classify(&req.tool_name, &req.tool_input, &self.tiers);

        // Session-grant downgrade; soul updates always get a full approval.
        if tier == ActionTier::RequireApproval
            && req.tool_name != SOUL_UPDATE_TOOL
            && self.has_grant(&req.session_id, &req.tool_name, &req.tool_input)
        {
            tier = ActionTier::Notify;
        }

        self.audit.log(
            AuditEventType::ActionClassified,
            &req.session_id,
            json!({ "tool": req.tool_name, "tier": tier.as_str() }),
        );

        match tier {
            ActionTier::AutoApprove => GateDecision::allow(tier, None),
            ActionTier::Notify => {
                // Emit before dispatch so the user is informed even if the
                // dispatch stalls.
                let _ = self.bus.publish(GatewayEvent::Notification {
                    chat_id: req.chat_id.clone(),
                    text: format!("Running `{}` ({})", req.tool_name, req.reason),
                });
                GateDecision::allow(tier, None)
            }
            ActionTier::RequireApproval => self.await_approval(req).await,
        }
    }

    async fn await_approval(&self, req: GateRequest) -> GateDecision {
        let approval = match self.store.create(NewApproval {
            session_id: req.session_id.clone(),
            tool_name: req.tool_name.clone(),
            tool_input: req.tool_input.to_string(),
            capability: req.capability.clone(),
            reason: req.reason.clone(),
            plan_context: req.plan_context.clone().unwrap_or_default(),
        }) {
            Ok(a) => a,
            Err(e) => {
                log::error!("gate: failed to persist approval: {e}");
                return GateDecision {
                    proceed: false,
                    tier: ActionTier::RequireApproval,
                    approval_id: None,
                    denial_message: Some(
                        "The action could not be queued for approval and was not executed."
                            .to_string(),
                    ),
                };
            }
        };

        self.audit.log(
            AuditEventType::ApprovalRequested,
            &req.session_id,
            json!({ "approval_id": approval.id, "tool": req.tool_name }),
        );

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(approval.id.clone(), PendingRendezvous { tx });

        let _ = self.bus.publish(GatewayEvent::ApprovalRequested {
            approval_id: approval.id.clone(),
            chat_id: req.chat_id.clone(),
            tool_name: req.tool_name.clone(),
            tool_input: req.tool_input.clone(),
            reason: req.reason.clone(),
            plan_context: req.plan_context.clone(),
        });

        // The sweeper is the canonical expiry source; the extra margin here
        // only guards against a stalled sweeper task.
        let hard_wait =
            Duration::from_millis(self.timeout_ms + 2 * self.sweep_interval_secs * 1000);
        let status = match tokio::time::timeout(hard_wait, rx).await {
            Ok(Ok(status)) => status,
            // Sender dropped or hard timeout: force expiry, then read the
            // row in case a decision raced us.
            _ => {
                let _ = self.store.resolve(&approval.id, ApprovalStatus::Expired);
                self.pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&approval.id);
                self.store
                    .get_by_id(&approval.id)
                    .ok()
                    .flatten()
                    .map(|a| a.status)
                    .unwrap_or(ApprovalStatus::Expired)
            }
        };

        self.audit.log(
            AuditEventType::ApprovalResolved,
            &req.session_id,
            json!({ "approval_id": approval.id, "outcome": status.as_str() }),
        );

        match status {
            ApprovalStatus::Approved => {
                GateDecision::allow(ActionTier::RequireApproval, Some(approval.id))
            }
            ApprovalStatus::SessionApproved => {
                self.record_grant(&req.session_id, &req.tool_name, &req.tool_input);
                GateDecision::allow(ActionTier::RequireApproval, Some(approval.id))
            }
            ApprovalStatus::Rejected => GateDecision::deny(
                ActionTier::RequireApproval,
                approval.id,
                format!("The `{}` action was rejected by the user.", req.tool_name),
            ),
            ApprovalStatus::Expired | ApprovalStatus::Pending => {
                let _ = self.bus.publish(GatewayEvent::ApprovalExpired {
                    approval_id: approval.id.clone(),
                    chat_id: req.chat_id.clone(),
                });
                GateDecision::deny(
                    ActionTier::RequireApproval,
                    approval.id,
                    format!(
                        "The approval request for `{}` expired before a decision arrived.",
                        req.tool_name
                    ),
                )
            }
        }
    }

    // ── Resolution ───────────────────────────────────────────────────────

    /// Resolve a pending approval from a bridge decision.
    ///
    /// Returns `true` when this call performed the transition; `false`
    /// when the approval was already terminal (a later decision from any
    /// channel is ignored).
    pub fn resolve(&self, approval_id: &str, status: ApprovalStatus) -> bool {
        match self.store.resolve(approval_id, status) {
            Ok(true) => {
                if let Some(pending) = self
                    .pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(approval_id)
                {
                    let _ = pending.tx.send(status);
                }
                true
            }
            Ok(false) => false,
            Err(e) => {
                log::error!("gate: resolve({approval_id}) failed: {e}");
                false
            }
        }
    }

    /// Spawn the periodic expiry sweeper.  Runs until the gate is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let gate = Arc::clone(self);
        let period = Duration::from_secs(self.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                gate.sweep_once();
            }
        })
    }

    /// Expire stale pending approvals and fire their rendezvous.
    pub fn sweep_once(&self) {
        match self.store.expire_stale_pending(self.timeout_ms) {
            Ok(expired) => {
                for approval in expired {
                    if let Some(pending) = self
                        .pending
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .remove(&approval.id)
                    {
                        let _ = pending.tx.send(ApprovalStatus::Expired);
                    }
                }
            }
            Err(e) => log::error!("gate: expiry sweep failed: {e}"),
        }
    }

    // ── Session grants ───────────────────────────────────────────────────

    fn has_grant(&self, session_id: &str, tool_name: &str, input: &Value) -> bool {
        let key = (tool_name.to_string(), canonical_input_key(tool_name, input));
        self.session_grants
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(session_id)
            .is_some_and(|grants| grants.contains(&key))
    }

    fn record_grant(&self, session_id: &str, tool_name: &str, input: &Value) {
        let key = (tool_name.to_string(), canonical_input_key(tool_name, input));
        self.session_grants
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(session_id.to_string())
            .or_default()
            .insert(key);
    }

    /// Drop all grants for a session (called when the session expires).
    pub fn clear_session(&self, session_id: &str) {
        self.session_grants
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_id);
    }
}

// ─── Canonical input key ──────────────────────────────────────────────────────

/// The portion of a tool input that a session grant keys on.
///
/// File tools key on `path`, shell on `command`, browse on `url`; any
/// other tool keys on its full input with lexicographically sorted keys.
pub fn canonical_input_key(tool_name: &str, input: &Value) -> String {
    let field = match tool_name {
        "read_file" | "write_file" | "list_directory" | "search_files" => Some("path"),
        "run_shell_command" => Some("command"),
        "browse_web" => Some("url"),
        _ => None,
    };
    match field.and_then(|f| input.get(f)) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => sorted_json(input).to_string(),
    }
}

/// Rebuild a JSON value with object keys in sorted order.
fn sorted_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by_key(|(k, _)| k.as_str());
            let mut out = serde_json::Map::new();
            for (k, v) in entries {
                out.insert(k.clone(), sorted_json(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted_json).collect()),
        other => other.clone(),
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::TierRule;
    use crate::event_bus::TokioBroadcastBus;
    use std::collections::HashMap as StdHashMap;

    fn tiers_with_auto(tool: &str) -> ActionTiersConfig {
        ActionTiersConfig {
            auto_approve: vec![TierRule {
                tool: tool.to_string(),
                conditions: StdHashMap::new(),
            }],
            notify: vec![],
            require_approval: vec![],
        }
    }

    fn make_gate(tiers: ActionTiersConfig, timeout_ms: u64) -> (Arc<HitlGate>, Arc<dyn EventBus>) {
        let store = Arc::new(ApprovalStore::in_memory().expect("store"));
        let bus: Arc<dyn EventBus> = Arc::new(TokioBroadcastBus::new());
        let audit_dir = tempfile::tempdir().expect("tempdir");
        let audit = Arc::new(AuditLogger::new(audit_dir.path()).expect("audit"));
        // Leak the tempdir so the logger outlives the test body.
        std::mem::forget(audit_dir);
        let gate = HitlGate::new(tiers, store, Arc::clone(&bus), audit, timeout_ms, 1);
        (gate, bus)
    }

    fn request(tool: &str, input: Value) -> GateRequest {
        GateRequest {
            session_id: "s1".to_string(),
            tool_name: tool.to_string(),
            tool_input: input,
            chat_id: "c1".to_string(),
            reason: "test".to_string(),
            plan_context: Some("do the thing".to_string()),
            capability: "{}".to_string(),
        }
    }

    #[tokio::test]
    async fn auto_approve_proceeds_without_frames() {
        let (gate, bus) = make_gate(tiers_with_auto("list_directory"), 60_000);
        let mut rx = bus.subscribe();

        let decision = gate
            .gate(request("list_directory", json!({"path": "/workspace"})))
            .await;
        assert!(decision.proceed);
        assert_eq!(decision.tier, ActionTier::AutoApprove);
        assert!(decision.approval_id.is_none());
        assert!(rx.try_recv().is_err(), "no frames for auto-approved calls");
    }

    #[tokio::test]
    async fn notify_emits_before_proceeding() {
        let tiers = ActionTiersConfig {
            auto_approve: vec![],
            notify: vec![TierRule {
                tool: "write_file".to_string(),
                conditions: StdHashMap::new(),
            }],
            require_approval: vec![],
        };
        let (gate, bus) = make_gate(tiers, 60_000);
        let mut rx = bus.subscribe();

        let decision = gate
            .gate(request("write_file", json!({"path": "/workspace/a", "content": "x"})))
            .await;
        assert!(decision.proceed);
        assert_eq!(decision.tier, ActionTier::Notify);
        assert!(matches!(
            rx.try_recv().unwrap(),
            GatewayEvent::Notification { .. }
        ));
    }

    #[tokio::test]
    async fn approval_approved_proceeds() {
        let (gate, bus) = make_gate(ActionTiersConfig::default(), 60_000);
        let mut rx = bus.subscribe();

        let gate2 = Arc::clone(&gate);
        let handle = tokio::spawn(async move {
            gate2
                .gate(request("run_shell_command", json!({"command": "make"})))
                .await
        });

        // Wait for the frame, then decide.
        let approval_id = loop {
            if let GatewayEvent::ApprovalRequested { approval_id, .. } = rx.recv().await.unwrap() {
                break approval_id;
            }
        };
        assert!(gate.resolve(&approval_id, ApprovalStatus::Approved));

        let decision = handle.await.unwrap();
        assert!(decision.proceed);
        assert_eq!(decision.approval_id.as_deref(), Some(approval_id.as_str()));
    }

    #[tokio::test]
    async fn approval_rejected_denies_with_message() {
        let (gate, bus) = make_gate(ActionTiersConfig::default(), 60_000);
        let mut rx = bus.subscribe();

        let gate2 = Arc::clone(&gate);
        let handle = tokio::spawn(async move {
            gate2
                .gate(request("run_shell_command", json!({"command": "rm -rf /"})))
                .await
        });

        let approval_id = loop {
            if let GatewayEvent::ApprovalRequested { approval_id, .. } = rx.recv().await.unwrap() {
                break approval_id;
            }
        };
        gate.resolve(&approval_id, ApprovalStatus::Rejected);

        let decision = handle.await.unwrap();
        assert!(!decision.proceed);
        assert!(
            decision.denial_message.unwrap().contains("rejected by the user"),
            "denial text must say the user rejected it"
        );
    }

    #[tokio::test]
    async fn first_resolution_wins() {
        let (gate, bus) = make_gate(ActionTiersConfig::default(), 60_000);
        let mut rx = bus.subscribe();

        let gate2 = Arc::clone(&gate);
        let handle = tokio::spawn(async move {
            gate2
                .gate(request("run_shell_command", json!({"command": "ls"})))
                .await
        });

        let approval_id = loop {
            if let GatewayEvent::ApprovalRequested { approval_id, .. } = rx.recv().await.unwrap() {
                break approval_id;
            }
        };
        assert!(gate.resolve(&approval_id, ApprovalStatus::Rejected));
        assert!(!gate.resolve(&approval_id, ApprovalStatus::Approved), "second decision ignored");

        let decision = handle.await.unwrap();
        assert!(!decision.proceed);
    }

    #[tokio::test]
    async fn session_grant_downgrades_repeat_to_notify() {
        let (gate, bus) = make_gate(ActionTiersConfig::default(), 60_000);
        let mut rx = bus.subscribe();

        let gate2 = Arc::clone(&gate);
        let handle = tokio::spawn(async move {
            gate2
                .gate(request("read_file", json!({"path": "/etc/hosts"})))
                .await
        });
        let approval_id = loop {
            if let GatewayEvent::ApprovalRequested { approval_id, .. } = rx.recv().await.unwrap() {
                break approval_id;
            }
        };
        gate.resolve(&approval_id, ApprovalStatus::SessionApproved);
        assert!(handle.await.unwrap().proceed);

        // Same tool + same path in the same session: notify, no new frame.
        let decision = gate
            .gate(request("read_file", json!({"path": "/etc/hosts"})))
            .await;
        assert!(decision.proceed);
        assert_eq!(decision.tier, ActionTier::Notify);
        assert!(decision.approval_id.is_none());

        // A different path still requires approval — don't wait for it.
        let gate3 = Arc::clone(&gate);
        let pending = tokio::spawn(async move {
            gate3
                .gate(request("read_file", json!({"path": "/etc/shadow"})))
                .await
        });
        let second_id = loop {
            match rx.recv().await.unwrap() {
                GatewayEvent::ApprovalRequested { approval_id, .. } => break approval_id,
                _ => continue,
            }
        };
        gate.resolve(&second_id, ApprovalStatus::Rejected);
        assert!(!pending.await.unwrap().proceed);
    }

    #[tokio::test]
    async fn soul_update_never_downgrades() {
        let (gate, bus) = make_gate(ActionTiersConfig::default(), 60_000);
        let mut rx = bus.subscribe();

        // First call: session-approve it.
        let gate2 = Arc::clone(&gate);
        let handle = tokio::spawn(async move {
            gate2
                .gate(request(SOUL_UPDATE_TOOL, json!({"content": "new soul"})))
                .await
        });
        let first_id = loop {
            if let GatewayEvent::ApprovalRequested { approval_id, .. } = rx.recv().await.unwrap() {
                break approval_id;
            }
        };
        gate.resolve(&first_id, ApprovalStatus::SessionApproved);
        assert!(handle.await.unwrap().proceed);

        // Identical second call must still produce a full approval.
        let gate3 = Arc::clone(&gate);
        let handle = tokio::spawn(async move {
            gate3
                .gate(request(SOUL_UPDATE_TOOL, json!({"content": "new soul"})))
                .await
        });
        let second_id = loop {
            if let GatewayEvent::ApprovalRequested { approval_id, .. } = rx.recv().await.unwrap() {
                break approval_id;
            }
        };
        assert_ne!(second_id, first_id);
        gate.resolve(&second_id, ApprovalStatus::Approved);
        assert!(handle.await.unwrap().proceed);
    }

    #[tokio::test]
    async fn sweeper_expires_and_emits() {
        // 0 ms timeout: everything pending is immediately stale.
        let (gate, bus) = make_gate(ActionTiersConfig::default(), 0);
        let mut rx = bus.subscribe();

        let gate2 = Arc::clone(&gate);
        let handle = tokio::spawn(async move {
            gate2
                .gate(request("run_shell_command", json!({"command": "ls"})))
                .await
        });

        let approval_id = loop {
            if let GatewayEvent::ApprovalRequested { approval_id, .. } = rx.recv().await.unwrap() {
                break approval_id;
            }
        };

        gate.sweep_once();

        let decision = handle.await.unwrap();
        assert!(!decision.proceed);
        assert!(decision.denial_message.unwrap().contains("expired"));

        // ApprovalExpired frame emitted exactly once.
        let mut expirations = 0;
        while let Ok(ev) = rx.try_recv() {
            if matches!(ev, GatewayEvent::ApprovalExpired { approval_id: ref id, .. } if *id == approval_id)
            {
                expirations += 1;
            }
        }
        assert_eq!(expirations, 1);
    }

    // ── canonical_input_key ─────────────────────────────────────────────

    #[test]
    fn canonical_key_uses_path_for_file_tools() {
        let key = canonical_input_key("read_file", &json!({"path": "/a", "extra": 1}));
        assert_eq!(key, "/a");
    }

    #[test]
    fn canonical_key_uses_command_for_shell() {
        let key = canonical_input_key("run_shell_command", &json!({"command": "git status"}));
        assert_eq!(key, "git status");
    }

    #[test]
    fn canonical_key_sorts_unknown_tool_inputs() {
        let a = canonical_input_key("custom_tool", &json!({"b": 2, "a": 1}));
        let b = canonical_input_key("custom_tool", &json!({"a": 1, "b": 2}));
        assert_eq!(a, b);
    }
}

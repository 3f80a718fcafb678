//! The dispatcher: tool call → ephemeral sandboxed container → result.
//!
//! # Lifecycle
//! 1. Mint a capability token scoped to this task (mounts, network,
//!    timeout, output cap).
//! 2. Base64-encode the task payload.
//! 3. Start a fresh hardened container carrying only the token and the
//!    payload in its environment.
//! 4. Enforce a wall-clock timeout equal to the token lifetime; kill on
//!    overrun.
//! 5. Remove the container on every exit path.
//! 6. Parse the last JSON line of stdout as the [`ExecutorResult`];
//!    synthesize a failure if unparseable.

pub mod network;
pub mod runtime;

use std::{sync::Arc, time::Duration};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use uuid::Uuid;

use crate::capability::{self, CapabilityClaims, MountClaim, NetworkPolicy};
use crate::config::schema::{ExecutorConfig, ExecutorsConfig, MountConfig};

use runtime::{ContainerNetwork, ContainerRuntime, ContainerSpec};

/// Bridge network restricted executors attach to (egress filtered
/// host-side, see [`network`]).
pub const EGRESS_BRIDGE: &str = "wardenclaw-egress";

/// Environment variable names the executor entrypoint reads.
pub const ENV_TOKEN: &str = "WARDENCLAW_CAPABILITY_TOKEN";
pub const ENV_TASK: &str = "WARDENCLAW_TASK_B64";

// ─── Task / result types ──────────────────────────────────────────────────────

/// One unit of work handed to an executor container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorTask {
    pub tool: String,
    pub input: Value,
    /// Override of the executor's default timeout.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// What an executor run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorResult {
    pub success: bool,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutorResult {
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 0,
            error: Some(error.into()),
        }
    }

    /// The text fed back to the LLM as the tool result.
    pub fn to_tool_output(&self) -> String {
        if self.success {
            self.stdout.clone()
        } else {
            let detail = self.error.clone().unwrap_or_else(|| self.stderr.clone());
            format!("Execution failed: {detail}")
        }
    }
}

// ─── Dispatcher ───────────────────────────────────────────────────────────────

/// Turns tool calls into sandboxed container invocations.
pub struct Dispatcher {
    runtime: Arc<dyn ContainerRuntime>,
    executors: ExecutorsConfig,
    mounts: Vec<MountConfig>,
    trusted_domains: Vec<String>,
    secret: Vec<u8>,
    hard_cap_secs: u64,
}

impl Dispatcher {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        executors: ExecutorsConfig,
        mounts: Vec<MountConfig>,
        trusted_domains: Vec<String>,
        secret: Vec<u8>,
        hard_cap_secs: u64,
    ) -> Self {
        Self {
            runtime,
            executors,
            mounts,
            trusted_domains,
            secret,
            hard_cap_secs,
        }
    }

    /// Run one task in a fresh sandbox.  Internal failures surface as a
    /// failed [`ExecutorResult`], never as a panic or a hung container.
    #[tracing::instrument(name = "dispatch", skip_all, fields(executor = executor_type, tool = %task.tool))]
    pub async fn dispatch(&self, executor_type: &str, task: ExecutorTask) -> ExecutorResult {
        match self.dispatch_inner(executor_type, task).await {
            Ok(result) => result,
            Err(e) => {
                log::warn!("dispatch: {e}");
                ExecutorResult::failure(e)
            }
        }
    }

    async fn dispatch_inner(
        &self,
        executor_type: &str,
        mut task: ExecutorTask,
    ) -> Result<ExecutorResult, String> {
        let config = self.executor_config(executor_type)?;
        let timeout_secs = task.timeout_secs.unwrap_or(config.default_timeout_secs);

        // The web executor switches between structured and legacy browse
        // output based on config; carry the choice in the task payload.
        if executor_type == "web"
            && let Value::Object(input) = &mut task.input
        {
            input.insert(
                "result_format".to_string(),
                Value::String(config.result_format.clone()),
            );
        }
        let lifetime = capability::token_lifetime_secs(timeout_secs, self.hard_cap_secs);
        let max_output = config.default_max_output;

        // 1. Capability token scoped to exactly this task.
        let now = chrono::Utc::now().timestamp();
        let network = if config.network_enabled {
            NetworkPolicy::Restricted {
                allowed_domains: self.trusted_domains.clone(),
            }
        } else {
            NetworkPolicy::None
        };
        let claims = CapabilityClaims {
            executor_type: executor_type.to_string(),
            mounts: self
                .mounts
                .iter()
                .map(|m| MountClaim {
                    host_path: m.host_path.clone(),
                    container_path: m.container_path.clone(),
                    read_only: m.read_only,
                })
                .collect(),
            network: network.clone(),
            timeout_seconds: timeout_secs,
            max_output_bytes: max_output,
            issued_at: now,
            expires_at: now + lifetime as i64,
        };
        let token = capability::mint(&claims, &self.secret)?;

        // 2. Task payload.
        let payload = serde_json::to_vec(&task)
            .map_err(|e| format!("task serialise error: {e}"))?;
        let payload_b64 = BASE64.encode(payload);

        // 3. Hardened container.
        let name = format!("wc-exec-{}", Uuid::new_v4());
        let mut spec = ContainerSpec {
            name: name.clone(),
            image: config.image.clone(),
            memory_limit_mb: Some(config.memory_limit_mb),
            cpu_limit: Some(config.cpu_limit),
            network: match network {
                NetworkPolicy::None => ContainerNetwork::None,
                NetworkPolicy::Restricted { .. } => {
                    ContainerNetwork::Bridge(EGRESS_BRIDGE.to_string())
                }
            },
            volumes: self
                .mounts
                .iter()
                .map(|m| {
                    if m.read_only {
                        format!("{}:{}:ro", m.host_path, m.container_path)
                    } else {
                        format!("{}:{}", m.host_path, m.container_path)
                    }
                })
                .collect(),
            ..ContainerSpec::default()
        };
        spec.env.insert(ENV_TOKEN.to_string(), token);
        spec.env.insert(ENV_TASK.to_string(), payload_b64);

        let child = self.runtime.spawn(&spec).await?;

        // 4–5. Timeout, collect output, guaranteed teardown.
        let start = Instant::now();
        let wait = tokio::time::timeout(
            Duration::from_secs(lifetime),
            child.wait_with_output(),
        )
        .await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let output = match wait {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                let _ = self.runtime.remove(&name).await;
                return Err(format!("container wait error: {e}"));
            }
            Err(_) => {
                // Dropping the future killed the CLI process; removing by
                // name reaps the container itself.
                let _ = self.runtime.remove(&name).await;
                let mut result = ExecutorResult::failure("timeout");
                result.duration_ms = duration_ms;
                return Ok(result);
            }
        };
        // `--rm` reaps the exited container; this covers runtimes where the
        // CLI exited before the container finished tearing down.
        let _ = self.runtime.remove(&name).await;

        // 6. The executor reports its result as the last JSON line.
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let mut result = parse_result_line(&stdout).unwrap_or_else(|| ExecutorResult {
            success: false,
            exit_code: output.status.code(),
            stdout: stdout.clone(),
            stderr: stderr.clone(),
            duration_ms,
            error: Some("executor produced no parseable result".to_string()),
        });
        result.duration_ms = duration_ms;
        if result.exit_code.is_none() {
            result.exit_code = output.status.code();
        }
        truncate_outputs(&mut result, max_output);
        Ok(result)
    }

    fn executor_config(&self, executor_type: &str) -> Result<&ExecutorConfig, String> {
        match executor_type {
            "shell" => Ok(&self.executors.shell),
            "file" => Ok(&self.executors.file),
            "web" => Ok(&self.executors.web),
            other => Err(format!("unknown executor type '{other}'")),
        }
    }
}

// ─── Result parsing / truncation ──────────────────────────────────────────────

/// Parse the last non-empty line of stdout as an [`ExecutorResult`].
fn parse_result_line(stdout: &str) -> Option<ExecutorResult> {
    let line = stdout.lines().rev().find(|l| !l.trim().is_empty())?;
    serde_json::from_str(line).ok()
}

/// Truncate concatenated stdout+stderr to `max_bytes`, stdout first.
fn truncate_outputs(result: &mut ExecutorResult, max_bytes: usize) {
    truncate_string(&mut result.stdout, max_bytes);
    let remaining = max_bytes.saturating_sub(result.stdout.len());
    truncate_string(&mut result.stderr, remaining);
}

fn truncate_string(s: &mut String, max_bytes: usize) {
    if s.len() <= max_bytes {
        return;
    }
    let mut cut = max_bytes;
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
    s.push_str("\n[output truncated]");
}

// ─── Tests ────────────────────────────────────────────────────────────────────

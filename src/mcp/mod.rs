//! MCP manager: long-lived plug-in servers.
//!
//! Each configured server is a sandboxed child process speaking
//! JSON-RPC 2.0 over stdio through the Model-Context-Protocol handshake
//! (`initialize` → `notifications/initialized` → `tools/list`).
//! Discovered tools are exposed to the orchestrator as
//! `mcp_{server}__{tool}` after include/exclude/max filtering.
//!
//! A crashed server fails its pending calls immediately; the manager
//! attempts one restart with backoff on the next call, then marks the
//! server dead until gateway restart.

pub mod client;
pub mod proxy;

use std::{collections::HashMap, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::Mutex;

use crate::config::schema::McpServerConfig;
use crate::executor::EGRESS_BRIDGE;
use crate::executor::runtime::{ContainerNetwork, ContainerRuntime, ContainerSpec};
use crate::tools::ToolSpec;

use client::{McpChannel, SERVER_GONE};

pub use proxy::DomainProxy;

const PROTOCOL_VERSION: &str = "2024-11-05";
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);
const RESTART_BACKOFF: Duration = Duration::from_secs(2);

// ─── Naming ───────────────────────────────────────────────────────────────────

/// True when `name` routes to an MCP server.
pub fn is_mcp_tool(name: &str) -> bool {
    name.starts_with("mcp_")
}

/// Split `mcp_{server}__{tool}` into `(server, tool)`.
pub fn parse_prefixed(name: &str) -> Option<(&str, &str)> {
    name.strip_prefix("mcp_")?.split_once("__")
}

/// Build the exposed name for a server's tool.
pub fn prefixed_name(server: &str, tool: &str) -> String {
    format!("mcp_{server}__{tool}")
}

// ─── Types ────────────────────────────────────────────────────────────────────

/// A tool exposed by an MCP server, as returned by `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

/// Normalised `tools/call` outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalisedResult {
    pub is_error: bool,
    pub content: Vec<String>,
}

impl NormalisedResult {
    /// Flatten to the tool-result text fed back to the LLM.
    pub fn to_tool_output(&self) -> String {
        self.content.join("\n")
    }
}

struct ServerHandle {
    config: McpServerConfig,
    channel: Option<Arc<McpChannel>>,
    child: Option<tokio::process::Child>,
    tools: Vec<McpTool>,
    restart_attempted: bool,
}

// ─── McpManager ───────────────────────────────────────────────────────────────

/// Owns every configured MCP server.
pub struct McpManager {
    runtime: Option<Arc<dyn ContainerRuntime>>,
    /// Egress proxy for servers with declared `allowed_domains`.
    proxy: Option<Arc<DomainProxy>>,
    servers: Mutex<HashMap<String, ServerHandle>>,
    call_timeout: Duration,
    restart_backoff: Duration,
}

impl McpManager {
    pub fn new(
        runtime: Option<Arc<dyn ContainerRuntime>>,
        proxy: Option<Arc<DomainProxy>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            proxy,
            servers: Mutex::new(HashMap::new()),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            restart_backoff: RESTART_BACKOFF,
        })
    }

    #[cfg(test)]
    fn with_restart_backoff(
        runtime: Option<Arc<dyn ContainerRuntime>>,
        backoff: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            proxy: None,
            servers: Mutex::new(HashMap::new()),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            restart_backoff: backoff,
        })
    }

    /// Boot every configured server.  A server that fails to start is
    /// logged and skipped; its tools are simply absent.
    pub async fn boot(&self, configs: &[McpServerConfig]) {
        let mut servers = self.servers.lock().await;
        for config in configs {
            match self.spawn_server(config).await {
                Ok(handle) => {
                    log::info!(
                        "mcp[{}]: started with {} tool(s)",
                        config.name,
                        handle.tools.len()
                    );
                    servers.insert(config.name.clone(), handle);
                }
                Err(e) => {
                    log::error!("mcp[{}]: failed to start: {e}", config.name);
                    servers.insert(
                        config.name.clone(),
                        ServerHandle {
                            config: config.clone(),
                            channel: None,
                            child: None,
                            tools: vec![],
                            restart_attempted: true,
                        },
                    );
                }
            }
        }
    }

    async fn spawn_server(&self, config: &McpServerConfig) -> Result<ServerHandle, String> {
        let mut child = if config.image.is_empty() || self.runtime.is_none() {
            // Native child process.
            let mut cmd = tokio::process::Command::new(&config.command);
            cmd.args(&config.args)
                .envs(&config.env)
                .stdin(std::process::Stdio::piped())
                .stdout(std::process::Stdio::piped())
                .stderr(std::process::Stdio::null())
                .kill_on_drop(true);
            cmd.spawn()
                .map_err(|e| format!("failed to start '{}': {e}", config.command))?
        } else {
            let runtime = self.runtime.as_ref().ok_or("no container runtime")?;
            let mut env = config.env.clone();
            // Servers with declared domains reach the network only through
            // the filtering proxy.
            if !config.allowed_domains.is_empty()
                && let Some(proxy) = &self.proxy
            {
                let proxy_url = format!("http://{}", proxy.local_addr());
                env.insert("HTTPS_PROXY".to_string(), proxy_url.clone());
                env.insert("HTTP_PROXY".to_string(), proxy_url);
            }
            let spec = ContainerSpec {
                name: format!("wc-mcp-{}", config.name),
                image: config.image.clone(),
                command: config.command.clone(),
                args: config.args.clone(),
                env,
                volumes: config
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
                memory_limit_mb: Some(config.resource_limits.memory_limit_mb),
                cpu_limit: Some(config.resource_limits.cpu_limit),
                network: if config.allowed_domains.is_empty() {
                    ContainerNetwork::None
                } else {
                    ContainerNetwork::Bridge(EGRESS_BRIDGE.to_string())
                },
                ..ContainerSpec::default()
            };
            runtime.spawn(&spec).await?
        };

        let stdin = child.stdin.take().ok_or("MCP child has no stdin")?;
        let stdout = child.stdout.take().ok_or("MCP child has no stdout")?;
        let channel = Arc::new(McpChannel::new(stdin, stdout, &config.name));

        // Register the container's bridge IP with the proxy so its CONNECT
        // requests pass the caller check.
        if !config.image.is_empty()
            && !config.allowed_domains.is_empty()
            && let (Some(runtime), Some(proxy)) = (&self.runtime, &self.proxy)
        {
            let container_name = format!("wc-mcp-{}", config.name);
            for _ in 0..5 {
                match runtime.container_ip(&container_name).await {
                    Ok(Some(ip)) => {
                        proxy.register(ip, &config.name, &config.allowed_domains);
                        break;
                    }
                    Ok(None) => tokio::time::sleep(Duration::from_millis(200)).await,
                    Err(e) => {
                        log::warn!("mcp[{}]: container ip lookup failed: {e}", config.name);
                        break;
                    }
                }
            }
        }

        // ── MCP handshake ────────────────────────────────────────────────
        channel
            .call(
                "initialize",
                Some(json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": "wardenclaw",
                        "version": env!("CARGO_PKG_VERSION"),
                    }
                })),
                self.call_timeout,
            )
            .await?;
        channel.notify("notifications/initialized", None).await?;

        let tools_result = channel.call("tools/list", None, self.call_timeout).await?;
        let raw_tools: Vec<McpTool> = tools_result
            .get("tools")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        let tools = filter_tools(raw_tools, config);

        Ok(ServerHandle {
            config: config.clone(),
            channel: Some(channel),
            child: Some(child),
            tools,
            restart_attempted: false,
        })
    }

    /// Specs for every exposed tool, names prefixed `mcp_{server}__`.
    pub async fn tool_specs(&self) -> Vec<ToolSpec> {
        let servers = self.servers.lock().await;
        let mut specs = Vec::new();
        for (name, handle) in servers.iter() {
            if handle.channel.is_none() {
                continue;
            }
            for tool in &handle.tools {
                specs.push(ToolSpec {
                    name: prefixed_name(name, &tool.name),
                    description: tool.description.clone(),
                    input_schema: if tool.input_schema.is_null() {
                        json!({"type": "object"})
                    } else {
                        tool.input_schema.clone()
                    },
                });
            }
        }
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// Call a prefixed tool, routing to the owning server's channel.
    pub async fn call_tool(
        &self,
        prefixed: &str,
        args: Value,
    ) -> Result<NormalisedResult, String> {
        let (server_name, tool_name) = parse_prefixed(prefixed)
            .ok_or_else(|| format!("'{prefixed}' is not an MCP tool name"))?;

        let channel = self.live_channel(server_name).await?;
        let params = json!({ "name": tool_name, "arguments": args });

        match channel.call("tools/call", Some(params.clone()), self.call_timeout).await {
            Ok(result) => Ok(normalise_result(&result)),
            Err(e) if e == SERVER_GONE => {
                log::warn!("mcp[{server_name}]: channel down, attempting restart");
                let channel = self.restart_once(server_name).await?;
                let result = channel.call("tools/call", Some(params), self.call_timeout).await?;
                Ok(normalise_result(&result))
            }
            Err(e) => Err(e),
        }
    }

    async fn live_channel(&self, server_name: &str) -> Result<Arc<McpChannel>, String> {
        let servers = self.servers.lock().await;
        let handle = servers
            .get(server_name)
            .ok_or_else(|| format!("unknown MCP server '{server_name}'"))?;
        handle
            .channel
            .clone()
            .ok_or_else(|| format!("MCP server '{server_name}' is unavailable"))
    }

    /// One restart attempt per failure; a second failure marks the
    /// server dead.
    async fn restart_once(&self, server_name: &str) -> Result<Arc<McpChannel>, String> {
        {
            let mut servers = self.servers.lock().await;
            let handle = servers
                .get_mut(server_name)
                .ok_or_else(|| format!("unknown MCP server '{server_name}'"))?;
            if handle.restart_attempted {
                handle.channel = None;
                return Err(format!("MCP server '{server_name}' is unavailable"));
            }
            handle.restart_attempted = true;
            handle.channel = None;
        }

        tokio::time::sleep(self.restart_backoff).await;

        let config = {
            let servers = self.servers.lock().await;
            servers
                .get(server_name)
                .map(|h| h.config.clone())
                .ok_or_else(|| format!("unknown MCP server '{server_name}'"))?
        };

        match self.spawn_server(&config).await {
            Ok(mut fresh) => {
                // The restart budget stays spent: one restart per server
                // until gateway restart.
                fresh.restart_attempted = true;
                let channel = fresh
                    .channel
                    .clone()
                    .ok_or_else(|| format!("MCP server '{server_name}' is unavailable"))?;
                self.servers.lock().await.insert(server_name.to_string(), fresh);
                log::info!("mcp[{server_name}]: restarted");
                Ok(channel)
            }
            Err(e) => Err(format!("MCP server '{server_name}' restart failed: {e}")),
        }
    }

    /// Terminate every child and drop the channels.
    pub async fn shutdown(&self) {
        let mut servers = self.servers.lock().await;
        for (name, handle) in servers.iter_mut() {
            handle.channel = None;
            if let Some(child) = handle.child.as_mut() {
                let _ = child.start_kill();
            }
            log::info!("mcp[{name}]: stopped");
        }
    }
}

// ─── Filtering / normalisation ────────────────────────────────────────────────

fn filter_tools(tools: Vec<McpTool>, config: &McpServerConfig) -> Vec<McpTool> {
    let mut filtered: Vec<McpTool> = tools
        .into_iter()
        .filter(|t| {
            config.include_tools.is_empty() || config.include_tools.contains(&t.name)
        })
        .filter(|t| !config.exclude_tools.contains(&t.name))
        .collect();
    if let Some(max) = config.max_tools {
        filtered.truncate(max);
    }
    filtered
}

/// `tools/call` result → `{is_error, content[]}`.
fn normalise_result(result: &Value) -> NormalisedResult {
    let is_error = result
        .get("isError")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let content = result
        .get("content")
        .and_then(|c| c.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    NormalisedResult { is_error, content }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

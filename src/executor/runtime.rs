//! Container runtime abstraction for sandboxed executors.
//!
//! Executors and MCP servers run inside containers started through the
//! Docker or Podman CLI (no daemon-socket client needed).  Every
//! container is started hardened: all capabilities dropped,
//! no-new-privileges, a non-root UID, memory/CPU limits, and
//! `--network=none` unless a network policy says otherwise.
//!
//! # Auto-detection order
//! 1. Podman — preferred (rootless by default, no daemon required)
//! 2. Docker — fallback
//! 3. `None` if neither is found in `$PATH`

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;

// ─── ContainerSpec ────────────────────────────────────────────────────────────

/// Outbound network selection for a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerNetwork {
    /// `--network=none`.
    None,
    /// Attach to a named bridge (egress is filtered host-side).
    Bridge(String),
}

/// Configuration for one sandboxed container run.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Container name (used for teardown on timeout).
    pub name: String,
    /// Container image.
    pub image: String,
    /// Entrypoint command inside the container (empty → image default).
    pub command: String,
    /// Arguments passed to the command.
    pub args: Vec<String>,
    /// Environment variables injected into the container.
    pub env: HashMap<String, String>,
    /// Volume mounts in `host:container[:ro]` format.
    pub volumes: Vec<String>,
    /// Memory limit in megabytes.
    pub memory_limit_mb: Option<u64>,
    /// CPU limit in fractional cores.
    pub cpu_limit: Option<f64>,
    /// Network policy.
    pub network: ContainerNetwork,
    /// UID:GID the entrypoint runs as.
    pub user: String,
}

impl Default for ContainerSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            image: String::new(),
            command: String::new(),
            args: vec![],
            env: HashMap::new(),
            volumes: vec![],
            memory_limit_mb: None,
            cpu_limit: None,
            network: ContainerNetwork::None,
            user: "1000:1000".to_string(),
        }
    }
}

// ─── ContainerRuntime trait ───────────────────────────────────────────────────

/// Abstraction over container runtimes (Docker, Podman, …).
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// CLI binary name used by this runtime (e.g. `"docker"`).
    fn binary_name(&self) -> &str;

    /// `true` when the runtime binary is reachable on this system.
    fn is_available(&self) -> bool;

    /// Pull `image` if it is not already present locally.
    async fn pull_image(&self, image: &str) -> Result<(), String>;

    /// Spawn the container as a child process with stdio piped.
    async fn spawn(&self, spec: &ContainerSpec) -> Result<tokio::process::Child, String>;

    /// Force-remove a running container by name.
    async fn remove(&self, name: &str) -> Result<(), String>;

    /// Bridge IP of a running container, when the runtime can report one.
    /// Used to register MCP containers with the egress proxy.
    async fn container_ip(&self, _name: &str) -> Result<Option<std::net::IpAddr>, String> {
        Ok(None)
    }
}

// ─── Shared arg building ──────────────────────────────────────────────────────

/// Build the hardened `run` argument list shared by Docker and Podman.
pub fn build_run_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        // Remove the container automatically when it exits.
        "--rm".to_string(),
        // Keep stdin open so the caller can write to it.
        "-i".to_string(),
        // Hardening: no capabilities, no privilege escalation, non-root.
        "--cap-drop=ALL".to_string(),
        "--security-opt=no-new-privileges".to_string(),
        format!("--user={}", spec.user),
    ];

    if !spec.name.is_empty() {
        args.push(format!("--name={}", spec.name));
    }

    match &spec.network {
        ContainerNetwork::None => args.push("--network=none".to_string()),
        ContainerNetwork::Bridge(bridge) => args.push(format!("--network={bridge}")),
    }

    if let Some(mem) = spec.memory_limit_mb {
        args.push(format!("--memory={mem}m"));
    }
    if let Some(cpus) = spec.cpu_limit {
        args.push(format!("--cpus={cpus}"));
    }

    for vol in &spec.volumes {
        args.push("-v".to_string());
        args.push(vol.clone());
    }

    // Sorted for deterministic argument lists.
    let mut env: Vec<(&String, &String)> = spec.env.iter().collect();
    env.sort_by_key(|(k, _)| k.as_str());
    for (k, v) in env {
        args.push("-e".to_string());
        args.push(format!("{k}={v}"));
    }

    args.push(spec.image.clone());
    if !spec.command.is_empty() {
        args.push(spec.command.clone());
    }
    args.extend(spec.args.iter().cloned());

    args
}

// ─── DockerRuntime ────────────────────────────────────────────────────────────

/// Container runtime backed by the `docker` CLI.
pub struct DockerRuntime {
    binary: String,
}

impl DockerRuntime {
    pub fn new(binary: String) -> Self {
        Self { binary }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn binary_name(&self) -> &str {
        &self.binary
    }

    fn is_available(&self) -> bool {
        std::path::Path::new(&self.binary).is_file() || which::which(&self.binary).is_ok()
    }

    async fn pull_image(&self, image: &str) -> Result<(), String> {
        run_status(&self.binary, &["pull", image]).await
    }

    async fn spawn(&self, spec: &ContainerSpec) -> Result<tokio::process::Child, String> {
        spawn_run(&self.binary, spec).await
    }

    async fn remove(&self, name: &str) -> Result<(), String> {
        run_status(&self.binary, &["rm", "-f", name]).await
    }

    async fn container_ip(&self, name: &str) -> Result<Option<std::net::IpAddr>, String> {
        inspect_ip(&self.binary, name).await
    }
}

// ─── PodmanRuntime ────────────────────────────────────────────────────────────

/// Container runtime backed by the `podman` CLI.
pub struct PodmanRuntime {
    binary: String,
}

impl PodmanRuntime {
    pub fn new(binary: String) -> Self {
        Self { binary }
    }
}

#[async_trait]
impl ContainerRuntime for PodmanRuntime {
    fn binary_name(&self) -> &str {
        &self.binary
    }

    fn is_available(&self) -> bool {
        std::path::Path::new(&self.binary).is_file() || which::which(&self.binary).is_ok()
    }

    async fn pull_image(&self, image: &str) -> Result<(), String> {
        run_status(&self.binary, &["pull", image]).await
    }

    async fn spawn(&self, spec: &ContainerSpec) -> Result<tokio::process::Child, String> {
        spawn_run(&self.binary, spec).await
    }

    async fn remove(&self, name: &str) -> Result<(), String> {
        run_status(&self.binary, &["rm", "-f", name]).await
    }

    async fn container_ip(&self, name: &str) -> Result<Option<std::net::IpAddr>, String> {
        inspect_ip(&self.binary, name).await
    }
}

// ─── Helpers ──────────────────────────────────────────────────────────────────

async fn inspect_ip(binary: &str, name: &str) -> Result<Option<std::net::IpAddr>, String> {
    let output = tokio::process::Command::new(binary)
        .args([
            "inspect",
            "-f",
            "{{range .NetworkSettings.Networks}}{{.IPAddress}}{{end}}",
            name,
        ])
        .output()
        .await
        .map_err(|e| format!("{binary} inspect failed to start: {e}"))?;
    if !output.status.success() {
        return Ok(None);
    }
    let raw = String::from_utf8_lossy(&output.stdout);
    Ok(raw.trim().parse().ok())
}

async fn run_status(binary: &str, args: &[&str]) -> Result<(), String> {
    let status = tokio::process::Command::new(binary)
        .args(args)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await
        .map_err(|e| format!("{binary} {} failed to start: {e}", args.join(" ")))?;
    if status.success() {
        Ok(())
    } else {
        Err(format!("{binary} {} exited with {status}", args.join(" ")))
    }
}

async fn spawn_run(binary: &str, spec: &ContainerSpec) -> Result<tokio::process::Child, String> {
    let args = build_run_args(spec);
    tokio::process::Command::new(binary)
        .args(&args)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("failed to spawn container: {e}"))
}

/// Detect the best available container runtime.
///
/// Checks Podman first (rootless = smaller attack surface), then Docker.
pub fn detect_runtime() -> Option<Arc<dyn ContainerRuntime>> {
    if let Ok(path) = which::which("podman") {
        return Some(Arc::new(PodmanRuntime::new(path.to_string_lossy().into_owned())));
    }
    if let Ok(path) = which::which("docker") {
        return Some(Arc::new(DockerRuntime::new(path.to_string_lossy().into_owned())));
    }
    None
}

// ─── Tests ────────────────────────────────────────────────────────────────────

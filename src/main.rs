//! Wardenclaw gateway binary.
//!
//! `wardenclaw run` starts the daemon in the foreground: loads config,
//! checks the required environment, wires the core, binds the bridge
//! socket and serves until interrupted.  Exit codes: 0 normal, 1 fatal
//! initialisation failure (missing env, unusable socket, bad config).

use std::{path::PathBuf, process::ExitCode, sync::Arc};

use clap::{Parser, Subcommand};

use wardenclaw::{
    config::{self, GatewayConfig},
    executor::runtime::{self, ContainerRuntime, ContainerSpec},
    gateway::Gateway,
    llm::provider::create_provider,
    logging,
};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "wardenclaw",
    about = "Security-hardened personal AI-agent gateway",
    version,
    long_about = "Headless gateway daemon: receives bridge messages over a UNIX \
                  socket, drives a tool-using LLM, and sandboxes every tool call."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to config.toml (defaults to ~/.wardenclaw/config.toml).
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Override the bridge socket path.
    #[arg(long, global = true, value_name = "PATH")]
    socket: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the gateway in the foreground (default).
    Run,
    /// Parse and validate the configuration, print a summary, and exit.
    CheckConfig,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("wardenclaw: configuration error: {e}");
            return ExitCode::from(1);
        }
    };

    match cli.command.unwrap_or(Commands::Run) {
        Commands::CheckConfig => {
            print_summary(&config);
            ExitCode::SUCCESS
        }
        Commands::Run => match run_gateway(config) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("wardenclaw: fatal: {e}");
                ExitCode::from(1)
            }
        },
    }
}

fn load_config(cli: &Cli) -> Result<GatewayConfig, String> {
    let mut config = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => config::load_default_config()?,
    };
    if let Some(socket) = &cli.socket {
        config.transport.socket_path = socket.to_string_lossy().into_owned();
    }
    Ok(config)
}

fn print_summary(config: &GatewayConfig) {
    println!("provider:        {} ({})", config.llm.provider, config.llm.model);
    println!("socket:          {}", config.transport.socket_path);
    println!(
        "action tiers:    {} auto-approve, {} notify, {} require-approval",
        config.action_tiers.auto_approve.len(),
        config.action_tiers.notify.len(),
        config.action_tiers.require_approval.len()
    );
    println!("mcp servers:     {}", config.mcp_servers.len());
    println!("heartbeats:      {}", config.heartbeats.len());
    println!(
        "container rt:    {}",
        runtime::detect_runtime()
            .map(|r| r.binary_name().to_string())
            .unwrap_or_else(|| "none found".to_string())
    );
}

fn run_gateway(config: GatewayConfig) -> Result<(), String> {
    // Required environment, checked before anything binds.
    let secret = config::capability_secret()?;
    let api_key = std::env::var(&config.llm.api_key_env)
        .map_err(|_| format!("{} is not set", config.llm.api_key_env))?;

    let provider = create_provider(&config.llm, api_key)?;
    let container_runtime: Arc<dyn ContainerRuntime> = match runtime::detect_runtime() {
        Some(rt) => rt,
        None => {
            log::warn!("no container runtime found; tool dispatch will fail until one is installed");
            Arc::new(NullRuntime)
        }
    };

    let tokio_runtime = tokio::runtime::Runtime::new()
        .map_err(|e| format!("failed to start async runtime: {e}"))?;
    tokio_runtime.block_on(async move {
        let (gateway, events) = Gateway::build(config, provider, container_runtime, secret)
            .await
            .map_err(|e| e.to_string())?;

        let run_gateway = Arc::clone(&gateway);
        let run_handle = tokio::spawn(run_gateway.run(events));

        tokio::signal::ctrl_c()
            .await
            .map_err(|e| format!("signal handler error: {e}"))?;
        log::info!("interrupt received, shutting down");
        gateway.shutdown().await;
        run_handle.abort();
        Ok(())
    })
}

// ---------------------------------------------------------------------------
// Null runtime — placeholder when no container runtime is installed.
// ---------------------------------------------------------------------------

struct NullRuntime;

#[async_trait::async_trait]
impl ContainerRuntime for NullRuntime {
    fn binary_name(&self) -> &str {
        "none"
    }

    fn is_available(&self) -> bool {
        false
    }

    async fn pull_image(&self, _image: &str) -> Result<(), String> {
        Err("no container runtime available".to_string())
    }

    async fn spawn(&self, _spec: &ContainerSpec) -> Result<tokio::process::Child, String> {
        Err("no container runtime available".to_string())
    }

    async fn remove(&self, _name: &str) -> Result<(), String> {
        Ok(())
    }
}

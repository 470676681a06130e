//! Backhaul CLI - run the proxy server or an agent
//!
//! The server accepts agent control streams and exposes the tunnel and
//! HTTP CONNECT frontends; the agent runs inside the private network and
//! dials targets on the server's behalf.

use anyhow::{Context, Result};
use backhaul_agent::{Agent, AgentConfig};
use backhaul_server::{ProxyServer, ServerConfig};
use clap::{Args, Parser, Subcommand};
use serde::de::DeserializeOwned;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Backhaul - reach workloads behind NAT through a long-lived agent
#[derive(Parser, Debug)]
#[command(name = "backhaul")]
#[command(about = "Backhaul - reach workloads behind NAT through a long-lived agent")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "info", env = "BACKHAUL_LOG_LEVEL")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the proxy server
    #[command(long_about = r#"
Run the proxy server. Agents connect to the agent address; clients use the
streaming-tunnel frontend or the HTTP CONNECT frontend to reach targets
behind a connected agent.

EXAMPLES:
  # Defaults: agents on 0.0.0.0:8091, tunnel frontend on 127.0.0.1:8090
  backhaul server

  # Also enable the HTTP CONNECT frontend
  backhaul server --connect-addr 127.0.0.1:3128

  # Load settings from a YAML file, overriding the agent address
  backhaul server --config server.yaml --agent-addr 0.0.0.0:9000

ENVIRONMENT VARIABLES:
  BACKHAUL_AGENT_ADDR    Address agents connect to
  BACKHAUL_TUNNEL_ADDR   Streaming-tunnel frontend address
  BACKHAUL_CONNECT_ADDR  HTTP CONNECT frontend address
"#)]
    Server(ServerArgs),

    /// Run an agent inside the private network
    #[command(long_about = r#"
Connect to a proxy server and dial targets on its behalf. Reconnects with
exponential backoff whenever the control stream is lost.

EXAMPLES:
  # Connect to a server, allow only one subnet
  backhaul agent --server proxy.example.com:8091 \
    --agent-id "cluster-a" \
    --allow-network 10.0.0.0/8

  # Load settings from a YAML file
  backhaul agent --config agent.yaml

ENVIRONMENT VARIABLES:
  BACKHAUL_SERVER        Server control address
  BACKHAUL_AGENT_ID      Agent identifier
"#)]
    Agent(AgentArgs),
}

#[derive(Args, Debug)]
struct ServerArgs {
    /// Configuration file (YAML)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Address agents connect to
    #[arg(long, env = "BACKHAUL_AGENT_ADDR")]
    agent_addr: Option<SocketAddr>,

    /// Streaming-tunnel frontend address
    #[arg(long, env = "BACKHAUL_TUNNEL_ADDR")]
    tunnel_addr: Option<SocketAddr>,

    /// Disable the streaming-tunnel frontend
    #[arg(long, conflicts_with = "tunnel_addr")]
    no_tunnel: bool,

    /// HTTP CONNECT frontend address (disabled unless set)
    #[arg(long, env = "BACKHAUL_CONNECT_ADDR")]
    connect_addr: Option<SocketAddr>,

    /// Seconds a dial may stay unanswered by the agent
    #[arg(long)]
    dial_timeout: Option<u64>,

    /// Seconds of control-stream silence after which an agent is dropped
    #[arg(long)]
    idle_timeout: Option<u64>,
}

#[derive(Args, Debug)]
struct AgentArgs {
    /// Configuration file (YAML)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Server control address (e.g., proxy.example.com:8091)
    #[arg(long, env = "BACKHAUL_SERVER")]
    server: Option<String>,

    /// Agent ID (auto-generated if not specified)
    #[arg(long, env = "BACKHAUL_AGENT_ID")]
    agent_id: Option<String>,

    /// Network the agent may dial (CIDR, repeatable)
    #[arg(long = "allow-network")]
    allow_networks: Vec<String>,

    /// Port the agent may dial (repeatable)
    #[arg(long = "allow-port")]
    allow_ports: Vec<u16>,

    /// Maximum reconnection attempts (unlimited if not set)
    #[arg(long)]
    max_reconnect_attempts: Option<usize>,
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(log_level)
            .with_context(|| format!("Invalid log level: {}", log_level))?,
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

/// Load a YAML configuration file
fn load_config_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Merge CLI args over the config file, giving precedence to CLI args
fn build_server_config(args: ServerArgs) -> Result<ServerConfig> {
    let mut config: ServerConfig = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            load_config_file(path)?
        }
        None => ServerConfig::default(),
    };

    if let Some(addr) = args.agent_addr {
        config.agent_addr = addr;
    }
    if args.no_tunnel {
        config.tunnel_addr = None;
    } else if args.tunnel_addr.is_some() {
        config.tunnel_addr = args.tunnel_addr;
    }
    if args.connect_addr.is_some() {
        config.connect_addr = args.connect_addr;
    }
    if let Some(secs) = args.dial_timeout {
        config.dial_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = args.idle_timeout {
        config.idle_timeout = Duration::from_secs(secs);
    }

    if config.tunnel_addr.is_none() && config.connect_addr.is_none() {
        anyhow::bail!("No frontend enabled (set --tunnel-addr or --connect-addr)");
    }

    Ok(config)
}

/// Merge CLI args over the config file, giving precedence to CLI args
fn build_agent_config(args: AgentArgs) -> Result<AgentConfig> {
    let mut config: AgentConfig = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            load_config_file(path)?
        }
        None => AgentConfig::default(),
    };

    if let Some(server) = args.server {
        config.server_addr = server;
    }
    if let Some(agent_id) = args.agent_id {
        config.agent_id = agent_id;
    }
    if !args.allow_networks.is_empty() {
        config.allowlist.networks = args.allow_networks;
    }
    if !args.allow_ports.is_empty() {
        config.allowlist.ports = args.allow_ports;
    }
    if args.max_reconnect_attempts.is_some() {
        config.reconnect.max_attempts = args.max_reconnect_attempts;
    }

    if config.agent_id.is_empty() {
        anyhow::bail!("Agent ID cannot be empty");
    }
    validate_address(&config.server_addr, "server")?;

    Ok(config)
}

/// Validate address format (should be host:port)
fn validate_address(addr: &str, addr_type: &str) -> Result<()> {
    let Some((host, port)) = addr.rsplit_once(':') else {
        anyhow::bail!(
            "Invalid {} address format: '{}' (expected format: host:port)",
            addr_type,
            addr
        );
    };

    if host.is_empty() {
        anyhow::bail!(
            "Invalid {} address format: '{}' (host cannot be empty)",
            addr_type,
            addr
        );
    }

    port.parse::<u16>()
        .with_context(|| format!("Invalid port in {} address: {}", addr_type, addr))?;

    Ok(())
}

async fn run_server(args: ServerArgs) -> Result<()> {
    let config = build_server_config(args).context("Failed to build server configuration")?;

    let server = ProxyServer::bind(config)
        .await
        .context("Failed to bind server listeners")?;

    info!("Agent endpoint: {}", server.agent_addr()?);
    if let Some(addr) = server.tunnel_addr() {
        info!("Tunnel frontend: {}", addr);
    }
    if let Some(addr) = server.connect_addr() {
        info!("HTTP CONNECT frontend: {}", addr);
    }

    let shutdown = server.shutdown_token();
    let registry = server.registry();
    let mut server_task = tokio::spawn(server.run());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            shutdown.cancel();
            server_task
                .await
                .context("Server task panicked")?
                .context("Server failed")?;
        }
        result = &mut server_task => {
            result.context("Server task panicked")?.context("Server failed")?;
        }
    }

    let snapshot = registry.metrics().snapshot();
    info!(
        sessions_opened = snapshot.sessions_opened,
        dial_failures = snapshot.dial_failures,
        sessions_lost = snapshot.sessions_lost,
        "Server stopped"
    );
    Ok(())
}

async fn run_agent(args: AgentArgs) -> Result<()> {
    let config = build_agent_config(args).context("Failed to build agent configuration")?;

    info!("Agent ID: {}", config.agent_id);
    info!("Server: {}", config.server_addr);

    let agent = Agent::new(config).context("Failed to create agent")?;
    let shutdown = CancellationToken::new();

    let token = shutdown.clone();
    let mut agent_task = tokio::spawn(async move { agent.run(token).await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            shutdown.cancel();
            agent_task.await.context("Agent task panicked")??;
        }
        result = &mut agent_task => {
            if let Ok(Err(e)) = &result {
                error!("Agent error: {}", e);
            }
            result.context("Agent task panicked")??;
        }
    }

    info!("Agent stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli.log_level)?;

    match cli.command {
        Commands::Server(args) => run_server(args).await,
        Commands::Agent(args) => run_agent(args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_address() {
        assert!(validate_address("proxy.example.com:8091", "server").is_ok());
        assert!(validate_address("localhost:8080", "server").is_ok());
        assert!(validate_address("[::1]:8091", "server").is_ok());

        assert!(validate_address("proxy.example.com", "server").is_err());
        assert!(validate_address("proxy.example.com:", "server").is_err());
        assert!(validate_address("proxy.example.com:abc", "server").is_err());
        assert!(validate_address(":8091", "server").is_err());
        assert!(validate_address("", "server").is_err());
    }

    #[test]
    fn test_server_cli_overrides_defaults() {
        let cli = Cli::parse_from([
            "backhaul",
            "server",
            "--connect-addr",
            "127.0.0.1:3128",
            "--no-tunnel",
            "--dial-timeout",
            "3",
        ]);
        let Commands::Server(args) = cli.command else {
            panic!("Expected server subcommand");
        };

        let config = build_server_config(args).unwrap();
        assert_eq!(config.connect_addr, Some("127.0.0.1:3128".parse().unwrap()));
        assert!(config.tunnel_addr.is_none());
        assert_eq!(config.dial_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_server_requires_a_frontend() {
        let cli = Cli::parse_from(["backhaul", "server", "--no-tunnel"]);
        let Commands::Server(args) = cli.command else {
            panic!("Expected server subcommand");
        };
        assert!(build_server_config(args).is_err());
    }

    #[test]
    fn test_agent_cli_overrides_defaults() {
        let cli = Cli::parse_from([
            "backhaul",
            "agent",
            "--server",
            "proxy.example.com:8091",
            "--agent-id",
            "cluster-a",
            "--allow-network",
            "10.0.0.0/8",
            "--allow-port",
            "443",
        ]);
        let Commands::Agent(args) = cli.command else {
            panic!("Expected agent subcommand");
        };

        let config = build_agent_config(args).unwrap();
        assert_eq!(config.agent_id, "cluster-a");
        assert_eq!(config.server_addr, "proxy.example.com:8091");
        assert_eq!(config.allowlist.networks, vec!["10.0.0.0/8".to_string()]);
        assert_eq!(config.allowlist.ports, vec![443]);
    }
}

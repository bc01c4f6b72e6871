//! Tunnel Agent Daemon
//!
//! Runs next to a private service and exposes it through the broker.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use tn_agent::Agent;
use tn_core::config::{self, AgentConfig};
use tn_core::logging::init_tracing;

#[derive(Parser)]
#[command(name = "tn-agent")]
#[command(about = "Tunnel agent - exposes a local service through the broker")]
#[command(version)]
struct Args {
    /// Broker to connect to (host:port)
    #[arg(short, long)]
    broker: Option<String>,

    /// Local service to expose (host:port)
    #[arg(short, long)]
    local: Option<String>,

    /// API key issued by the broker
    #[arg(long, env = "TN_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Name reported to the broker (defaults to hostname)
    #[arg(long)]
    hostname: Option<String>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_tracing(&args.log_level, args.foreground);
    tracing::info!("Tunnel agent starting...");

    // Load configuration
    let mut config: AgentConfig = if let Some(config_path) = &args.config {
        config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        let default_path = config::default_agent_config_path();
        if default_path.exists() {
            config::load_config(&default_path).unwrap_or_else(|e| {
                tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
                AgentConfig::default()
            })
        } else {
            AgentConfig::default()
        }
    };

    // Apply command-line overrides
    if let Some(broker) = args.broker {
        config.broker_address = broker;
    }
    if let Some(local) = args.local {
        config.local_address = local;
    }
    if let Some(api_key) = args.api_key {
        config.api_key = api_key;
    }
    if let Some(hostname) = args.hostname {
        config.hostname = Some(hostname);
    }
    if config.api_key.is_empty() {
        anyhow::bail!("No API key configured. Pass --api-key or set TN_API_KEY.");
    }

    tracing::info!(
        "Exposing {} through {}",
        config.local_address,
        config.broker_address
    );

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Received Ctrl+C, shutting down...");
                cancel_clone.cancel();
            }
            Err(e) => tracing::warn!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    Agent::new(config, cancel).run().await?;

    tracing::info!("Agent stopped");
    Ok(())
}

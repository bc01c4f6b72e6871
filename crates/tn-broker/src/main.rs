//! Tunnel Broker Daemon
//!
//! Accepts agent connections, keeps one session per identity and routes
//! public callers to agents.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use tn_core::config::{self, BrokerConfig};
use tn_core::logging::init_tracing;
use tn_broker::auth::{generate_api_key, ApiKeyAuthenticator, ApiKeyFile};
use tn_broker::edge::EdgeListener;
use tn_broker::{admin, BrokerServer, BrokerState};

#[derive(Parser)]
#[command(name = "tn-broker")]
#[command(about = "Reverse-tunnel broker daemon")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address for agents (overrides config)
    #[arg(short, long)]
    bind: Option<String>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Issue a new API key for an identity
    Keygen {
        /// Identity the key authenticates as
        identity: String,

        /// Append the hashed entry to this key file
        #[arg(long)]
        keys_file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(Command::Keygen {
        identity,
        keys_file,
    }) = &args.command
    {
        return keygen(identity, keys_file.as_deref());
    }

    init_tracing(&args.log_level, args.foreground);
    tracing::info!("Tunnel broker starting...");

    // Load configuration
    let config: BrokerConfig = if let Some(config_path) = &args.config {
        config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        let default_path = config::default_broker_config_path();
        if default_path.exists() {
            config::load_config(&default_path).unwrap_or_else(|e| {
                tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
                BrokerConfig::default()
            })
        } else {
            tracing::info!("Using default configuration");
            BrokerConfig::default()
        }
    };
    config.validate().context("Invalid broker configuration")?;

    // Override bind address if specified
    let bind_addr = args.bind.unwrap_or_else(|| config.bind_address.clone());

    let authenticator = if config.api_keys_path.exists() {
        ApiKeyAuthenticator::load_from_file(&config.api_keys_path)?
    } else {
        tracing::warn!(
            "API key file {:?} not found - all agents will be rejected",
            config.api_keys_path
        );
        ApiKeyAuthenticator::new()
    };
    if authenticator.is_empty() {
        tracing::warn!("No API keys configured - all agents will be rejected");
    }

    let state = Arc::new(BrokerState::new(config, Arc::new(authenticator)));

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    // Setup signal handlers
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        cancel_clone.cancel();
    });

    if let Some(admin_addr) = state.config.admin_address.clone() {
        let state = Arc::clone(&state);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = admin::serve(&admin_addr, state, cancel).await {
                tracing::error!("{:#}", e);
            }
        });
    }

    for binding in &state.config.edge {
        let edge = EdgeListener::bind(binding, Arc::clone(&state.router), cancel.clone()).await?;
        tokio::spawn(async move {
            if let Err(e) = edge.run().await {
                tracing::error!("Edge listener failed: {:#}", e);
            }
        });
    }

    let server = BrokerServer::new(Arc::clone(&state), cancel.clone());
    server.run(&bind_addr).await?;

    tracing::info!("Broker shutdown complete");
    Ok(())
}

/// Print a fresh key and optionally record its hash
fn keygen(identity: &str, keys_file: Option<&Path>) -> Result<()> {
    let (key, entry) = generate_api_key(identity);

    if let Some(path) = keys_file {
        let mut file: ApiKeyFile = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {:?}", path))?;
            toml::from_str(&content).with_context(|| format!("Failed to parse {:?}", path))?
        } else {
            ApiKeyFile::default()
        };
        file.keys.push(entry.clone());
        config::save_config(path, &file)
            .with_context(|| format!("Failed to write {:?}", path))?;
        eprintln!("Added key {} for {} to {:?}", entry.prefix, identity, path);
    } else {
        println!("{}", toml::to_string_pretty(&ApiKeyFile { keys: vec![entry] })?);
    }

    println!("{}", key);
    Ok(())
}

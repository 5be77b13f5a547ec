//! cloudproxy agent daemon
//!
//! Registers with the control plane, then keeps this host's SSH port
//! forwards in line with the declared endpoints and forwards until it is
//! told to stop.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cp_agent::{
    HttpControlPlane, KeystoneAuthenticator, RusshConnector, SessionCache, SystemHostAddrs, Worker,
};
use cp_core::config::{self, AgentConfig};
use cp_core::ConfigError;

#[derive(Parser)]
#[command(name = "cp-agent")]
#[command(about = "cloudproxy agent - keeps SSH port forwards in line with the control plane")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Proxy agent id (overrides the configuration file)
    #[arg(long)]
    proxy_agent_id: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = args.config.clone().unwrap_or_else(config::default_config_path);
    let mut config = match config::load_config::<AgentConfig>(&config_path) {
        Ok(config) => config,
        // Only a missing default file falls back to defaults
        Err(ConfigError::NotFound(_)) if args.config.is_none() => AgentConfig::default(),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to load config from {:?}", config_path))
        }
    };

    if let Some(id) = args.proxy_agent_id {
        config.proxy_agent_id = id;
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }

    // Initialize logging
    let log_level = if args.foreground {
        "debug".to_string()
    } else {
        config.log_level.clone()
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or(log_level),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    config.validate().context("Invalid configuration")?;

    tracing::info!(
        agent_id = %config.proxy_agent_id,
        region = %config.region,
        config = ?config_path,
        "cloudproxy agent starting..."
    );

    // Control plane
    let http = reqwest::Client::builder()
        .timeout(config.auth.request_timeout)
        .build()
        .context("Failed to build HTTP client")?;
    let authenticator = Arc::new(KeystoneAuthenticator::new(
        http,
        config.auth.clone(),
        config.region.clone(),
    ));
    let sessions = Arc::new(SessionCache::new(authenticator, config.auth.early_refresh));
    let api = Arc::new(
        HttpControlPlane::new(
            sessions,
            config.auth.request_timeout,
            config.region.clone(),
            config.auth.interface.clone(),
        )
        .context("Failed to create control-plane client")?,
    );

    let connector = Arc::new(RusshConnector::new(&config.ssh));
    let worker = Worker::new(config, api, connector, Arc::new(SystemHostAddrs));

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
                    tracing::warn!(error = %e, "Failed to install SIGTERM handler");
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

    worker
        .run(cancel)
        .await
        .context("Proxy agent failed to start")?;

    tracing::info!("cloudproxy agent stopped");
    Ok(())
}

//! wormhole broker daemon
//!
//! Accepts SSH sessions from the trusted client and relays its remote port
//! forwards through the configured gateway.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wh_broker::server::{load_host_key, SshServer};
use wh_broker::BrokerState;
use wh_core::config::{self, BrokerConfig};

#[derive(Parser)]
#[command(name = "wormhole")]
#[command(about = "Reverse-tunnel SSH broker")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to accept client SSH sessions on
    #[arg(long, env = "WORMHOLE_LOCALSSHADDR")]
    listen_address: Option<String>,

    /// Host key presented to clients
    #[arg(long, env = "WORMHOLE_PRIVATEKEYPATH")]
    host_key: Option<PathBuf>,

    /// Gateway SSH address
    #[arg(long, env = "WORMHOLE_REMOTESSHADDR")]
    gateway_address: Option<String>,

    /// Address the gateway listens on for each forward
    #[arg(long, env = "WORMHOLE_REMOTEFORWARDADDRESS")]
    forward_address: Option<String>,

    /// Username on the gateway
    #[arg(long, env = "WORMHOLE_REMOTESSHUSER")]
    gateway_user: Option<String>,

    /// Private key used to authenticate to the gateway
    #[arg(long, env = "WORMHOLE_REMOTEPRIVATEKEYPATH")]
    gateway_key: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    /// Apply command line and environment values on top of the file config
    fn apply(self, config: &mut BrokerConfig) {
        if let Some(listen_address) = self.listen_address {
            config.listen_address = listen_address;
        }
        if let Some(host_key) = self.host_key {
            config.host_key_path = host_key;
        }
        if let Some(address) = self.gateway_address {
            config.gateway.address = address;
        }
        if let Some(forward_address) = self.forward_address {
            config.gateway.forward_address = forward_address;
        }
        if let Some(user) = self.gateway_user {
            config.gateway.username = user;
        }
        if let Some(key) = self.gateway_key {
            config.gateway.private_key_path = key;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| args.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("wormhole broker starting...");

    let mut config: BrokerConfig = if let Some(config_path) = &args.config {
        config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        let default_path = config::default_config_path();
        if default_path.exists() {
            config::load_config(&default_path)
                .with_context(|| format!("Failed to load config from {:?}", default_path))?
        } else {
            tracing::debug!("No config file, using environment only");
            BrokerConfig::default()
        }
    };
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    let host_key = load_host_key(&config.host_key_path)?;
    if let Ok(public) = host_key.clone_public_key() {
        tracing::info!("Host key fingerprint: {}", public.fingerprint());
    }

    let state = Arc::new(BrokerState::from_config(&config)?);
    tracing::info!(
        "Forwarding through {} as {}, gateway listens on {}",
        state.settings.gateway_address,
        state.settings.username,
        state.settings.forward_address
    );

    let cancel = CancellationToken::new();

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

    let server = SshServer::new(host_key, state, cancel.clone());
    server.run(&config.listen_address).await?;

    tracing::info!("Broker shutdown complete");
    Ok(())
}

//! SSH server listener
//!
//! Accepts incoming connections and spawns a session handler for each one.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use russh_keys::key::KeyPair;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::server::handler::{ServerConfig, SessionHandler};
use crate::state::BrokerState;

/// SSH server that listens for the client
pub struct SshServer {
    config: ServerConfig,
    state: Arc<BrokerState>,
    cancel: CancellationToken,
}

impl SshServer {
    pub fn new(host_key: KeyPair, state: Arc<BrokerState>, cancel: CancellationToken) -> Self {
        let config = ServerConfig::new(
            host_key,
            state.authenticator.methods(),
            state.auth_rejection_time,
        );
        Self { config, state, cancel }
    }

    /// Bind `bind_addr` and serve until cancelled
    pub async fn run(&self, bind_addr: &str) -> Result<()> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", bind_addr))?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener until cancelled
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        tracing::info!("SSH server listening on {}", local_addr);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("SSH server shutting down");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((socket, peer_addr)) => self.handle_connection(socket, peer_addr),
                        Err(e) => tracing::error!("Failed to accept connection: {}", e),
                    }
                }
            }
        }

        Ok(())
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        tracing::info!("New connection from {}", peer_addr);

        let config = Arc::clone(&self.config.ssh_config);
        let handler = SessionHandler::new(Arc::clone(&self.state), peer_addr, self.cancel.child_token());
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let session = async {
                let running = russh::server::run_stream(config, socket, handler).await?;
                running.await
            };

            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Connection from {} cancelled", peer_addr);
                    return;
                }
                result = session => result,
            };

            match result {
                Ok(()) => tracing::info!("Connection from {} closed", peer_addr),
                Err(e) => tracing::warn!("Connection from {} closed with error: {}", peer_addr, e),
            }
        });
    }
}

/// Load the host identity key. The key is never generated.
pub fn load_host_key(path: &Path) -> Result<KeyPair> {
    if !path.exists() {
        anyhow::bail!("Host key not found at {:?}", path);
    }
    tracing::info!("Loading host key from {:?}", path);
    russh_keys::load_secret_key(path, None)
        .with_context(|| format!("Failed to load host key from {:?}", path))
}

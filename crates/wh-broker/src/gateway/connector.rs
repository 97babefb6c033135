//! Outbound SSH connection to the gateway
//!
//! Every forward request gets its own gateway connection: dial, authenticate
//! with the broker's key, then send a `tcpip-forward` request for the
//! configured forward address. Connections the gateway accepts arrive as
//! `forwarded-tcpip` channels on that connection and are handed to the tunnel
//! through [`SshGatewayListener`].

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use russh::client::{self, Config, Handle, Msg};
use russh::{Channel, ChannelStream, Disconnect};
use russh_keys::key::{KeyPair, PublicKey};
use tokio::sync::mpsc;

use wh_core::config::ForwardSettings;
use wh_core::traits::{GatewayConnection, GatewayDialer, GatewayListener};
use wh_core::types::BindAddress;
use wh_core::TunnelError;

/// Forwarded channels buffered between the gateway session and the tunnel.
///
/// Channels beyond this are refused rather than stalling the gateway
/// session, which also carries the data of every channel already relayed.
const ACCEPT_QUEUE_CAPACITY: usize = 64;

/// How long teardown waits for the gateway to acknowledge a cancelled forward
const CANCEL_FORWARD_TIMEOUT: Duration = Duration::from_secs(5);

/// Dials the gateway with the broker's identity key
pub struct SshGatewayDialer {
    settings: Arc<ForwardSettings>,
    key: Arc<KeyPair>,
    ssh_config: Arc<Config>,
}

impl SshGatewayDialer {
    pub fn new(settings: Arc<ForwardSettings>, key: KeyPair) -> Self {
        Self {
            settings,
            key: Arc::new(key),
            ssh_config: Arc::new(Config::default()),
        }
    }

    /// Load the gateway identity key from disk
    pub fn from_key_file(settings: Arc<ForwardSettings>, path: &Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!("Gateway private key not found at {:?}", path);
        }
        let key = russh_keys::load_secret_key(path, None)
            .with_context(|| format!("Failed to load gateway private key from {:?}", path))?;
        tracing::info!("Loaded gateway key from {:?}", path);
        Ok(Self::new(settings, key))
    }

    fn dial_error(&self, reason: impl std::fmt::Display) -> TunnelError {
        TunnelError::Dial {
            address: self.settings.gateway_address.clone(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl GatewayDialer for SshGatewayDialer {
    type Connection = SshGatewayConnection;

    async fn dial(&self) -> Result<SshGatewayConnection, TunnelError> {
        let (accepted_tx, accepted_rx) = mpsc::channel(ACCEPT_QUEUE_CAPACITY);
        let rejected_key = Arc::new(Mutex::new(None));
        let handler = GatewayHandler::new(
            self.settings.host_key_fingerprint.clone(),
            Arc::clone(&rejected_key),
            accepted_tx,
        );

        tracing::debug!("Connecting to gateway {}", self.settings.gateway_address);
        let mut session = client::connect(
            Arc::clone(&self.ssh_config),
            self.settings.gateway_address.as_str(),
            handler,
        )
        .await
        .map_err(|e| {
            let rejected = rejected_key.lock().ok().and_then(|mut slot| slot.take());
            match rejected {
                Some(fingerprint) => TunnelError::HostKeyRejected { fingerprint },
                None => self.dial_error(e),
            }
        })?;

        tracing::debug!("Authenticating to gateway as '{}'", self.settings.username);
        let authenticated = session
            .authenticate_publickey(&self.settings.username, Arc::clone(&self.key))
            .await
            .map_err(|e| self.dial_error(format!("authentication error: {}", e)))?;

        if !authenticated {
            return Err(TunnelError::AuthRejected {
                user: self.settings.username.clone(),
            });
        }

        Ok(SshGatewayConnection {
            session,
            accepted: Some(accepted_rx),
            listening: None,
            closed: false,
        })
    }
}

/// An authenticated gateway session
pub struct SshGatewayConnection {
    session: Handle<GatewayHandler>,
    accepted: Option<mpsc::Receiver<Channel<Msg>>>,
    listening: Option<BindAddress>,
    closed: bool,
}

#[async_trait]
impl GatewayConnection for SshGatewayConnection {
    type Listener = SshGatewayListener;

    async fn listen(&mut self, address: &BindAddress) -> Result<SshGatewayListener, TunnelError> {
        let accepted = self.accepted.take().ok_or(TunnelError::AlreadyListening)?;

        match self.session.tcpip_forward(address.host.clone(), address.port).await {
            Ok(assigned) => {
                let bound = bound_address(address, assigned);
                tracing::debug!("Gateway is listening on {}", bound);
                self.listening = Some(bound.clone());
                Ok(SshGatewayListener {
                    accepted,
                    address: bound,
                })
            }
            Err(e) => Err(TunnelError::Listen {
                address: address.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Some(address) = self.listening.take() {
            let cancelled = tokio::time::timeout(
                CANCEL_FORWARD_TIMEOUT,
                self.session
                    .cancel_tcpip_forward(address.host.clone(), address.port),
            )
            .await;
            if cancelled.is_err() {
                tracing::debug!("Gateway did not acknowledge cancelling {}", address);
            }
        }
        if let Err(e) = self
            .session
            .disconnect(Disconnect::ByApplication, "tunnel closed", "en")
            .await
        {
            tracing::trace!("Gateway disconnect failed: {}", e);
        }
    }
}

/// Connections the gateway accepted for one tunnel
pub struct SshGatewayListener {
    accepted: mpsc::Receiver<Channel<Msg>>,
    address: BindAddress,
}

#[async_trait]
impl GatewayListener for SshGatewayListener {
    type Stream = ChannelStream<Msg>;

    fn address(&self) -> &BindAddress {
        &self.address
    }

    async fn accept(&mut self) -> Result<ChannelStream<Msg>, TunnelError> {
        self.accepted
            .recv()
            .await
            .map(Channel::into_stream)
            .ok_or(TunnelError::ListenerClosed)
    }
}

/// SSH client handler for the gateway session
struct GatewayHandler {
    /// Expected host key fingerprint
    expected_host_key: Option<String>,
    /// Fingerprint of a key we refused, reported back to the dialer
    rejected_key: Arc<Mutex<Option<String>>>,
    accepted_tx: mpsc::Sender<Channel<Msg>>,
}

impl GatewayHandler {
    fn new(
        expected_host_key: Option<String>,
        rejected_key: Arc<Mutex<Option<String>>>,
        accepted_tx: mpsc::Sender<Channel<Msg>>,
    ) -> Self {
        Self {
            expected_host_key,
            rejected_key,
            accepted_tx,
        }
    }
}

/// Address a `tcpip-forward` ended up bound to
///
/// The gateway only reports a port when it chose one because port 0 was
/// requested; otherwise the requested address stands.
fn bound_address(requested: &BindAddress, assigned: u32) -> BindAddress {
    if requested.port == 0 && assigned != 0 {
        BindAddress {
            host: requested.host.clone(),
            port: assigned,
        }
    } else {
        requested.clone()
    }
}

/// Check a presented host key fingerprint against the configured one
fn host_key_matches(expected: Option<&str>, fingerprint: &str) -> bool {
    match expected {
        Some(expected) => {
            let expected = expected.strip_prefix("SHA256:").unwrap_or(expected);
            let fingerprint = fingerprint.strip_prefix("SHA256:").unwrap_or(fingerprint);
            expected == fingerprint
        }
        None => true,
    }
}

#[async_trait]
impl client::Handler for GatewayHandler {
    type Error = anyhow::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint();

        if host_key_matches(self.expected_host_key.as_deref(), &fingerprint) {
            if self.expected_host_key.is_none() {
                tracing::debug!("Accepting unpinned gateway host key {}", fingerprint);
            }
            return Ok(true);
        }

        tracing::warn!(
            "Gateway host key mismatch: expected {}, got {}",
            self.expected_host_key.as_deref().unwrap_or_default(),
            fingerprint
        );
        if let Ok(mut slot) = self.rejected_key.lock() {
            *slot = Some(fingerprint);
        }
        Ok(false)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!(
            "Gateway accepted {}:{} for {}:{}",
            originator_address,
            originator_port,
            connected_address,
            connected_port
        );

        if let Err(e) = self.accepted_tx.try_send(channel) {
            tracing::warn!("Dropping gateway connection from {}: {}", originator_address, e);
        }
        Ok(())
    }
}

//! SSH session handler
//!
//! Implements the russh server handler for the trusted client. A session
//! authenticates, opens keepalive shell channels, and sends `tcpip-forward`
//! requests; everything else is refused.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use russh::server::{Auth, Handle, Handler, Msg, Session};
use russh::{Channel, ChannelId, ChannelStream};
use russh_keys::key::PublicKey;
use tokio_util::sync::CancellationToken;

use wh_core::traits::ChannelOpener;
use wh_core::TunnelError;
use wh_protocol::{channel_request, channel_type, global_request, ForwardRequest, ForwardedTcpip};

use crate::broker::TunnelBroker;
use crate::gateway::SshGatewayDialer;
use crate::session::{accepts_request, run_interactive};
use crate::state::BrokerState;

/// Opens `forwarded-tcpip` channels on a client session
#[derive(Clone)]
pub struct InboundOpener {
    handle: Handle,
}

impl InboundOpener {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl ChannelOpener for InboundOpener {
    type Stream = ChannelStream<Msg>;

    async fn open_forwarded(&self, open: &ForwardedTcpip) -> Result<ChannelStream<Msg>, TunnelError> {
        let channel = self
            .handle
            .channel_open_forwarded_tcpip(
                open.connected_address.clone(),
                open.connected_port,
                open.originator_address.clone(),
                open.originator_port,
            )
            .await
            .map_err(|e| TunnelError::ChannelOpen(e.to_string()))?;
        Ok(channel.into_stream())
    }
}

/// Handler for one inbound client connection
pub struct SessionHandler {
    state: Arc<BrokerState>,
    peer_addr: SocketAddr,
    username: Option<String>,
    broker: TunnelBroker<SshGatewayDialer>,
    /// Cancels the session's shells and tunnels when the handler is dropped
    cancel: CancellationToken,
}

impl SessionHandler {
    pub fn new(state: Arc<BrokerState>, peer_addr: SocketAddr, cancel: CancellationToken) -> Self {
        let broker = TunnelBroker::new(
            Arc::clone(&state.dialer),
            Arc::clone(&state.settings),
            cancel.child_token(),
        );
        Self {
            state,
            peer_addr,
            username: None,
            broker,
            cancel,
        }
    }

    fn reject_channel(&self, kind: &str) -> bool {
        tracing::debug!("Refusing {} channel from {}", kind, self.peer_addr);
        false
    }

    fn reply(&self, channel: ChannelId, kind: &str, session: &mut Session) {
        if accepts_request(kind) {
            session.channel_success(channel);
        } else {
            tracing::debug!(
                "Refusing {} request on {:?} from {}",
                kind,
                channel,
                self.peer_addr
            );
            session.channel_failure(channel);
        }
    }
}

impl Drop for SessionHandler {
    fn drop(&mut self) {
        let tunnels = self.broker.shutdown();
        self.cancel.cancel();
        tracing::debug!(
            "Session for {} from {} ended, closing {} tunnels",
            self.username.as_deref().unwrap_or("unauthenticated client"),
            self.peer_addr,
            tunnels
        );
    }
}

#[async_trait]
impl Handler for SessionHandler {
    type Error = anyhow::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if self.state.authenticator.check_password(user, password) {
            tracing::info!("Client {} authenticated as {}", self.peer_addr, user);
            self.username = Some(user.to_string());
            return Ok(Auth::Accept);
        }

        tracing::warn!("Password authentication rejected for {} from {}", user, self.peer_addr);
        Ok(Auth::Reject {
            proceed_with_methods: None,
        })
    }

    async fn auth_publickey(&mut self, user: &str, public_key: &PublicKey) -> Result<Auth, Self::Error> {
        let fingerprint = public_key.fingerprint();
        if self.state.authenticator.check_public_key(user, public_key) {
            tracing::info!(
                "Client {} authenticated as {} with key {}",
                self.peer_addr,
                user,
                fingerprint
            );
            self.username = Some(user.to_string());
            return Ok(Auth::Accept);
        }

        tracing::debug!("Key {} not authorized for {} from {}", fingerprint, user, self.peer_addr);
        Ok(Auth::Reject {
            proceed_with_methods: None,
        })
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        tracing::debug!(
            "{} channel {:?} opened by {}",
            channel_type::SESSION,
            channel.id(),
            self.peer_addr
        );
        tokio::spawn(run_interactive(channel, self.cancel.child_token()));
        Ok(true)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        _host_to_connect: &str,
        _port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.reject_channel(channel_type::DIRECT_TCPIP))
    }

    async fn channel_open_forwarded_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        _host_to_connect: &str,
        _port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.reject_channel(channel_type::FORWARDED_TCPIP))
    }

    async fn shell_request(&mut self, channel: ChannelId, session: &mut Session) -> Result<(), Self::Error> {
        self.reply(channel, channel_request::SHELL, session);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        _data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.reply(channel, channel_request::EXEC, session);
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.reply(channel, channel_request::PTY, session);
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        _variable_name: &str,
        _variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.reply(channel, channel_request::ENV, session);
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        _name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.reply(channel, channel_request::SUBSYSTEM, session);
        Ok(())
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let request = ForwardRequest::new(address, *port);
        let opener = InboundOpener::new(session.handle());

        match self.broker.forward(request.clone(), opener).await {
            Ok(id) => {
                tracing::debug!("{} serving forward {} for {}", id, request, self.peer_addr);
                Ok(true)
            }
            Err(e) => {
                tracing::warn!(
                    "{} {} from {} failed: {}",
                    global_request::TCPIP_FORWARD,
                    request,
                    self.peer_addr,
                    e
                );
                Ok(false)
            }
        }
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        tracing::debug!(
            "Refusing {} {}:{} from {}",
            global_request::CANCEL_TCPIP_FORWARD,
            address,
            port,
            self.peer_addr
        );
        Ok(false)
    }

    async fn channel_close(&mut self, channel: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
        tracing::debug!("Channel {:?} closed by {}", channel, self.peer_addr);
        Ok(())
    }
}

/// Configuration for the SSH server
#[derive(Clone)]
pub struct ServerConfig {
    /// russh server configuration
    pub ssh_config: Arc<russh::server::Config>,
}

impl ServerConfig {
    /// Create a server configuration presenting `host_key`
    pub fn new(
        host_key: russh_keys::key::KeyPair,
        methods: russh::MethodSet,
        auth_rejection_time: std::time::Duration,
    ) -> Self {
        let mut config = russh::server::Config::default();
        config.keys.push(host_key);
        config.methods = methods;
        config.auth_rejection_time = auth_rejection_time;
        config.auth_rejection_time_initial = Some(std::time::Duration::from_secs(0));

        Self {
            ssh_config: Arc::new(config),
        }
    }
}

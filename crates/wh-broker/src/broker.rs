//! Tunnel broker
//!
//! Turns a client's forward requests into tunnels. Each session owns one
//! broker; the broker owns the registry of that session's tunnels and a
//! cancellation token that is a child of the session's, so a session that
//! goes away takes all of its tunnels with it.

use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use wh_core::config::ForwardSettings;
use wh_core::traits::{ChannelOpener, GatewayConnection, GatewayDialer};
use wh_core::types::TunnelId;
use wh_core::TunnelError;
use wh_protocol::ForwardRequest;

use crate::tunnel::{ForwardTunnel, PendingTunnel, TunnelExit, TunnelHandle, TunnelRegistry};

/// Creates and tracks the tunnels of one client session
pub struct TunnelBroker<D: GatewayDialer> {
    dialer: Arc<D>,
    settings: Arc<ForwardSettings>,
    registry: Arc<TunnelRegistry>,
    cancel: CancellationToken,
}

impl<D: GatewayDialer> TunnelBroker<D> {
    pub fn new(dialer: Arc<D>, settings: Arc<ForwardSettings>, cancel: CancellationToken) -> Self {
        Self {
            dialer,
            settings,
            registry: Arc::new(TunnelRegistry::new()),
            cancel,
        }
    }

    /// Tunnels currently running for this session
    pub fn registry(&self) -> &Arc<TunnelRegistry> {
        &self.registry
    }

    /// Establish a tunnel for a forward request
    ///
    /// Resolves once the gateway is listening (or has failed to). `Ok` means
    /// the client should get a success reply. Relaying starts in the
    /// background; channels to the client are opened through `opener` after
    /// this returns.
    pub async fn forward<O: ChannelOpener>(
        &self,
        request: ForwardRequest,
        opener: O,
    ) -> Result<TunnelId, TunnelError> {
        let pending = self.prepare(request).await?;
        Ok(self.launch(pending, opener))
    }

    /// Dial the gateway and ask it to listen
    ///
    /// `connect_timeout` bounds dial and listen together, and the session's
    /// token cancels either step. A gateway connection that does not end up
    /// listening is closed before returning.
    pub async fn prepare(
        &self,
        request: ForwardRequest,
    ) -> Result<PendingTunnel<D::Connection>, TunnelError> {
        let timeout = self.settings.connect_timeout;
        let deadline = Instant::now() + timeout;
        tracing::debug!(
            "Forward request {}: dialing gateway {}",
            request,
            self.settings.gateway_address
        );

        let dialed = tokio::select! {
            _ = self.cancel.cancelled() => return Err(self.session_closed()),
            dialed = tokio::time::timeout_at(deadline, self.dialer.dial()) => dialed,
        };

        let mut gateway = match dialed {
            Ok(result) => result?,
            Err(_) => {
                return Err(TunnelError::DialTimeout {
                    address: self.settings.gateway_address.clone(),
                    timeout,
                })
            }
        };

        let address = &self.settings.forward_address;
        let listened = tokio::select! {
            _ = self.cancel.cancelled() => Err(self.session_closed()),
            listened = tokio::time::timeout_at(deadline, gateway.listen(address)) => match listened {
                Ok(result) => result,
                Err(_) => Err(TunnelError::ListenTimeout {
                    address: address.to_string(),
                    timeout,
                }),
            },
        };

        match listened {
            Ok(listener) => Ok(PendingTunnel::new(request, gateway, listener)),
            Err(e) => {
                gateway.close().await;
                Err(e)
            }
        }
    }

    /// Start relaying for a prepared tunnel
    pub fn launch<O: ChannelOpener>(&self, pending: PendingTunnel<D::Connection>, opener: O) -> TunnelId {
        let id = TunnelId::next();
        let gateway_address = pending.gateway_address().clone();

        tracing::info!(
            "{} opened: forwarding {} via {}",
            id,
            gateway_address,
            self.settings.gateway_address
        );

        let handle = self.registry.insert(TunnelHandle::new(
            id,
            pending.request().clone(),
            gateway_address,
            self.cancel.child_token(),
        ));

        let tunnel = ForwardTunnel::new(
            id,
            pending,
            opener,
            self.settings.channel_mode,
            handle.cancel_token(),
            handle.pipe_counter(),
        );
        let registry = Arc::clone(&self.registry);

        tokio::spawn(async move {
            match tunnel.run().await {
                TunnelExit::Cancelled => tracing::debug!("{} shut down", id),
                TunnelExit::ListenerClosed => tracing::info!("{} closed: gateway stopped listening", id),
                TunnelExit::ChannelClosed => tracing::info!("{} closed: client closed the channel", id),
                TunnelExit::ChannelOpenFailed(e) => tracing::warn!("{} closed: {}", id, e),
                TunnelExit::Failed(e) => tracing::warn!("{} failed: {}", id, e),
            }
            if let Some(handle) = registry.remove(&id) {
                tracing::debug!("{} ran for {:?}", id, handle.opened_at.elapsed());
            }
        });

        id
    }

    /// Shut down one tunnel
    pub fn close_tunnel(&self, id: &TunnelId) -> bool {
        self.registry.shutdown(id)
    }

    /// Shut down every tunnel of this session
    pub fn shutdown(&self) -> usize {
        self.cancel.cancel();
        self.registry.shutdown_all()
    }

    fn session_closed(&self) -> TunnelError {
        TunnelError::Dial {
            address: self.settings.gateway_address.clone(),
            reason: "session closed".to_string(),
        }
    }
}

//! Forward tunnel lifecycle
//!
//! A tunnel is created in two steps. [`PendingTunnel`] is the result of the
//! part that decides the client's reply: the gateway has been dialed and has
//! agreed to listen. [`ForwardTunnel`] is the part that runs after the reply
//! is sent: it opens forwarded channels on the client session and relays
//! every connection the gateway accepts.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use wh_core::config::ChannelMode;
use wh_core::traits::{ChannelOpener, GatewayConnection, GatewayListener, RelayStream};
use wh_core::types::{BindAddress, TunnelId};
use wh_core::TunnelError;
use wh_protocol::{ForwardRequest, ForwardedTcpip};

use super::shared::SharedChannel;
use crate::relay::{RelayPipe, RelaySummary};

/// Why a tunnel stopped
#[derive(Debug)]
pub enum TunnelExit {
    /// Shut down by the session, the broker, or the process
    Cancelled,
    /// The gateway stopped delivering connections
    ListenerClosed,
    /// The shared forwarded channel was closed by the client
    ChannelClosed,
    /// The forwarded channel could not be opened on the client session
    ChannelOpenFailed(TunnelError),
    /// The gateway listener failed
    Failed(TunnelError),
}

/// A gateway connection that is already listening, not yet relaying
pub struct PendingTunnel<C: GatewayConnection> {
    pub(crate) request: ForwardRequest,
    pub(crate) gateway: C,
    pub(crate) listener: C::Listener,
}

impl<C: GatewayConnection> PendingTunnel<C> {
    pub fn new(request: ForwardRequest, gateway: C, listener: C::Listener) -> Self {
        Self {
            request,
            gateway,
            listener,
        }
    }

    pub fn request(&self) -> &ForwardRequest {
        &self.request
    }

    /// Where the gateway ended up listening
    pub fn gateway_address(&self) -> &BindAddress {
        self.listener.address()
    }
}

/// A running tunnel
pub struct ForwardTunnel<C: GatewayConnection, O: ChannelOpener> {
    id: TunnelId,
    pending: PendingTunnel<C>,
    opener: O,
    mode: ChannelMode,
    cancel: CancellationToken,
    active_pipes: Arc<AtomicUsize>,
}

impl<C: GatewayConnection, O: ChannelOpener> ForwardTunnel<C, O> {
    pub fn new(
        id: TunnelId,
        pending: PendingTunnel<C>,
        opener: O,
        mode: ChannelMode,
        cancel: CancellationToken,
        active_pipes: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            id,
            pending,
            opener,
            mode,
            cancel,
            active_pipes,
        }
    }

    /// Relay until the tunnel is cancelled or one of its ends goes away
    ///
    /// On return every pipe has stopped and the gateway connection is closed.
    pub async fn run(self) -> TunnelExit {
        let ForwardTunnel {
            id,
            pending,
            opener,
            mode,
            cancel,
            active_pipes,
        } = self;
        let PendingTunnel {
            request,
            mut gateway,
            mut listener,
        } = pending;

        let open = ForwardedTcpip::for_request(&request);
        let mut pipes = JoinSet::new();
        let mut hub = None;

        let exit = match mode {
            ChannelMode::Shared => {
                let channel = tokio::select! {
                    _ = cancel.cancelled() => Err(TunnelExit::Cancelled),
                    opened = opener.open_forwarded(&open) => {
                        opened.map_err(TunnelExit::ChannelOpenFailed)
                    }
                };
                match channel {
                    Ok(channel) => {
                        tracing::debug!("{} opened shared forwarded channel for {}", id, request);
                        let shared = hub.insert(SharedChannel::spawn(id, channel, &cancel));
                        relay_shared(id, &mut listener, shared, &mut pipes, &cancel, &active_pipes)
                            .await
                    }
                    Err(exit) => exit,
                }
            }
            ChannelMode::PerConnection => {
                relay_per_connection(id, &mut listener, &opener, &open, &mut pipes, &cancel, &active_pipes)
                    .await
            }
        };

        cancel.cancel();
        while let Some(done) = pipes.join_next().await {
            reap(id, done);
        }
        if let Some(shared) = hub {
            shared.shutdown().await;
        }
        gateway.close().await;

        exit
    }
}

async fn relay_shared<L: GatewayListener>(
    id: TunnelId,
    listener: &mut L,
    hub: &SharedChannel,
    pipes: &mut JoinSet<Option<RelaySummary>>,
    cancel: &CancellationToken,
    active_pipes: &Arc<AtomicUsize>,
) -> TunnelExit {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return TunnelExit::Cancelled,
            _ = hub.closed() => return TunnelExit::ChannelClosed,
            Some(done) = pipes.join_next() => reap(id, done),
            accepted = listener.accept() => match accepted {
                Ok(stream) => spawn_pipe(id, pipes, stream, hub.port(), cancel, active_pipes),
                Err(e) => return listener_exit(e),
            },
        }
    }
}

async fn relay_per_connection<L: GatewayListener, O: ChannelOpener>(
    id: TunnelId,
    listener: &mut L,
    opener: &O,
    open: &ForwardedTcpip,
    pipes: &mut JoinSet<Option<RelaySummary>>,
    cancel: &CancellationToken,
    active_pipes: &Arc<AtomicUsize>,
) -> TunnelExit {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return TunnelExit::Cancelled,
            Some(done) = pipes.join_next() => reap(id, done),
            accepted = listener.accept() => match accepted {
                Ok(stream) => {
                    let opener = opener.clone();
                    let open = open.clone();
                    let pipe = RelayPipe::new(cancel);
                    let stopped = pipe.cancel_token();
                    let active_pipes = Arc::clone(active_pipes);
                    pipes.spawn(async move {
                        let opened = tokio::select! {
                            _ = stopped.cancelled() => return None,
                            opened = opener.open_forwarded(&open) => opened,
                        };
                        match opened {
                            Ok(channel) => Some(run_pipe(id, pipe, stream, channel, active_pipes).await),
                            Err(e) => {
                                tracing::warn!("{} could not open forwarded channel: {}", id, e);
                                None
                            }
                        }
                    });
                }
                Err(e) => return listener_exit(e),
            },
        }
    }
}

fn spawn_pipe<A: RelayStream, B: RelayStream>(
    id: TunnelId,
    pipes: &mut JoinSet<Option<RelaySummary>>,
    gateway_side: A,
    client_side: B,
    cancel: &CancellationToken,
    active_pipes: &Arc<AtomicUsize>,
) {
    let pipe = RelayPipe::new(cancel);
    let active_pipes = Arc::clone(active_pipes);
    pipes.spawn(async move { Some(run_pipe(id, pipe, gateway_side, client_side, active_pipes).await) });
}

async fn run_pipe<A: RelayStream, B: RelayStream>(
    id: TunnelId,
    pipe: RelayPipe,
    gateway_side: A,
    client_side: B,
    active_pipes: Arc<AtomicUsize>,
) -> RelaySummary {
    let pipe_id = pipe.id();
    let active = active_pipes.fetch_add(1, Ordering::Relaxed) + 1;
    tracing::debug!("{} started {} ({} active)", id, pipe_id, active);

    let summary = pipe.run(gateway_side, client_side).await;

    let remaining = active_pipes.fetch_sub(1, Ordering::Relaxed) - 1;
    match &summary.error {
        Some(e) => tracing::debug!("{} {} ended with error: {}", id, pipe_id, e),
        None => tracing::debug!(
            "{} {} finished after {} bytes ({} active)",
            id,
            pipe_id,
            summary.total(),
            remaining
        ),
    }
    summary
}

fn reap(id: TunnelId, done: Result<Option<RelaySummary>, JoinError>) {
    if let Err(e) = done {
        tracing::error!("{} relay task failed: {}", id, e);
    }
}

fn listener_exit(error: TunnelError) -> TunnelExit {
    match error {
        TunnelError::ListenerClosed => TunnelExit::ListenerClosed,
        other => TunnelExit::Failed(other),
    }
}

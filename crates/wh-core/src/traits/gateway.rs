//! Gateway traits

use async_trait::async_trait;

use super::channel::RelayStream;
use crate::error::TunnelError;
use crate::types::BindAddress;

/// Opens outbound connections to the gateway
#[async_trait]
pub trait GatewayDialer: Send + Sync + 'static {
    /// The connection type produced by this dialer
    type Connection: GatewayConnection;

    /// Connect and authenticate to the gateway
    async fn dial(&self) -> Result<Self::Connection, TunnelError>;
}

/// An authenticated connection to the gateway
#[async_trait]
pub trait GatewayConnection: Send + 'static {
    /// The listener type produced by this connection
    type Listener: GatewayListener;

    /// Ask the gateway to listen on `address` on our behalf
    ///
    /// A connection serves at most one listener; a second call fails with
    /// `TunnelError::AlreadyListening`.
    async fn listen(&mut self, address: &BindAddress) -> Result<Self::Listener, TunnelError>;

    /// Cancel the listen request and disconnect
    ///
    /// Must be safe to call more than once.
    async fn close(&mut self);
}

/// Connections the gateway accepted on our behalf
#[async_trait]
pub trait GatewayListener: Send + 'static {
    /// Stream type of an accepted connection
    type Stream: RelayStream;

    /// Address the gateway is actually listening on
    ///
    /// Differs from the requested address when port 0 was requested and the
    /// gateway picked one.
    fn address(&self) -> &BindAddress;

    /// Wait for the next connection
    ///
    /// Returns `TunnelError::ListenerClosed` once the gateway stops
    /// delivering connections.
    async fn accept(&mut self) -> Result<Self::Stream, TunnelError>;
}

//! Inbound channel traits

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use wh_protocol::ForwardedTcpip;

use crate::error::TunnelError;

/// Byte stream that can be relayed and moved across tasks
pub trait RelayStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> RelayStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Opens `forwarded-tcpip` channels on the inbound client connection
#[async_trait]
pub trait ChannelOpener: Clone + Send + Sync + 'static {
    /// Stream type of an opened channel
    type Stream: RelayStream;

    /// Open a channel announcing a forwarded connection to the client
    async fn open_forwarded(&self, open: &ForwardedTcpip) -> Result<Self::Stream, TunnelError>;
}

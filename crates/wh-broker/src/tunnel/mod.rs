//! Forward tunnels
//!
//! One tunnel exists per accepted `tcpip-forward` request. It owns the
//! outbound gateway connection, the gateway listener, and the relay pipes
//! for every connection that listener accepts.

mod forward;
mod registry;
mod shared;

#[cfg(test)]
pub(crate) mod testing;

pub use forward::{ForwardTunnel, PendingTunnel, TunnelExit};
pub use registry::{TunnelHandle, TunnelRegistry};
pub use shared::{ChannelPort, SharedChannel};

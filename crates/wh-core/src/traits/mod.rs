//! Seams between the tunnel engine and the SSH transport

mod channel;
mod gateway;

pub use channel::{ChannelOpener, RelayStream};
pub use gateway::{GatewayConnection, GatewayDialer, GatewayListener};

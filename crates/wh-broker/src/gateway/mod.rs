//! Gateway side of a tunnel

mod connector;

pub use connector::{SshGatewayConnection, SshGatewayDialer, SshGatewayListener};

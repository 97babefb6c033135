//! Inbound SSH server

mod handler;
mod listener;

pub use handler::{InboundOpener, ServerConfig, SessionHandler};
pub use listener::{load_host_key, SshServer};

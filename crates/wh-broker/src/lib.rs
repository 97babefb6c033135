//! wh-broker: Reverse-tunnel broker
//!
//! The broker accepts SSH sessions from a trusted client. Every
//! `tcpip-forward` request the client sends makes the broker dial a
//! separate SSH gateway, ask it to listen on the client's behalf, and relay
//! each connection the gateway accepts back to the client over a
//! `forwarded-tcpip` channel.

pub mod auth;
pub mod broker;
pub mod gateway;
pub mod relay;
pub mod server;
pub mod session;
pub mod state;
pub mod tunnel;

pub use broker::TunnelBroker;
pub use state::BrokerState;

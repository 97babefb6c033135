//! wh-protocol: SSH names and payloads handled by the wormhole broker
//!
//! The broker does not speak a protocol of its own, and russh does all
//! wire encoding. This crate only holds the `tcpip-forward` request and
//! `forwarded-tcpip` channel-open fields the broker works with, plus the
//! request and channel type names it dispatches on.

pub mod message;

pub use message::{channel_request, channel_type, global_request, ForwardRequest, ForwardedTcpip};

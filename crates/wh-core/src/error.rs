//! Core error types for wormhole

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// How far a failure is allowed to reach
///
/// Every failure is contained at the smallest scope that owns the failed
/// resource. Only `Fatal` failures end the process, and those can only
/// happen before any connection is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureScope {
    /// Startup cannot complete (configuration, identity keys)
    Fatal,
    /// One inbound connection ends
    Connection,
    /// One request gets a failure reply
    Request,
    /// One tunnel is torn down
    Tunnel,
    /// One relay pipe is closed
    Pipe,
}

/// Top-level error type for wormhole
#[derive(Error, Debug)]
pub enum WhError {
    /// Tunnel error
    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WhError {
    /// Scope this error is contained to
    pub fn scope(&self) -> FailureScope {
        match self {
            WhError::Tunnel(e) => e.scope(),
            WhError::Config(_) => FailureScope::Fatal,
            WhError::Io(_) => FailureScope::Connection,
        }
    }
}

/// Errors raised while establishing or running a tunnel
#[derive(Error, Debug)]
pub enum TunnelError {
    /// Global request type other than `tcpip-forward`
    #[error("Unsupported request type: {0}")]
    UnsupportedRequest(String),

    /// Could not connect to the gateway
    #[error("Failed to dial gateway {address}: {reason}")]
    Dial { address: String, reason: String },

    /// Gateway did not answer in time
    #[error("Timed out after {timeout:?} dialing gateway {address}")]
    DialTimeout { address: String, timeout: Duration },

    /// Gateway refused our key
    #[error("Gateway rejected authentication for user {user}")]
    AuthRejected { user: String },

    /// Gateway presented an unexpected host key
    #[error("Gateway host key {fingerprint} does not match the configured fingerprint")]
    HostKeyRejected { fingerprint: String },

    /// Gateway refused to listen
    #[error("Gateway refused to listen on {address}: {reason}")]
    Listen { address: String, reason: String },

    /// Gateway never answered the listen request
    #[error("Timed out after {timeout:?} waiting for gateway to listen on {address}")]
    ListenTimeout { address: String, timeout: Duration },

    /// A gateway connection only ever serves one listener
    #[error("Gateway connection is already listening")]
    AlreadyListening,

    /// Gateway listener stopped yielding connections
    #[error("Gateway listener closed")]
    ListenerClosed,

    /// Could not open the forwarded channel back to the client
    #[error("Failed to open forwarded channel: {0}")]
    ChannelOpen(String),

    /// Relay I/O failure
    #[error("Relay I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TunnelError {
    /// Scope this error is contained to
    pub fn scope(&self) -> FailureScope {
        match self {
            TunnelError::UnsupportedRequest(_)
            | TunnelError::Dial { .. }
            | TunnelError::DialTimeout { .. }
            | TunnelError::AuthRejected { .. }
            | TunnelError::HostKeyRejected { .. }
            | TunnelError::Listen { .. }
            | TunnelError::ListenTimeout { .. }
            | TunnelError::AlreadyListening => FailureScope::Request,
            TunnelError::ListenerClosed | TunnelError::ChannelOpen(_) => FailureScope::Tunnel,
            TunnelError::Io(_) => FailureScope::Pipe,
        }
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Missing required field
    #[error("Missing required field: {0}")]
    MissingField(String),
}

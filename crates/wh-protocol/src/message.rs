//! Payloads and type names the broker dispatches on

use std::fmt;

/// Global request names (RFC 4254 section 7)
pub mod global_request {
    /// Ask the server to listen on a port and forward connections back
    pub const TCPIP_FORWARD: &str = "tcpip-forward";
    /// Undo a previous `tcpip-forward`
    pub const CANCEL_TCPIP_FORWARD: &str = "cancel-tcpip-forward";
}

/// Channel type names (RFC 4254 sections 6.1 and 7)
pub mod channel_type {
    /// Interactive session channel
    pub const SESSION: &str = "session";
    /// Server-initiated channel for a forwarded connection
    pub const FORWARDED_TCPIP: &str = "forwarded-tcpip";
    /// Client-initiated channel to a host reachable from the server
    pub const DIRECT_TCPIP: &str = "direct-tcpip";
}

/// Channel request names (RFC 4254 section 6)
pub mod channel_request {
    pub const SHELL: &str = "shell";
    pub const EXEC: &str = "exec";
    pub const PTY: &str = "pty-req";
    pub const ENV: &str = "env";
    pub const SUBSYSTEM: &str = "subsystem";
}

/// A `tcpip-forward` global request as received from the client
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ForwardRequest {
    /// Address the client wants exposed ("", "0.0.0.0", "localhost", ...)
    pub bind_address: String,
    /// Port the client wants exposed (0 lets the server choose)
    pub bind_port: u32,
}

impl ForwardRequest {
    pub fn new(bind_address: impl Into<String>, bind_port: u32) -> Self {
        Self {
            bind_address: bind_address.into(),
            bind_port,
        }
    }
}

impl fmt::Display for ForwardRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.bind_address, self.bind_port)
    }
}

/// Fields of a `forwarded-tcpip` channel open
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardedTcpip {
    /// Address that was connected
    pub connected_address: String,
    /// Port that was connected
    pub connected_port: u32,
    /// Address of the peer that connected
    pub originator_address: String,
    /// Port of the peer that connected
    pub originator_port: u32,
}

impl ForwardedTcpip {
    /// Originator address reported to the client for relayed connections
    pub const LOCAL_ORIGINATOR: &'static str = "localhost";

    /// Channel-open fields announcing a forward back to the client
    ///
    /// The connected address and port echo the client's request so the
    /// client can match the channel to the forward it asked for.
    pub fn for_request(request: &ForwardRequest) -> Self {
        Self {
            connected_address: request.bind_address.clone(),
            connected_port: request.bind_port,
            originator_address: Self::LOCAL_ORIGINATOR.to_string(),
            originator_port: request.bind_port,
        }
    }
}

//! Core domain types

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

static NEXT_TUNNEL_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_PIPE_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a forward tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TunnelId(pub u64);

impl TunnelId {
    /// Allocate the next process-unique tunnel ID
    pub fn next() -> Self {
        Self(NEXT_TUNNEL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tunnel-{}", self.0)
    }
}

/// Unique identifier for a relay pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipeId(pub u64);

impl PipeId {
    /// Allocate the next process-unique pipe ID
    pub fn next() -> Self {
        Self(NEXT_PIPE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for PipeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pipe-{}", self.0)
    }
}

/// A `host:port` pair as used in SSH forwarding requests
///
/// The host may be empty (all interfaces) or a bracketed IPv6 literal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BindAddress {
    /// Host part, without IPv6 brackets
    pub host: String,
    /// Port part
    pub port: u32,
}

impl BindAddress {
    /// Create a new bind address
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port: port.into(),
        }
    }
}

impl FromStr for BindAddress {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ConfigError::Invalid(format!("expected host:port, got {:?}", s)))?;

        let port: u16 = port
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("invalid port in {:?}", s)))?;

        let host = match host.strip_prefix('[') {
            Some(inner) => inner
                .strip_suffix(']')
                .ok_or_else(|| ConfigError::Invalid(format!("unbalanced brackets in {:?}", s)))?,
            None if host.contains(':') => {
                return Err(ConfigError::Invalid(format!(
                    "IPv6 host must be bracketed in {:?}",
                    s
                )))
            }
            None => host,
        };

        Ok(Self::new(host, port))
    }
}

impl TryFrom<String> for BindAddress {
    type Error = ConfigError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<BindAddress> for String {
    fn from(addr: BindAddress) -> Self {
        addr.to_string()
    }
}

impl fmt::Display for BindAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique_and_displayed() {
        let a = TunnelId::next();
        let b = TunnelId::next();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("tunnel-"));
        assert!(PipeId::next().to_string().starts_with("pipe-"));
    }

    #[test]
    fn test_bind_address_parse() {
        let addr: BindAddress = "0.0.0.0:9000".parse().unwrap();
        assert_eq!(addr, BindAddress::new("0.0.0.0", 9000));

        let addr: BindAddress = "[::1]:22".parse().unwrap();
        assert_eq!(addr.host, "::1");
        assert_eq!(addr.to_string(), "[::1]:22");

        let addr: BindAddress = ":8080".parse().unwrap();
        assert_eq!(addr.host, "");
        assert_eq!(addr.port, 8080);
    }

    #[test]
    fn test_bind_address_rejects_garbage() {
        assert!("localhost".parse::<BindAddress>().is_err());
        assert!("localhost:http".parse::<BindAddress>().is_err());
        assert!("localhost:70000".parse::<BindAddress>().is_err());
        assert!("::1:22".parse::<BindAddress>().is_err());
        assert!("[::1:22".parse::<BindAddress>().is_err());
    }
}

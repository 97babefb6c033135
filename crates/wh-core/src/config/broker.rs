//! Broker configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::types::BindAddress;

/// Configuration for the broker daemon
///
/// The six connection fields have no usable default and must all be set,
/// either in the TOML file or through the environment. Everything else is
/// optional.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Address to accept inbound SSH sessions on
    pub listen_address: String,

    /// Path to the host identity key presented to clients
    pub host_key_path: PathBuf,

    /// Outbound gateway settings
    pub gateway: GatewayConfig,

    /// Inbound authentication policy
    pub auth: AuthConfig,

    /// Delay before answering a rejected authentication attempt
    #[serde(with = "duration_secs")]
    pub auth_rejection_time: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen_address: String::new(),
            host_key_path: PathBuf::new(),
            gateway: GatewayConfig::default(),
            auth: AuthConfig::default(),
            auth_rejection_time: Duration::from_secs(1),
        }
    }
}

/// Gateway the broker dials for every forward request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Gateway SSH address (`host:port`)
    pub address: String,

    /// Address the gateway is asked to listen on (`host:port`)
    pub forward_address: String,

    /// Username on the gateway
    pub username: String,

    /// Private key used to authenticate to the gateway
    pub private_key_path: PathBuf,

    /// Connection timeout, covering TCP connect, handshake and authentication
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Expected gateway host key fingerprint; any key is accepted when unset
    pub host_key_fingerprint: Option<String>,

    /// How gateway connections map onto forwarded channels
    pub channel_mode: ChannelMode,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            forward_address: String::new(),
            username: String::new(),
            private_key_path: PathBuf::new(),
            connect_timeout: Duration::from_secs(30),
            host_key_fingerprint: None,
            channel_mode: ChannelMode::default(),
        }
    }
}

/// How connections accepted by the gateway reach the client
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelMode {
    /// All connections of a tunnel share the one forwarded channel opened
    /// when the tunnel was created. Concurrent connections interleave.
    #[default]
    Shared,
    /// Every accepted connection gets its own forwarded channel
    PerConnection,
}

/// Inbound authentication policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Username accepted for password authentication
    pub username: String,

    /// Password accepted for `username`
    pub password: String,

    /// OpenSSH `authorized_keys` files accepted for public key authentication
    pub authorized_keys: Vec<PathBuf>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            username: "testuser".to_string(),
            password: String::new(),
            authorized_keys: vec![],
        }
    }
}

/// Immutable, validated settings handed to the tunnel broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardSettings {
    /// Gateway SSH address
    pub gateway_address: String,
    /// Where the gateway listens on our behalf
    pub forward_address: BindAddress,
    /// Username on the gateway
    pub username: String,
    /// Dial timeout
    pub connect_timeout: Duration,
    /// Expected gateway host key fingerprint
    pub host_key_fingerprint: Option<String>,
    /// Channel mapping for accepted connections
    pub channel_mode: ChannelMode,
}

impl BrokerConfig {
    /// Check that every required field is present and well-formed
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_str("listen_address", &self.listen_address)?;
        require_path("host_key_path", &self.host_key_path)?;
        require_str("gateway.address", &self.gateway.address)?;
        require_str("gateway.forward_address", &self.gateway.forward_address)?;
        require_str("gateway.username", &self.gateway.username)?;
        require_path("gateway.private_key_path", &self.gateway.private_key_path)?;

        self.gateway.forward_address.parse::<BindAddress>()?;

        if self.gateway.connect_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "gateway.connect_timeout must be at least one second".to_string(),
            ));
        }

        Ok(())
    }

    /// Validate and extract the settings the tunnel broker runs with
    pub fn forward_settings(&self) -> Result<ForwardSettings, ConfigError> {
        self.validate()?;

        Ok(ForwardSettings {
            gateway_address: self.gateway.address.clone(),
            forward_address: self.gateway.forward_address.parse()?,
            username: self.gateway.username.clone(),
            connect_timeout: self.gateway.connect_timeout,
            host_key_fingerprint: self.gateway.host_key_fingerprint.clone(),
            channel_mode: self.gateway.channel_mode,
        })
    }
}

/// Durations are written as whole seconds in the config file
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

fn require_str(name: &str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::MissingField(name.to_string()));
    }
    Ok(())
}

fn require_path(name: &str, value: &Path) -> Result<(), ConfigError> {
    if value.as_os_str().is_empty() {
        return Err(ConfigError::MissingField(name.to_string()));
    }
    Ok(())
}

//! Shared broker state

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use wh_core::config::{BrokerConfig, ForwardSettings};

use crate::auth::{Authenticator, StaticAuthenticator};
use crate::gateway::SshGatewayDialer;

/// State shared by every client session
pub struct BrokerState {
    /// Validated forwarding settings
    pub settings: Arc<ForwardSettings>,
    /// Gateway dialer, holding the gateway identity key
    pub dialer: Arc<SshGatewayDialer>,
    /// Inbound authentication policy
    pub authenticator: Arc<dyn Authenticator>,
    /// Delay before answering a rejected authentication attempt
    pub auth_rejection_time: Duration,
}

impl BrokerState {
    pub fn new(
        settings: Arc<ForwardSettings>,
        dialer: Arc<SshGatewayDialer>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            settings,
            dialer,
            authenticator,
            auth_rejection_time: Duration::from_secs(1),
        }
    }

    pub fn with_auth_rejection_time(mut self, delay: Duration) -> Self {
        self.auth_rejection_time = delay;
        self
    }

    /// Build state from configuration, loading the gateway key and any
    /// authorized keys files
    pub fn from_config(config: &BrokerConfig) -> Result<Self> {
        let settings = Arc::new(config.forward_settings()?);
        let dialer = SshGatewayDialer::from_key_file(
            Arc::clone(&settings),
            &config.gateway.private_key_path,
        )?;
        let authenticator = StaticAuthenticator::from_config(&config.auth)
            .context("Failed to load authorized keys")?;

        Ok(Self::new(settings, Arc::new(dialer), Arc::new(authenticator))
            .with_auth_rejection_time(config.auth_rejection_time))
    }
}

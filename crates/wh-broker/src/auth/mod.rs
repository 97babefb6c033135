//! Inbound client authentication
//!
//! The broker serves a single trusted client. Password authentication checks
//! one configured username and password; public key authentication is
//! enabled when `authorized_keys` files are configured.

mod keys;

pub use keys::AuthorizedKeys;

use russh::MethodSet;
use russh_keys::key::PublicKey;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use wh_core::config::AuthConfig;

/// Decides whether an inbound client may open a session
pub trait Authenticator: Send + Sync {
    fn check_password(&self, user: &str, password: &str) -> bool;

    fn check_public_key(&self, _user: &str, _key: &PublicKey) -> bool {
        false
    }

    /// Authentication methods to advertise
    fn methods(&self) -> MethodSet {
        MethodSet::PASSWORD
    }
}

/// Credentials fixed at startup
pub struct StaticAuthenticator {
    username: String,
    password: String,
    keys: AuthorizedKeys,
}

impl StaticAuthenticator {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            keys: AuthorizedKeys::new(),
        }
    }

    /// Build from configuration, loading any authorized keys files
    pub fn from_config(config: &AuthConfig) -> anyhow::Result<Self> {
        let mut auth = Self::new(&config.username, &config.password);
        if !config.authorized_keys.is_empty() {
            auth.keys = AuthorizedKeys::load_from_files(&config.authorized_keys)?;
        }
        Ok(auth)
    }

    pub fn with_keys(mut self, keys: AuthorizedKeys) -> Self {
        self.keys = keys;
        self
    }
}

impl Authenticator for StaticAuthenticator {
    fn check_password(&self, user: &str, password: &str) -> bool {
        // Both comparisons always run.
        let user_ok = constant_time_eq(user.as_bytes(), self.username.as_bytes());
        let password_ok = constant_time_eq(password.as_bytes(), self.password.as_bytes());
        user_ok & password_ok
    }

    fn check_public_key(&self, user: &str, key: &PublicKey) -> bool {
        user == self.username && self.keys.is_authorized(key)
    }

    fn methods(&self) -> MethodSet {
        if self.keys.is_empty() {
            MethodSet::PASSWORD
        } else {
            MethodSet::PASSWORD | MethodSet::PUBLICKEY
        }
    }
}

/// Compare secrets in constant time, lengths included
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let a = Sha256::digest(a);
    let b = Sha256::digest(b);
    a.as_slice().ct_eq(b.as_slice()).into()
}

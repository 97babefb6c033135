//! wh-core: Core abstractions and configuration for wormhole
//!
//! This crate provides the configuration record, the error taxonomy,
//! identifier types, and the traits that separate the tunnel engine from
//! the SSH transport it runs over.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use error::{ConfigError, FailureScope, TunnelError, WhError};
pub use types::{BindAddress, PipeId, TunnelId};

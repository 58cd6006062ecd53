//! Broker connection configuration

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Connection parameters for the broker, validated eagerly at construction.
///
/// There are no process-wide defaults: owning services read their environment
/// and pass explicit values here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Broker hostname or IP address
    pub host: String,

    /// Broker port
    pub port: u16,

    /// Maximum number of connection attempts
    pub connection_attempts: u32,

    /// Delay between connection attempts
    pub retry_delay: Duration,
}

impl ConnectionConfig {
    /// Validate and build a configuration.
    ///
    /// Each invalid parameter yields its own [`ConfigError`] variant so the
    /// caller can tell which one was rejected.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        connection_attempts: u32,
        retry_delay: Duration,
    ) -> Result<Self, ConfigError> {
        let host = host.into();
        if host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if connection_attempts == 0 {
            return Err(ConfigError::InvalidConnectionAttempts);
        }
        if retry_delay.is_zero() {
            return Err(ConfigError::InvalidRetryDelay);
        }

        Ok(Self {
            host,
            port,
            connection_attempts,
            retry_delay,
        })
    }
}

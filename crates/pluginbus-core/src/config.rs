//! Centralized configuration for pluginbus.
//!
//! Constants for the broker and the plugin runtime, plus the runtime settings
//! a broker instance is started with.

use crate::error::{BusError, Result};
use std::time::Duration;

/// Broker-side configuration.
pub struct BrokerConfig;

impl BrokerConfig {
    pub const DEFAULT_HOST: &'static str = "127.0.0.1";
    pub const DEFAULT_PORT: u16 = 7777;
    pub const MAX_CONNECTIONS: usize = 1024;
    /// Largest frame accepted on a connection. Payloads are base64 encoded,
    /// so the usable payload is about three quarters of this (~12MB).
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024; // 16MB
    pub const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);
    /// How long a forward may wait on a destination that is not reading.
    pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
}

/// Plugin-side configuration.
pub struct PluginConfig;

impl PluginConfig {
    /// Environment variable the launcher uses to hand plugins the broker address.
    pub const MASTER_ADDR_ENV: &'static str = "MASTER_ADDR";
    /// Environment variable the launcher uses to pass the broker's frame limit.
    pub const MAX_MESSAGE_SIZE_ENV: &'static str = "PLUGINBUS_MAX_MESSAGE_SIZE";
    /// Default frame limit; must not exceed the broker's.
    pub const MAX_MESSAGE_SIZE: usize = BrokerConfig::MAX_MESSAGE_SIZE;
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

    /// Read the broker address from `MASTER_ADDR`.
    pub fn master_addr_from_env() -> Result<String> {
        match std::env::var(Self::MASTER_ADDR_ENV) {
            Ok(addr) if !addr.trim().is_empty() => Ok(addr),
            _ => Err(BusError::Config {
                message: format!("{} environment variable not set", Self::MASTER_ADDR_ENV),
            }),
        }
    }

    /// Read the frame limit from `PLUGINBUS_MAX_MESSAGE_SIZE`, if set.
    pub fn max_message_size_from_env() -> Result<Option<usize>> {
        match std::env::var(Self::MAX_MESSAGE_SIZE_ENV) {
            Ok(value) => Self::parse_max_message_size(&value).map(Some),
            Err(_) => Ok(None),
        }
    }

    fn parse_max_message_size(value: &str) -> Result<usize> {
        match value.trim().parse::<usize>() {
            Ok(size) if size > 0 => Ok(size),
            _ => Err(BusError::Config {
                message: format!(
                    "{} must be a positive byte count, got {:?}",
                    Self::MAX_MESSAGE_SIZE_ENV,
                    value
                ),
            }),
        }
    }
}

/// Runtime settings for a broker instance.
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    /// Address to bind, e.g. `127.0.0.1:7777`. Port 0 lets the OS pick.
    pub bind_addr: String,
    pub max_connections: usize,
    pub max_message_size: usize,
    /// How long a fresh connection may take to send its registration record.
    pub registration_timeout: Duration,
    /// How long forwarding may block on one destination before it is dropped.
    pub write_timeout: Duration,
}

impl BrokerSettings {
    pub fn new(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            ..Self::default()
        }
    }

    pub fn with_registration_timeout(mut self, timeout: Duration) -> Self {
        self.registration_timeout = timeout;
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            bind_addr: format!("{}:{}", BrokerConfig::DEFAULT_HOST, BrokerConfig::DEFAULT_PORT),
            max_connections: BrokerConfig::MAX_CONNECTIONS,
            max_message_size: BrokerConfig::MAX_MESSAGE_SIZE,
            registration_timeout: BrokerConfig::REGISTRATION_TIMEOUT,
            write_timeout: BrokerConfig::WRITE_TIMEOUT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = BrokerSettings::default();
        assert_eq!(settings.bind_addr, "127.0.0.1:7777");
        assert_eq!(settings.max_message_size, BrokerConfig::MAX_MESSAGE_SIZE);
    }

    #[test]
    fn test_builder_overrides() {
        let settings = BrokerSettings::new("127.0.0.1:0")
            .with_registration_timeout(Duration::from_millis(250))
            .with_max_message_size(1024);
        assert_eq!(settings.bind_addr, "127.0.0.1:0");
        assert_eq!(settings.registration_timeout, Duration::from_millis(250));
        assert_eq!(settings.max_message_size, 1024);
        assert_eq!(settings.max_connections, BrokerConfig::MAX_CONNECTIONS);
    }

    #[test]
    fn test_parse_max_message_size() {
        assert_eq!(PluginConfig::parse_max_message_size("1048576").unwrap(), 1048576);
        assert_eq!(PluginConfig::parse_max_message_size(" 42 ").unwrap(), 42);
        assert!(matches!(
            PluginConfig::parse_max_message_size("0"),
            Err(BusError::Config { .. })
        ));
        assert!(PluginConfig::parse_max_message_size("lots").is_err());
        assert!(PluginConfig::MAX_MESSAGE_SIZE <= BrokerConfig::MAX_MESSAGE_SIZE);
    }

    #[test]
    fn test_timeouts_are_reasonable() {
        assert!(PluginConfig::CONNECT_TIMEOUT > Duration::ZERO);
        assert!(PluginConfig::DEFAULT_REQUEST_TIMEOUT > PluginConfig::CONNECT_TIMEOUT);
    }
}

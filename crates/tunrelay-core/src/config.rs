use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pool::DEFAULT_CLASS_CAPACITY;
use crate::proxy::{DirectDialer, DEFAULT_CONNECT_TIMEOUT_SECS};
use crate::relay::RelayConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    /// Copy engine timing and buffer pool sizing.
    #[serde(default)]
    pub relay: RelaySettings,

    /// Upstream connection settings.
    #[serde(default)]
    pub dialer: DialerConfig,

    /// Capture source settings.
    #[serde(default)]
    pub stack: StackConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneralConfig {
    /// Default log filter, overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelaySettings {
    /// How long the remaining direction of a stream relay may keep reading
    /// once the other direction has ended.
    #[serde(default = "default_tcp_wait_timeout_secs")]
    pub tcp_wait_timeout_secs: u64,

    /// Idle timeout of a datagram relay.
    #[serde(default = "default_udp_timeout_secs")]
    pub udp_timeout_secs: u64,

    /// Inactivity cap of stream relays. Unset leaves them uncapped.
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,

    /// Idle buffers kept per pool size class.
    #[serde(default = "default_pool_class_capacity")]
    pub pool_class_capacity: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            tcp_wait_timeout_secs: default_tcp_wait_timeout_secs(),
            udp_timeout_secs: default_udp_timeout_secs(),
            idle_timeout_secs: None,
            pool_class_capacity: default_pool_class_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DialerConfig {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Local address outgoing sockets bind to.
    #[serde(default)]
    pub bind_addr: Option<IpAddr>,
}

impl Default for DialerConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            bind_addr: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StackConfig {
    /// Listener receiving redirected connections.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Capacity of the stack-to-tunnel event channel.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// Upper bound accepted for every timeout setting: one day.
pub const MAX_TIMEOUT_SECS: u64 = 24 * 60 * 60;

fn default_log_level() -> String {
    "info".to_string()
}

fn default_tcp_wait_timeout_secs() -> u64 {
    5
}

fn default_udp_timeout_secs() -> u64 {
    60
}

fn default_pool_class_capacity() -> usize {
    DEFAULT_CLASS_CAPACITY
}

fn default_connect_timeout_secs() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

fn default_listen_addr() -> String {
    "127.0.0.1:12345".to_string()
}

fn default_channel_capacity() -> usize {
    256
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn default_config() -> Self {
        Self {
            general: GeneralConfig::default(),
            relay: RelaySettings::default(),
            dialer: DialerConfig::default(),
            stack: StackConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.relay.udp_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "relay.udp_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.dialer.connect_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "dialer.connect_timeout_secs must be greater than zero".to_string(),
            ));
        }
        let timeouts = [
            ("relay.tcp_wait_timeout_secs", Some(self.relay.tcp_wait_timeout_secs)),
            ("relay.udp_timeout_secs", Some(self.relay.udp_timeout_secs)),
            ("relay.idle_timeout_secs", self.relay.idle_timeout_secs),
            ("dialer.connect_timeout_secs", Some(self.dialer.connect_timeout_secs)),
        ];
        for (name, secs) in timeouts {
            if secs.is_some_and(|secs| secs > MAX_TIMEOUT_SECS) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must not exceed {MAX_TIMEOUT_SECS} seconds"
                )));
            }
        }
        if self.relay.idle_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "relay.idle_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.stack.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "stack.channel_capacity must be greater than zero".to_string(),
            ));
        }
        self.listen_addr()?;
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.stack.listen_addr.parse().map_err(|_| {
            ConfigError::Invalid(format!(
                "stack.listen_addr is not a socket address: {}",
                self.stack.listen_addr
            ))
        })
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            tcp_wait_timeout: Duration::from_secs(self.relay.tcp_wait_timeout_secs),
            udp_timeout: Duration::from_secs(self.relay.udp_timeout_secs),
            idle_timeout: self.relay.idle_timeout_secs.map(Duration::from_secs),
        }
    }

    pub fn direct_dialer(&self) -> DirectDialer {
        let dialer = DirectDialer::new(Duration::from_secs(self.dialer.connect_timeout_secs));
        match self.dialer.bind_addr {
            Some(addr) => dialer.with_bind_addr(addr),
            None => dialer,
        }
    }
}

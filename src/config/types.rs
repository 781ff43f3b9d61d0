//! Configuration Types

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::transport::AcceptMode;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub relay: RelaySettings,
    pub monitoring: MonitoringConfig,
}

/// Listener and far target
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// `host:port` of the far side, or `echo` for the in-process echo target.
    pub target: String,
    pub accept_mode: AcceptMode,
}

/// Tuning values handed to the relay core at construction time
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RelaySettings {
    pub buffer_size: usize,
    #[serde(with = "humantime_serde")]
    pub accept_poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub dial_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub drain_timeout: Duration,
}

/// Monitoring configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub metrics_enabled: bool,
    pub metrics_addr: SocketAddr,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 1543)),
            target: "127.0.0.1:1544".to_string(),
            accept_mode: AcceptMode::Cancellable,
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            buffer_size: crate::relay::DEFAULT_BUFFER_SIZE,
            accept_poll_interval: Duration::from_secs(1),
            dial_timeout: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            metrics_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            log_level: "info".to_string(),
        }
    }
}

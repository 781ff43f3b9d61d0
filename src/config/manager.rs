//! Configuration Manager

use super::Config;
use crate::transport::{AcceptMode, ECHO_TARGET};
use crate::Result;
use anyhow::{bail, Context};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Prefix shared by all environment overrides.
pub const ENV_PREFIX: &str = "TUNNEL_RELAY_";

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config = Self::parse(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            config.validate().context("Configuration validation failed")?;

            tracing::info!("Configuration loaded and validated successfully");
            Ok(config)
        } else {
            tracing::warn!("Configuration file not found at {}, using defaults", path.display());
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Parse a TOML document; missing sections and fields take defaults.
    pub fn parse(content: &str) -> Result<Config> {
        Ok(toml::from_str(content)?)
    }

    /// Load the file at `path` (or defaults when it is absent), then apply
    /// `TUNNEL_RELAY_*` environment overrides on top.
    pub fn load(path: &Path) -> Result<Config> {
        Self::load_layered(path, |key| std::env::var(key).ok())
    }

    /// [`ConfigManager::load`] with environment lookups supplied by the caller.
    pub fn load_layered<F>(path: &Path, lookup: F) -> Result<Config>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::load_from_file(path)?;
        Self::apply_env(&mut config, lookup)?;
        config
            .validate()
            .context("Configuration invalid after environment overrides")?;
        Ok(config)
    }

    /// Apply `TUNNEL_RELAY_*` overrides read through `lookup`.
    pub fn apply_env<F>(config: &mut Config, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(listen) = var("LISTEN_ADDR") {
            config.server.listen_addr = listen
                .parse::<SocketAddr>()
                .with_context(|| format!("Invalid {}LISTEN_ADDR: {}", ENV_PREFIX, listen))?;
        }

        if let Some(target) = var("TARGET") {
            config.server.target = target;
        }

        if let Some(mode) = var("ACCEPT_MODE") {
            config.server.accept_mode = mode
                .parse::<AcceptMode>()
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("Invalid {}ACCEPT_MODE", ENV_PREFIX))?;
        }

        if let Some(buffer_size) = var("BUFFER_SIZE") {
            config.relay.buffer_size = buffer_size
                .parse::<usize>()
                .with_context(|| format!("Invalid {}BUFFER_SIZE: {}", ENV_PREFIX, buffer_size))?;
        }

        if let Some(interval) = var("ACCEPT_POLL_INTERVAL") {
            config.relay.accept_poll_interval = humantime::parse_duration(&interval)
                .with_context(|| format!("Invalid {}ACCEPT_POLL_INTERVAL: {}", ENV_PREFIX, interval))?;
        }

        if let Some(timeout) = var("DIAL_TIMEOUT") {
            config.relay.dial_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid {}DIAL_TIMEOUT: {}", ENV_PREFIX, timeout))?;
        }

        if let Some(timeout) = var("DRAIN_TIMEOUT") {
            config.relay.drain_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid {}DRAIN_TIMEOUT: {}", ENV_PREFIX, timeout))?;
        }

        if let Some(enabled) = var("METRICS_ENABLED") {
            config.monitoring.metrics_enabled = enabled
                .parse::<bool>()
                .with_context(|| format!("Invalid {}METRICS_ENABLED: {}", ENV_PREFIX, enabled))?;
        }

        if let Some(addr) = var("METRICS_ADDR") {
            config.monitoring.metrics_addr = addr
                .parse::<SocketAddr>()
                .with_context(|| format!("Invalid {}METRICS_ADDR: {}", ENV_PREFIX, addr))?;
        }

        if let Some(log_level) = var("LOG_LEVEL") {
            config.monitoring.log_level = log_level;
        }

        Ok(())
    }
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_server_config()
            .context("Server configuration validation failed")?;

        self.validate_relay_settings()
            .context("Relay configuration validation failed")?;

        self.validate_monitoring_config()
            .context("Monitoring configuration validation failed")?;

        Ok(())
    }

    fn validate_server_config(&self) -> Result<()> {
        let target = self.server.target.trim();
        if target.is_empty() {
            bail!("target must not be empty");
        }

        if !target.eq_ignore_ascii_case(ECHO_TARGET) {
            let Some((host, port)) = target.rsplit_once(':') else {
                bail!("target must be 'echo' or 'host:port', got '{}'", target);
            };
            if host.is_empty() {
                bail!("target host must not be empty");
            }
            match port.parse::<u16>() {
                Ok(0) | Err(_) => bail!("target port must be between 1 and 65535, got '{}'", port),
                Ok(_) => {}
            }
        }

        Ok(())
    }

    fn validate_relay_settings(&self) -> Result<()> {
        if self.relay.buffer_size < 64 {
            bail!("buffer_size must be at least 64 bytes");
        }

        if self.relay.buffer_size > 1048576 {
            bail!("buffer_size cannot exceed 1MB");
        }

        if self.relay.accept_poll_interval.is_zero() {
            bail!("accept_poll_interval must be greater than 0");
        }

        if self.relay.accept_poll_interval > Duration::from_secs(60) {
            bail!("accept_poll_interval cannot exceed 60 seconds");
        }

        if self.relay.dial_timeout.is_zero() {
            bail!("dial_timeout must be greater than 0");
        }

        if self.relay.drain_timeout.is_zero() {
            bail!("drain_timeout must be greater than 0");
        }

        if self.relay.drain_timeout > Duration::from_secs(3600) {
            bail!("drain_timeout cannot exceed 1 hour");
        }

        Ok(())
    }

    fn validate_monitoring_config(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.monitoring.log_level.as_str()) {
            bail!("log_level must be one of: {}", valid_log_levels.join(", "));
        }

        if self.monitoring.metrics_enabled && self.monitoring.metrics_addr == self.server.listen_addr {
            bail!("metrics_addr must differ from listen_addr");
        }

        Ok(())
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(
        &mut self,
        listen: Option<&str>,
        target: Option<&str>,
        buffer_size: Option<usize>,
        drain_timeout: Option<Duration>,
        no_metrics: bool,
        log_level: Option<&str>,
    ) {
        if let Some(listen) = listen {
            if let Ok(addr) = listen.parse::<SocketAddr>() {
                self.server.listen_addr = addr;
                tracing::info!("CLI override: listen address set to {}", addr);
            } else {
                tracing::warn!("Invalid listen address provided: {}", listen);
            }
        }

        if let Some(target) = target {
            self.server.target = target.to_string();
            tracing::info!("CLI override: target set to {}", target);
        }

        if let Some(buffer_size) = buffer_size {
            self.relay.buffer_size = buffer_size;
            tracing::info!("CLI override: buffer size set to {} bytes", buffer_size);
        }

        if let Some(drain_timeout) = drain_timeout {
            self.relay.drain_timeout = drain_timeout;
            tracing::info!("CLI override: drain timeout set to {:?}", drain_timeout);
        }

        if no_metrics {
            self.monitoring.metrics_enabled = false;
            tracing::info!("CLI override: metrics disabled");
        }

        if let Some(log_level) = log_level {
            self.monitoring.log_level = log_level.to_string();
            tracing::info!("CLI override: log level set to {}", log_level);
        }
    }
}

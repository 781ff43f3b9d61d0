//! Tunnel Relay
//!
//! Accepts TCP connections and relays each one to a fixed far target.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tunnel_relay::{
    config::ConfigManager,
    metrics::{MetricsServer, RelayMetrics},
    shutdown,
    transport::{build_dialer, Listener, TcpAcceptor},
    Supervisor,
};

/// CLI arguments for the tunnel relay
#[derive(Parser, Debug)]
#[command(name = "tunnel-relay")]
#[command(about = "Full-duplex TCP tunnel relay")]
#[command(version)]
#[command(long_about = "
Full-duplex TCP tunnel relay

Every accepted connection is paired with a freshly dialed connection to the
target and bytes are copied both ways until either side finishes.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Environment variables
3. Configuration file
4. Built-in defaults

RUST_LOG, when set, takes precedence over every log level setting.

Environment variables:
  TUNNEL_RELAY_LISTEN_ADDR          - Listen address (e.g., 127.0.0.1:1543)
  TUNNEL_RELAY_TARGET               - Far target (host:port or 'echo')
  TUNNEL_RELAY_ACCEPT_MODE          - cancellable or deadline
  TUNNEL_RELAY_BUFFER_SIZE          - Copy buffer size in bytes
  TUNNEL_RELAY_ACCEPT_POLL_INTERVAL - Accept deadline in deadline mode (e.g., 1s)
  TUNNEL_RELAY_DIAL_TIMEOUT         - Far dial timeout (e.g., 10s)
  TUNNEL_RELAY_DRAIN_TIMEOUT        - Shutdown drain deadline (e.g., 30s)
  TUNNEL_RELAY_METRICS_ENABLED      - Serve Prometheus metrics (true/false)
  TUNNEL_RELAY_METRICS_ADDR         - Metrics address (e.g., 127.0.0.1:8080)
  TUNNEL_RELAY_LOG_LEVEL            - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(
        short,
        long,
        default_value = "config.toml",
        help = "Path to configuration file"
    )]
    pub config: PathBuf,

    /// Listen address (overrides config file)
    #[arg(short, long, help = "Listen address (e.g., 127.0.0.1:1543)")]
    pub listen: Option<String>,

    /// Far target (overrides config file)
    #[arg(short, long, help = "Far target, host:port or 'echo'")]
    pub target: Option<String>,

    /// Buffer size in bytes
    #[arg(long, help = "Copy buffer size in bytes")]
    pub buffer_size: Option<usize>,

    /// Drain deadline on shutdown
    #[arg(long, value_parser = humantime::parse_duration, help = "Drain deadline on shutdown (e.g., 30s)")]
    pub drain_timeout: Option<Duration>,

    /// Disable the metrics endpoint
    #[arg(long, help = "Disable the Prometheus metrics endpoint")]
    pub no_metrics: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, help = "Log level (overrides monitoring.log_level)")]
    pub log_level: Option<String>,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let mut config = ConfigManager::load(&args.config)?;

    let log_level = if args.verbose {
        Some("debug")
    } else {
        args.log_level.as_deref()
    };
    config.merge_with_cli_args(
        args.listen.as_deref(),
        args.target.as_deref(),
        args.buffer_size,
        args.drain_timeout,
        args.no_metrics,
        log_level,
    );

    config
        .validate()
        .context("Final configuration validation failed")?;

    init_tracing(&config.monitoring.log_level)?;

    info!("Starting tunnel-relay v{}", env!("CARGO_PKG_VERSION"));
    info!(config = %args.config.display(), log_level = %config.monitoring.log_level, "Configuration loaded");

    if args.validate_config {
        info!("Configuration is valid");
        info!("Configuration summary:");
        info!("  Listen address: {}", config.server.listen_addr);
        info!("  Target: {}", config.server.target);
        info!("  Accept mode: {}", config.server.accept_mode);
        info!("  Buffer size: {} bytes", config.relay.buffer_size);
        info!("  Dial timeout: {:?}", config.relay.dial_timeout);
        info!("  Drain timeout: {:?}", config.relay.drain_timeout);
        info!(
            "  Metrics: {}",
            if config.monitoring.metrics_enabled {
                config.monitoring.metrics_addr.to_string()
            } else {
                "disabled".to_string()
            }
        );
        return Ok(());
    }

    let metrics = Arc::new(RelayMetrics::new().context("Failed to register metrics")?);
    let metrics_shutdown = CancellationToken::new();

    let metrics_handle = if config.monitoring.metrics_enabled {
        let server = MetricsServer::new(Arc::clone(&metrics), config.monitoring.metrics_addr);
        let token = metrics_shutdown.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = server.start(token).await {
                error!("Metrics server error: {:#}", e);
            }
        }))
    } else {
        info!("Metrics server disabled");
        None
    };

    let listener: Arc<dyn Listener> = Arc::new(
        TcpAcceptor::bind(config.server.listen_addr, config.server.accept_mode)
            .await
            .with_context(|| format!("Failed to bind listener to {}", config.server.listen_addr))?,
    );
    let dialer = build_dialer(
        &config.server.target,
        config.relay.dial_timeout,
        config.relay.buffer_size,
    );
    let supervisor = Arc::new(Supervisor::from_config(&config, metrics));

    // Cancelled when the accept loop exits on its own so main stops waiting for a signal.
    let serve_finished = CancellationToken::new();
    let server_handle = {
        let supervisor = Arc::clone(&supervisor);
        let listener = Arc::clone(&listener);
        let serve_finished = serve_finished.clone();
        tokio::spawn(async move {
            let result = supervisor.serve(listener, dialer).await;
            serve_finished.cancel();
            result
        })
    };

    info!(
        listen = %listener.address(),
        far_target = %config.server.target,
        "tunnel-relay started, press Ctrl+C or send SIGTERM/SIGINT to shut down"
    );

    let summary = shutdown::shutdown_on_signal(&supervisor, listener.as_ref(), serve_finished).await?;
    info!(forced = summary.forced, "Relays drained");

    let serve_result = match server_handle.await {
        Ok(result) => result.context("Accept loop failed"),
        Err(e) => Err(anyhow::anyhow!("Accept loop task failed: {}", e)),
    };

    metrics_shutdown.cancel();
    if let Some(handle) = metrics_handle {
        if let Err(e) = handle.await {
            error!("Metrics server task failed: {}", e);
        }
    }

    info!("Server shutdown complete");
    serve_result
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .with(env_filter)
        .init();

    Ok(())
}

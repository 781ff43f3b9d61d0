//! Graceful Shutdown Handling
//!
//! Waits for a termination signal (SIGTERM, SIGINT or Ctrl+C) or a
//! programmatic trigger and hands over to the supervisor's drain.

use std::fmt;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::supervisor::{DrainSummary, Supervisor};
use crate::transport::Listener;
use crate::Result;

/// What started the shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Terminate,
    Interrupt,
    CtrlC,
    /// The external trigger token was cancelled.
    Requested,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownSignal::Terminate => f.write_str("SIGTERM"),
            ShutdownSignal::Interrupt => f.write_str("SIGINT"),
            ShutdownSignal::CtrlC => f.write_str("Ctrl+C"),
            ShutdownSignal::Requested => f.write_str("shutdown request"),
        }
    }
}

/// Wait for a process termination signal.
pub async fn wait_for_signal() -> Result<ShutdownSignal> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

        let received = tokio::select! {
            _ = sigterm.recv() => ShutdownSignal::Terminate,
            _ = sigint.recv() => ShutdownSignal::Interrupt,
            _ = signal::ctrl_c() => ShutdownSignal::CtrlC,
        };
        info!("Received {}, initiating graceful shutdown", received);
        Ok(received)
    }

    #[cfg(windows)]
    {
        signal::ctrl_c().await?;
        info!("Received Ctrl+C, initiating graceful shutdown");
        Ok(ShutdownSignal::CtrlC)
    }
}

/// Wait for a signal or for `trigger` to be cancelled, then drain the session.
pub async fn shutdown_on_signal(
    supervisor: &Supervisor,
    listener: &dyn Listener,
    trigger: CancellationToken,
) -> Result<DrainSummary> {
    let reason = tokio::select! {
        received = wait_for_signal() => received?,
        _ = trigger.cancelled() => {
            info!("Shutdown requested, initiating graceful shutdown");
            ShutdownSignal::Requested
        }
    };

    let summary = supervisor.shutdown(listener).await;
    info!(
        reason = %reason,
        forced = summary.forced,
        elapsed = ?summary.elapsed,
        "Graceful shutdown completed"
    );
    Ok(summary)
}

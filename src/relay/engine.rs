//! Relay Engine

use std::fmt;
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::{Direction, RelayError, RelayInstance};
use crate::config::Config;
use crate::endpoint::{Chunk, SharedEndpoint};
use crate::metrics::MetricsSink;

/// Default size of the per-direction copy buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Aggregate result of a relay.
#[derive(Debug)]
pub enum RelayOutcome {
    /// Both directions reached end-of-stream.
    Completed,
    /// At least one direction stopped because the cancel token fired.
    Cancelled,
    /// The first error observed, by completion order.
    Failed(RelayError),
}

impl RelayOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RelayOutcome::Completed => "completed",
            RelayOutcome::Cancelled => "cancelled",
            RelayOutcome::Failed(_) => "failed",
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, RelayOutcome::Completed)
    }
}

impl fmt::Display for RelayOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayOutcome::Failed(e) => write!(f, "failed: {}", e),
            other => f.write_str(other.label()),
        }
    }
}

/// How a single copy direction ended.
#[derive(Debug)]
enum DirectionEnd {
    Finished,
    Cancelled,
    Failed(RelayError),
}

/// Copies bytes between a near and a far endpoint in both directions
pub struct RelayEngine {
    buffer_size: usize,
    metrics: Arc<dyn MetricsSink>,
}

impl RelayEngine {
    pub fn new(buffer_size: usize, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
            metrics,
        }
    }

    pub fn from_config(config: &Config, metrics: Arc<dyn MetricsSink>) -> Self {
        Self::new(config.relay.buffer_size, metrics)
    }

    /// Relay between `near` and `far` until both directions have ended.
    ///
    /// A direction reaching end-of-stream half-closes its destination and
    /// lets the other direction run on. A failing direction closes both
    /// endpoints, which ends the other one too. Both endpoints are closed
    /// before this returns, whatever the outcome.
    pub async fn relay(&self, near: SharedEndpoint, far: SharedEndpoint, cancel: CancellationToken) -> RelayOutcome {
        let instance = Arc::new(RelayInstance::new(near.peer(), far.peer(), cancel));
        self.run(&instance, near, far).await
    }

    /// Relay on behalf of an already registered instance.
    #[instrument(skip_all, fields(relay_id = %instance.id))]
    pub async fn run(&self, instance: &Arc<RelayInstance>, near: SharedEndpoint, far: SharedEndpoint) -> RelayOutcome {
        info!(near = %instance.near_peer, far = %instance.far_peer, "Starting relay");
        self.metrics.relay_started();

        let mut tasks = JoinSet::new();
        tasks.spawn(copy_loop(
            Direction::NearToFar,
            Arc::clone(&near),
            Arc::clone(&far),
            Arc::clone(instance),
            Arc::clone(&self.metrics),
            self.buffer_size,
        ));
        tasks.spawn(copy_loop(
            Direction::FarToNear,
            Arc::clone(&far),
            Arc::clone(&near),
            Arc::clone(instance),
            Arc::clone(&self.metrics),
            self.buffer_size,
        ));

        let mut cancelled = false;
        let mut first_error: Option<RelayError> = None;

        while let Some(joined) = tasks.join_next().await {
            let end = match joined {
                Ok((direction, end)) => {
                    match &end {
                        DirectionEnd::Finished => debug!(%direction, "Direction reached end of stream"),
                        DirectionEnd::Cancelled => debug!(%direction, "Direction cancelled"),
                        DirectionEnd::Failed(e) if e.is_disconnect() => debug!(%direction, error = %e, "Direction disconnected"),
                        DirectionEnd::Failed(e) => warn!(%direction, error = %e, "Direction failed"),
                    }
                    end
                }
                Err(e) => {
                    warn!(error = %e, "Copy task did not complete");
                    DirectionEnd::Failed(RelayError::TaskFailed(e.to_string()))
                }
            };

            match end {
                DirectionEnd::Finished => {}
                DirectionEnd::Cancelled => cancelled = true,
                DirectionEnd::Failed(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                        // Only end-of-stream leaves the other direction running.
                        close_both(&near, &far).await;
                    }
                }
            }
        }

        close_both(&near, &far).await;

        let outcome = if cancelled {
            RelayOutcome::Cancelled
        } else if let Some(e) = first_error {
            RelayOutcome::Failed(e)
        } else {
            RelayOutcome::Completed
        };

        instance.set_outcome(outcome.label());
        instance.log_stats();
        self.metrics.relay_finished(&outcome);
        outcome
    }
}

async fn close_both(near: &SharedEndpoint, far: &SharedEndpoint) {
    let (near_closed, far_closed) = tokio::join!(near.close(), far.close());
    if let Err(e) = near_closed {
        debug!(error = %e, "Closing near endpoint failed");
    }
    if let Err(e) = far_closed {
        debug!(error = %e, "Closing far endpoint failed");
    }
}

/// Copy from `src` to `dst` until end-of-stream, an error, cancellation, or
/// `dst` being closed underneath us.
async fn copy_loop(
    direction: Direction,
    src: SharedEndpoint,
    dst: SharedEndpoint,
    instance: Arc<RelayInstance>,
    metrics: Arc<dyn MetricsSink>,
    buffer_size: usize,
) -> (Direction, DirectionEnd) {
    let cancel = instance.cancel_token().clone();
    let mut buf = vec![0u8; buffer_size];

    let end = loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => break DirectionEnd::Cancelled,
            _ = dst.closed() => break DirectionEnd::Failed(RelayError::EndpointClosed),
            result = src.read(&mut buf) => result,
        };

        let n = match chunk {
            Ok(Chunk::Data(0)) => {
                tokio::task::yield_now().await;
                continue;
            }
            Ok(Chunk::Data(n)) => n,
            Ok(Chunk::EndOfStream) => {
                // Propagate the half-close so the peer sees end-of-stream too.
                let shutdown = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break DirectionEnd::Cancelled,
                    result = dst.shutdown_write() => result,
                };
                if let Err(e) = shutdown {
                    debug!(%direction, error = %e, "Half-close failed");
                }
                break DirectionEnd::Finished;
            }
            Err(e) => break DirectionEnd::Failed(e),
        };

        let written = tokio::select! {
            biased;
            _ = cancel.cancelled() => break DirectionEnd::Cancelled,
            result = dst.write(&buf[..n]) => result,
        };

        match written {
            Ok(w) if w < n => break DirectionEnd::Failed(RelayError::ShortWrite { written: w, expected: n }),
            Ok(_) => {}
            Err(e) => break DirectionEnd::Failed(e),
        }

        instance.add_bytes(direction, n as u64);
        match direction {
            Direction::NearToFar => metrics.add_bytes_received(n),
            Direction::FarToNear => metrics.add_bytes_sent(n),
        }
    };

    (direction, end)
}

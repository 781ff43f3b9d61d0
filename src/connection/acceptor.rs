//! Accept Loop

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::endpoint::SharedEndpoint;
use crate::relay::RelayError;
use crate::supervisor::Supervisor;
use crate::transport::{AcceptMode, Dialer, Listener};

/// Pause after running out of file descriptors before accepting again.
const FD_EXHAUSTED_BACKOFF: Duration = Duration::from_millis(100);

/// Accepts near endpoints, dials their far side and hands the pairs to the
/// supervisor.
pub struct AcceptLoop {
    supervisor: Arc<Supervisor>,
    poll_interval: Duration,
    dial_timeout: Duration,
}

impl AcceptLoop {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        let settings = supervisor.settings();
        let poll_interval = settings.accept_poll_interval;
        let dial_timeout = settings.dial_timeout;
        Self {
            supervisor,
            poll_interval,
            dial_timeout,
        }
    }

    /// Accept until `cancel` fires or the listener fails.
    ///
    /// Returns `Ok(())` on cancellation. Errors tied to one incoming
    /// connection are logged and accepting continues. A listener-level
    /// accept error is returned unless the token had already fired, in which case it is the
    /// expected result of shutdown closing the listener.
    pub async fn run(&self, listener: &dyn Listener, dialer: &dyn Dialer, cancel: CancellationToken) -> Result<(), RelayError> {
        let mode = listener.accept_mode();
        info!(
            address = %listener.address(),
            far_target = %dialer.target(),
            accept_mode = %mode,
            "Starting accept loop"
        );

        loop {
            let near = match self.next_near(listener, mode, &cancel).await {
                Ok(Some(near)) => near,
                Ok(None) => break,
                Err(e) => {
                    error!(address = %listener.address(), error = %e, "Accept loop failed");
                    return Err(e);
                }
            };

            if cancel.is_cancelled() {
                debug!(near = %near.peer(), "Dropping connection accepted during shutdown");
                if let Err(e) = near.close().await {
                    debug!(error = %e, "Closing near endpoint accepted during shutdown failed");
                }
                break;
            }

            self.pair(near, dialer, &cancel).await;
        }

        info!(address = %listener.address(), "Accept loop stopped");
        Ok(())
    }

    /// Wait for the next near endpoint. `None` means the loop should stop.
    async fn next_near(
        &self,
        listener: &dyn Listener,
        mode: AcceptMode,
        cancel: &CancellationToken,
    ) -> Result<Option<SharedEndpoint>, RelayError> {
        loop {
            let accepted = match mode {
                AcceptMode::Cancellable => tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(None),
                    result = listener.accept() => result,
                },
                AcceptMode::Deadline => match timeout(self.poll_interval, listener.accept()).await {
                    Ok(result) => result,
                    Err(_) => {
                        if cancel.is_cancelled() {
                            return Ok(None);
                        }
                        continue;
                    }
                },
            };

            match accepted {
                Ok(near) => return Ok(Some(near)),
                Err(e) if cancel.is_cancelled() => {
                    debug!(error = %e, "Accept interrupted by shutdown");
                    return Ok(None);
                }
                Err(e) if e.is_timeout() => continue,
                Err(e) if e.is_transient_accept() => {
                    warn!(address = %listener.address(), error = %e, "Error accepting connection");
                    if e.is_fd_exhausted() {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return Ok(None),
                            _ = tokio::time::sleep(FD_EXHAUSTED_BACKOFF) => {}
                        }
                    }
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Dial the far side for `near` and hand the pair to the supervisor.
    /// Never waits for the relay itself.
    async fn pair(&self, near: SharedEndpoint, dialer: &dyn Dialer, cancel: &CancellationToken) {
        let dialed = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(near = %near.peer(), "Shutdown while dialing, closing near endpoint");
                if let Err(e) = near.close().await {
                    debug!(error = %e, "Closing near endpoint after cancelled dial failed");
                }
                return;
            }
            result = timeout(self.dial_timeout, dialer.dial()) => result,
        };

        let far = match dialed {
            Ok(Ok(far)) => far,
            Ok(Err(e)) => return self.reject(near, e).await,
            Err(_) => {
                let e = RelayError::dial(dialer.target(), format!("timed out after {:?}", self.dial_timeout));
                return self.reject(near, e).await;
            }
        };

        match self.supervisor.admit(Arc::clone(&near), Arc::clone(&far)) {
            Some(id) => debug!(relay_id = %id, near = %near.peer(), far = %far.peer(), "Relay admitted"),
            None => {
                debug!(near = %near.peer(), "Session shutting down, closing dialed pair");
                let (near_closed, far_closed) = tokio::join!(near.close(), far.close());
                if let Err(e) = near_closed.and(far_closed) {
                    debug!(error = %e, "Closing refused pair failed");
                }
            }
        }
    }

    async fn reject(&self, near: SharedEndpoint, e: RelayError) {
        warn!(near = %near.peer(), error = %e, "Far dial failed, closing near endpoint");
        self.supervisor.metrics().add_dial_failure();
        if let Err(close_err) = near.close().await {
            debug!(error = %close_err, "Closing rejected near endpoint failed");
        }
    }
}

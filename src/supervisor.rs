//! Session Supervisor
//!
//! Owns the session cancellation token, the registry of active relays and
//! the `Running -> ShuttingDown -> Drained` lifecycle. Relays are admitted
//! only while running; shutdown closes the listener, cancels every relay and
//! waits for them to drain, force-closing whatever is left once the drain
//! deadline passes.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, RelaySettings};
use crate::connection::AcceptLoop;
use crate::endpoint::SharedEndpoint;
use crate::metrics::MetricsSink;
use crate::relay::{RelayEngine, RelayError, RelayId, RelayInstance, RelayOutcome, RelayStats};
use crate::transport::{Dialer, Listener};

/// Tail of the drain window reserved for force-closing stalled endpoints.
/// Never more than half the drain timeout.
const FORCE_CLOSE_GRACE: Duration = Duration::from_millis(250);

/// Lifecycle of a session. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Running,
    ShuttingDown,
    Drained,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Running => f.write_str("running"),
            SessionState::ShuttingDown => f.write_str("shutting_down"),
            SessionState::Drained => f.write_str("drained"),
        }
    }
}

/// What happened during a drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    /// Relays still running at the deadline and closed by force.
    pub forced: usize,
    pub elapsed: Duration,
}

/// Registry entry for an admitted relay
struct ActiveRelay {
    instance: Arc<RelayInstance>,
    near: SharedEndpoint,
    far: SharedEndpoint,
    task: AbortHandle,
}

struct Registry {
    state: SessionState,
    relays: HashMap<RelayId, ActiveRelay>,
}

/// Count of running relay tasks with a wake-up when it reaches zero.
#[derive(Default)]
struct ActiveTracker {
    active: AtomicUsize,
    zero_notify: Notify,
}

impl ActiveTracker {
    fn increment(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    fn decrement(&self) {
        if self.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.zero_notify.notify_waiters();
        }
    }

    fn count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Returns false if the count is still non-zero after `timeout`.
    async fn wait_for_zero(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            // Registered before the check so a decrement in between is not missed.
            let notified = self.zero_notify.notified();
            if self.count() == 0 {
                return true;
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => return self.count() == 0,
            }
        }
    }
}

/// Removes a relay from the registry when its task ends, aborted or not.
struct RelayGuard {
    instance: Arc<RelayInstance>,
    registry: Arc<Mutex<Registry>>,
    tracker: Arc<ActiveTracker>,
    metrics: Arc<dyn MetricsSink>,
}

impl Drop for RelayGuard {
    fn drop(&mut self) {
        // The engine records an outcome unless its task was aborted first.
        if self.instance.outcome().is_none() {
            let outcome = RelayOutcome::Cancelled;
            self.instance.set_outcome(outcome.label());
            self.instance.log_stats();
            self.metrics.relay_finished(&outcome);
        }

        let mut registry = match self.registry.lock() {
            Ok(registry) => registry,
            Err(poisoned) => poisoned.into_inner(),
        };
        registry.relays.remove(&self.instance.id);
        drop(registry);
        self.tracker.decrement();
    }
}

/// Tracks active relays and drives graceful shutdown.
pub struct Supervisor {
    engine: Arc<RelayEngine>,
    metrics: Arc<dyn MetricsSink>,
    settings: RelaySettings,
    cancel: CancellationToken,
    registry: Arc<Mutex<Registry>>,
    tracker: Arc<ActiveTracker>,
    state_tx: watch::Sender<SessionState>,
}

impl Supervisor {
    pub fn new(settings: RelaySettings, metrics: Arc<dyn MetricsSink>) -> Self {
        let engine = RelayEngine::new(settings.buffer_size, Arc::clone(&metrics));
        Self::with_engine(engine, settings, metrics)
    }

    pub fn from_config(config: &Config, metrics: Arc<dyn MetricsSink>) -> Self {
        let engine = RelayEngine::from_config(config, Arc::clone(&metrics));
        Self::with_engine(engine, config.relay.clone(), metrics)
    }

    fn with_engine(engine: RelayEngine, settings: RelaySettings, metrics: Arc<dyn MetricsSink>) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Running);
        Self {
            engine: Arc::new(engine),
            metrics,
            settings,
            cancel: CancellationToken::new(),
            registry: Arc::new(Mutex::new(Registry {
                state: SessionState::Running,
                relays: HashMap::new(),
            })),
            tracker: Arc::new(ActiveTracker::default()),
            state_tx,
        }
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    pub fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.metrics
    }

    /// Session token; every relay runs under a child of it.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> SessionState {
        self.lock_registry().state
    }

    pub fn active_count(&self) -> usize {
        self.tracker.count()
    }

    pub fn active_relays(&self) -> Vec<RelayStats> {
        self.lock_registry()
            .relays
            .values()
            .map(|relay| relay.instance.to_stats())
            .collect()
    }

    fn lock_registry(&self) -> MutexGuard<'_, Registry> {
        match self.registry.lock() {
            Ok(registry) => registry,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn set_state(&self, registry: &mut Registry, state: SessionState) {
        debug!(from = %registry.state, to = %state, "Session state transition");
        registry.state = state;
        self.state_tx.send_replace(state);
    }

    /// Start relaying a dialed pair in the background.
    ///
    /// Returns `None` once shutdown has begun; the caller still owns the
    /// endpoints in that case and must close them.
    pub fn admit(&self, near: SharedEndpoint, far: SharedEndpoint) -> Option<RelayId> {
        let mut registry = self.lock_registry();
        if registry.state != SessionState::Running {
            debug!(state = %registry.state, near = %near.peer(), "Refusing relay, session not running");
            return None;
        }

        let instance = Arc::new(RelayInstance::new(near.peer(), far.peer(), self.cancel.child_token()));
        let id = instance.id.clone();

        self.tracker.increment();
        let guard = RelayGuard {
            instance: Arc::clone(&instance),
            registry: Arc::clone(&self.registry),
            tracker: Arc::clone(&self.tracker),
            metrics: Arc::clone(&self.metrics),
        };

        let task = {
            let engine = Arc::clone(&self.engine);
            let instance = Arc::clone(&instance);
            let near = Arc::clone(&near);
            let far = Arc::clone(&far);
            tokio::spawn(async move {
                let _guard = guard;
                engine.run(&instance, near, far).await
            })
        };

        registry.relays.insert(
            id.clone(),
            ActiveRelay {
                instance,
                near,
                far,
                task: task.abort_handle(),
            },
        );
        Some(id)
    }

    /// Run the accept loop under the session token until it stops.
    ///
    /// A listener-level failure starts shutdown before the error is returned.
    pub async fn serve(self: &Arc<Self>, listener: Arc<dyn Listener>, dialer: Arc<dyn Dialer>) -> Result<(), RelayError> {
        let accept_loop = AcceptLoop::new(Arc::clone(self));
        match accept_loop.run(listener.as_ref(), dialer.as_ref(), self.cancel_token()).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(address = %listener.address(), error = %e, "Listener failed, shutting down");
                self.shutdown(listener.as_ref()).await;
                Err(e)
            }
        }
    }

    /// Stop admitting relays, close the listener, cancel every relay and
    /// wait for the drain. Relays still running near the drain timeout are
    /// aborted and their endpoints force-closed so that `Drained` is reached
    /// by the deadline. A second call waits for the first to finish.
    pub async fn shutdown(&self, listener: &dyn Listener) -> DrainSummary {
        let started = Instant::now();
        let already_stopping = {
            let mut registry = self.lock_registry();
            let running = registry.state == SessionState::Running;
            if running {
                self.set_state(&mut registry, SessionState::ShuttingDown);
            }
            !running
        };
        if already_stopping {
            self.wait_drained().await;
            return DrainSummary::default();
        }

        info!(
            active = self.active_count(),
            drain_timeout = ?self.settings.drain_timeout,
            "Shutting down session"
        );

        self.cancel.cancel();
        if let Err(e) = listener.close().await {
            warn!(address = %listener.address(), error = %e, "Failed to close listener");
        }

        let grace = FORCE_CLOSE_GRACE.min(self.settings.drain_timeout / 2);
        let forced = if self.tracker.wait_for_zero(self.settings.drain_timeout - grace).await {
            0
        } else {
            self.force_close(grace).await
        };

        {
            let mut registry = self.lock_registry();
            self.set_state(&mut registry, SessionState::Drained);
        }

        let summary = DrainSummary {
            forced,
            elapsed: started.elapsed(),
        };
        info!(forced = summary.forced, elapsed = ?summary.elapsed, "Session drained");
        summary
    }

    /// Resolves once the session reaches `Drained`.
    pub async fn wait_drained(&self) {
        let mut state = self.state_tx.subscribe();
        let drained = state.wait_for(|state| *state == SessionState::Drained).await.map(|_| ());
        if let Err(e) = drained {
            debug!(error = %e, "State channel closed while waiting for drain");
        }
    }

    async fn force_close(&self, grace: Duration) -> usize {
        let remaining: Vec<(RelayId, SharedEndpoint, SharedEndpoint, AbortHandle)> = self
            .lock_registry()
            .relays
            .iter()
            .map(|(id, relay)| {
                (
                    id.clone(),
                    Arc::clone(&relay.near),
                    Arc::clone(&relay.far),
                    relay.task.clone(),
                )
            })
            .collect();

        warn!(remaining = remaining.len(), "Drain deadline passed, force-closing relays");

        let mut closing = JoinSet::new();
        for (id, near, far, task) in &remaining {
            debug!(relay_id = %id, "Force-closing relay");
            task.abort();
            for endpoint in [Arc::clone(near), Arc::clone(far)] {
                closing.spawn(async move {
                    if let Err(e) = endpoint.close().await {
                        debug!(peer = %endpoint.peer(), error = %e, "Force close failed");
                    }
                });
            }
        }

        let (closed_in_time, exited) = tokio::join!(
            tokio::time::timeout(grace, async {
                while closing.join_next().await.is_some() {}
            }),
            self.tracker.wait_for_zero(grace),
        );
        if closed_in_time.is_err() {
            warn!("Some endpoints did not close within the force-close grace period");
        }
        if !exited {
            warn!(active = self.active_count(), "Aborted relays have not all exited yet");
        }

        remaining.len()
    }
}

//! Test doubles shared by the integration tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use tunnel_relay::config::RelaySettings;
use tunnel_relay::endpoint::{memory_pair, Chunk, Endpoint, SharedEndpoint};
use tunnel_relay::transport::{AcceptMode, Dialer, Listener};
use tunnel_relay::RelayError;

pub fn settings(drain_timeout: Duration, poll_interval: Duration) -> RelaySettings {
    RelaySettings {
        buffer_size: 64,
        accept_poll_interval: poll_interval,
        dial_timeout: Duration::from_secs(2),
        drain_timeout,
    }
}

/// Poll `condition` until it holds or `limit` passes.
pub async fn eventually<F>(limit: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Listener fed through a channel.
///
/// With `honor_close` unset its accept ignores `close` entirely, like a
/// blocking accept with no cancellation primitive.
pub struct ChannelListener {
    incoming: Mutex<mpsc::UnboundedReceiver<SharedEndpoint>>,
    mode: AcceptMode,
    honor_close: bool,
    closed: CancellationToken,
    failures: std::sync::Mutex<VecDeque<io::Error>>,
    pub accepts: AtomicUsize,
    pub failed_accepts: AtomicUsize,
}

impl ChannelListener {
    pub fn new(mode: AcceptMode, honor_close: bool) -> (Arc<Self>, mpsc::UnboundedSender<SharedEndpoint>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = Arc::new(Self {
            incoming: Mutex::new(rx),
            mode,
            honor_close,
            closed: CancellationToken::new(),
            failures: std::sync::Mutex::new(VecDeque::new()),
            accepts: AtomicUsize::new(0),
            failed_accepts: AtomicUsize::new(0),
        });
        (listener, tx)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Queue an error for an upcoming accept, ahead of any endpoint.
    pub fn fail_next(&self, error: io::Error) {
        self.failures.lock().unwrap().push_back(error);
    }
}

#[async_trait]
impl Listener for ChannelListener {
    async fn accept(&self) -> Result<SharedEndpoint, RelayError> {
        let failure = self.failures.lock().unwrap().pop_front();
        if let Some(error) = failure {
            self.failed_accepts.fetch_add(1, Ordering::SeqCst);
            return Err(RelayError::transport("accept", error));
        }

        let mut incoming = self.incoming.lock().await;
        let next = if self.honor_close {
            tokio::select! {
                _ = self.closed.cancelled() => return Err(RelayError::ListenerClosed),
                next = incoming.recv() => next,
            }
        } else {
            incoming.recv().await
        };

        match next {
            Some(endpoint) => {
                self.accepts.fetch_add(1, Ordering::SeqCst);
                Ok(endpoint)
            }
            None => std::future::pending().await,
        }
    }

    async fn close(&self) -> Result<(), RelayError> {
        self.closed.cancel();
        Ok(())
    }

    fn address(&self) -> String {
        "channel".to_string()
    }

    fn accept_mode(&self) -> AcceptMode {
        self.mode
    }
}

/// Dialer that fails a set number of times, then hands out in-memory far
/// endpoints whose remote ends are forwarded to the test.
pub struct ScriptedDialer {
    failures_left: AtomicUsize,
    pub dials: AtomicUsize,
    remotes: mpsc::UnboundedSender<DuplexStream>,
}

impl ScriptedDialer {
    pub fn new(failures: usize) -> (Arc<Self>, mpsc::UnboundedReceiver<DuplexStream>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dialer = Arc::new(Self {
            failures_left: AtomicUsize::new(failures),
            dials: AtomicUsize::new(0),
            remotes: tx,
        });
        (dialer, rx)
    }
}

#[async_trait]
impl Dialer for ScriptedDialer {
    fn target(&self) -> &str {
        "scripted"
    }

    async fn dial(&self) -> Result<SharedEndpoint, RelayError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let should_fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(RelayError::dial("scripted", "connection refused"));
        }

        let (far, remote) = memory_pair("far", 256);
        let _ = self.remotes.send(remote);
        Ok(far)
    }
}

/// Endpoint that never produces data and whose first `close` never returns.
pub struct StallingEndpoint {
    peer: String,
    close_calls: AtomicUsize,
    closed: AtomicBool,
    close_token: CancellationToken,
}

impl StallingEndpoint {
    pub fn shared(peer: &str) -> Arc<Self> {
        Arc::new(Self {
            peer: peer.to_string(),
            close_calls: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            close_token: CancellationToken::new(),
        })
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Endpoint for StallingEndpoint {
    fn peer(&self) -> &str {
        &self.peer
    }

    async fn read(&self, _buf: &mut [u8]) -> Result<Chunk, RelayError> {
        std::future::pending().await
    }

    async fn write(&self, _data: &[u8]) -> Result<usize, RelayError> {
        std::future::pending().await
    }

    async fn shutdown_write(&self) -> Result<(), RelayError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), RelayError> {
        if self.close_calls.fetch_add(1, Ordering::SeqCst) == 0 {
            std::future::pending::<()>().await;
        }
        self.closed.store(true, Ordering::SeqCst);
        self.close_token.cancel();
        Ok(())
    }

    async fn closed(&self) {
        self.close_token.cancelled().await
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// How a [`FaultyEndpoint`] misbehaves.
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    /// Writes report one byte fewer than requested.
    ShortWrite,
    /// The first `n` reads return `Data(0)` before reading for real.
    EmptyReads(usize),
    /// Reads panic.
    PanicOnRead,
}

/// Wraps an endpoint and injects a fault.
pub struct FaultyEndpoint {
    inner: SharedEndpoint,
    fault: Fault,
    empty_reads: AtomicUsize,
}

impl FaultyEndpoint {
    pub fn shared(inner: SharedEndpoint, fault: Fault) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fault,
            empty_reads: AtomicUsize::new(0),
        })
    }

    pub fn empty_reads(&self) -> usize {
        self.empty_reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Endpoint for FaultyEndpoint {
    fn peer(&self) -> &str {
        self.inner.peer()
    }

    async fn read(&self, buf: &mut [u8]) -> Result<Chunk, RelayError> {
        match self.fault {
            Fault::PanicOnRead => panic!("injected read fault"),
            Fault::EmptyReads(n) if self.empty_reads.load(Ordering::SeqCst) < n => {
                self.empty_reads.fetch_add(1, Ordering::SeqCst);
                Ok(Chunk::Data(0))
            }
            _ => self.inner.read(buf).await,
        }
    }

    async fn write(&self, data: &[u8]) -> Result<usize, RelayError> {
        match self.fault {
            Fault::ShortWrite if data.len() > 1 => {
                let written = self.inner.write(&data[..data.len() - 1]).await?;
                Ok(written)
            }
            _ => self.inner.write(data).await,
        }
    }

    async fn shutdown_write(&self) -> Result<(), RelayError> {
        self.inner.shutdown_write().await
    }

    async fn close(&self) -> Result<(), RelayError> {
        self.inner.close().await
    }

    async fn closed(&self) {
        self.inner.closed().await
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

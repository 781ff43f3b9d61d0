//! TCP listener and dialer

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{AcceptMode, Dialer, Listener};
use crate::endpoint::{SharedEndpoint, StreamEndpoint};
use crate::relay::RelayError;

/// TCP listener producing near endpoints.
pub struct TcpAcceptor {
    listener: Mutex<Option<Arc<TcpListener>>>,
    local_addr: SocketAddr,
    mode: AcceptMode,
    closed: CancellationToken,
}

impl TcpAcceptor {
    /// Bind a listener. A bind failure is fatal for the caller.
    pub async fn bind(addr: SocketAddr, mode: AcceptMode) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| RelayError::transport(format!("bind {}", addr), e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| RelayError::transport("query local address", e))?;

        info!(address = %local_addr, accept_mode = %mode, "TCP listener bound");
        Ok(Self {
            listener: Mutex::new(Some(Arc::new(listener))),
            local_addr,
            mode,
            closed: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn current(&self) -> Option<Arc<TcpListener>> {
        self.listener.lock().ok().and_then(|guard| guard.as_ref().cloned())
    }
}

#[async_trait]
impl Listener for TcpAcceptor {
    async fn accept(&self) -> Result<SharedEndpoint, RelayError> {
        let listener = self.current().ok_or(RelayError::ListenerClosed)?;

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(RelayError::ListenerClosed),
            result = listener.accept() => {
                let (stream, addr) = result.map_err(|e| RelayError::transport("accept", e))?;
                debug!(peer = %addr, "Accepted connection");
                Ok(StreamEndpoint::from_tcp(stream))
            }
        }
    }

    async fn close(&self) -> Result<(), RelayError> {
        self.closed.cancel();
        // The socket is released once the last pending accept drops its handle.
        let taken = self.listener.lock().ok().and_then(|mut listener| listener.take());
        if taken.is_some() {
            info!(address = %self.local_addr, "TCP listener closed");
        }
        Ok(())
    }

    fn address(&self) -> String {
        self.local_addr.to_string()
    }

    fn accept_mode(&self) -> AcceptMode {
        self.mode
    }
}

/// Dials a fixed `host:port` target.
pub struct TcpDialer {
    target: String,
    timeout: Duration,
}

impl TcpDialer {
    pub fn new(target: impl Into<String>, timeout: Duration) -> Self {
        Self {
            target: target.into(),
            timeout,
        }
    }

    async fn resolve(&self) -> Result<Vec<SocketAddr>, RelayError> {
        match timeout(self.timeout, lookup_host(self.target.as_str())).await {
            Ok(Ok(addrs)) => {
                let resolved: Vec<SocketAddr> = addrs.collect();
                if resolved.is_empty() {
                    return Err(RelayError::dial(&self.target, "resolution returned no addresses"));
                }
                debug!(far_target = %self.target, count = resolved.len(), "Resolved target");
                Ok(resolved)
            }
            Ok(Err(e)) => Err(RelayError::dial(&self.target, format!("resolution failed: {}", e))),
            Err(_) => Err(RelayError::dial(&self.target, "resolution timed out")),
        }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    fn target(&self) -> &str {
        &self.target
    }

    async fn dial(&self) -> Result<SharedEndpoint, RelayError> {
        let addrs = self.resolve().await?;

        let mut last_error = String::from("no addresses resolved");
        for addr in addrs {
            match timeout(self.timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    debug!(far_target = %self.target, address = %addr, "Connected to far endpoint");
                    return Ok(StreamEndpoint::from_tcp(stream));
                }
                Ok(Err(e)) => {
                    warn!(address = %addr, error = %e, "Failed to connect");
                    last_error = e.to_string();
                }
                Err(_) => {
                    warn!(address = %addr, timeout = ?self.timeout, "Connect timed out");
                    last_error = format!("connect timed out after {:?}", self.timeout);
                }
            }
        }

        Err(RelayError::dial(&self.target, last_error))
    }
}

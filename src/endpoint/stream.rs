//! Stream-backed endpoint

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Chunk, Endpoint, SharedEndpoint};
use crate::relay::RelayError;

/// Adapts any `AsyncRead + AsyncWrite` stream to [`Endpoint`].
///
/// The stream is split so a reader and a writer can run at the same time.
/// Every I/O call is raced against an internal close token, which is how a
/// concurrent `close` unblocks a task parked in `read`.
pub struct StreamEndpoint<S> {
    peer: String,
    reader: Mutex<Option<ReadHalf<S>>>,
    writer: Mutex<Option<WriteHalf<S>>>,
    closed: AtomicBool,
    close_token: CancellationToken,
}

impl<S> StreamEndpoint<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: S, peer: impl Into<String>) -> Self {
        let (reader, writer) = split(stream);
        Self {
            peer: peer.into(),
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            closed: AtomicBool::new(false),
            close_token: CancellationToken::new(),
        }
    }

    pub fn shared(stream: S, peer: impl Into<String>) -> SharedEndpoint {
        Arc::new(Self::new(stream, peer))
    }
}

impl StreamEndpoint<TcpStream> {
    /// Wrap a connected TCP socket, labelling it with its peer address.
    pub fn from_tcp(stream: TcpStream) -> SharedEndpoint {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
        }
        Self::shared(stream, peer)
    }
}

/// An in-memory endpoint plus the raw stream on the other end of the pipe.
///
/// Whatever is written to the returned stream is read from the endpoint and
/// vice versa. Used by the echo target and by tests standing in for a
/// remote peer.
pub fn memory_pair(peer: impl Into<String>, max_buf_size: usize) -> (SharedEndpoint, DuplexStream) {
    let (local, remote) = tokio::io::duplex(max_buf_size);
    (StreamEndpoint::shared(local, peer), remote)
}

#[async_trait]
impl<S> Endpoint for StreamEndpoint<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    fn peer(&self) -> &str {
        &self.peer
    }

    async fn read(&self, buf: &mut [u8]) -> Result<Chunk, RelayError> {
        let mut guard = tokio::select! {
            biased;
            _ = self.close_token.cancelled() => return Err(RelayError::EndpointClosed),
            guard = self.reader.lock() => guard,
        };
        let reader = guard.as_mut().ok_or(RelayError::EndpointClosed)?;
        let want = buf.len();

        tokio::select! {
            biased;
            _ = self.close_token.cancelled() => Err(RelayError::EndpointClosed),
            result = reader.read(buf) => match result {
                Ok(0) if want > 0 => Ok(Chunk::EndOfStream),
                Ok(n) => Ok(Chunk::Data(n)),
                Err(e) => Err(RelayError::transport(format!("read from {}", self.peer), e)),
            },
        }
    }

    async fn write(&self, data: &[u8]) -> Result<usize, RelayError> {
        let mut guard = tokio::select! {
            biased;
            _ = self.close_token.cancelled() => return Err(RelayError::EndpointClosed),
            guard = self.writer.lock() => guard,
        };
        let writer = guard.as_mut().ok_or(RelayError::EndpointClosed)?;

        let result = tokio::select! {
            biased;
            _ = self.close_token.cancelled() => return Err(RelayError::EndpointClosed),
            result = async {
                writer.write_all(data).await?;
                writer.flush().await
            } => result,
        };

        result
            .map(|_| data.len())
            .map_err(|e| RelayError::transport(format!("write to {}", self.peer), e))
    }

    async fn shutdown_write(&self) -> Result<(), RelayError> {
        if self.is_closed() {
            return Ok(());
        }
        let mut guard = tokio::select! {
            biased;
            _ = self.close_token.cancelled() => return Ok(()),
            guard = self.writer.lock() => guard,
        };
        let Some(writer) = guard.as_mut() else {
            return Ok(());
        };

        match writer.shutdown().await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(RelayError::transport(format!("half-close {}", self.peer), e)),
        }
    }

    async fn close(&self) -> Result<(), RelayError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.close_token.cancel();

        // In-flight operations observe the token and release their locks.
        drop(self.reader.lock().await.take());
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!(peer = %self.peer, error = %e, "Shutdown on close failed");
            }
        }

        debug!(peer = %self.peer, "Endpoint closed");
        Ok(())
    }

    async fn closed(&self) {
        self.close_token.cancelled().await
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

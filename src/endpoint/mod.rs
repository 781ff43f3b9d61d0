//! Endpoint Module
//!
//! Transport-independent duplex byte-stream handles. A relay only ever talks
//! to the [`Endpoint`] trait; sockets, in-memory pipes and any other stream
//! are adapted by [`StreamEndpoint`].

pub mod stream;

use std::sync::Arc;

use async_trait::async_trait;

use crate::relay::RelayError;

pub use stream::{memory_pair, StreamEndpoint};

/// Result of a single read from an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chunk {
    /// `n` bytes were placed at the start of the buffer. `Data(0)` is not an
    /// end-of-stream signal; callers retry.
    Data(usize),
    /// The peer finished sending. No further data will arrive.
    EndOfStream,
}

/// A duplex byte channel shared between the two copy directions of a relay
/// and whoever else may need to close it.
///
/// All methods take `&self`: one task may be blocked in `read` while another
/// writes and a third calls `close`. Once `close` has been called, in-flight
/// and future reads and writes return promptly with
/// [`RelayError::EndpointClosed`].
#[async_trait]
pub trait Endpoint: Send + Sync + 'static {
    /// Human-readable description of the remote side, for logs.
    fn peer(&self) -> &str;

    async fn read(&self, buf: &mut [u8]) -> Result<Chunk, RelayError>;

    async fn write(&self, data: &[u8]) -> Result<usize, RelayError>;

    /// Half-close: signal end-of-stream to the peer while keeping the read
    /// side open. A no-op once the endpoint is closed.
    async fn shutdown_write(&self) -> Result<(), RelayError>;

    /// Release the endpoint. Idempotent and safe to call concurrently; every
    /// call after the first returns `Ok(())` immediately.
    async fn close(&self) -> Result<(), RelayError>;

    /// Resolves once `close` has been called.
    async fn closed(&self);

    fn is_closed(&self) -> bool;
}

pub type SharedEndpoint = Arc<dyn Endpoint>;

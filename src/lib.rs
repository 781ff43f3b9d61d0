//! Tunnel Relay Library
//!
//! Full-duplex relay core for TCP tunnels: accepts near endpoints from a
//! listener, dials a far endpoint for each, and copies bytes in both
//! directions until either side finishes, fails or the session shuts down.

pub mod config;
pub mod connection;
pub mod endpoint;
pub mod metrics;
pub mod relay;
pub mod shutdown;
pub mod supervisor;
pub mod transport;

pub use config::Config;
pub use connection::AcceptLoop;
pub use endpoint::{Endpoint, SharedEndpoint};
pub use relay::{RelayEngine, RelayError, RelayOutcome};
pub use supervisor::{SessionState, Supervisor};

/// Common error type for application plumbing
pub type Result<T> = anyhow::Result<T>;

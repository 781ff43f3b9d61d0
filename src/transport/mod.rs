//! Transport Module
//!
//! Factories that produce endpoints: listeners for near endpoints and
//! dialers for far endpoints.

pub mod echo;
pub mod tcp;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::endpoint::SharedEndpoint;
use crate::relay::RelayError;

pub use echo::EchoDialer;
pub use tcp::{TcpAcceptor, TcpDialer};

/// Target name that selects the in-process echo dialer.
pub const ECHO_TARGET: &str = "echo";

/// How the accept loop stops a listener's pending accept on shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AcceptMode {
    /// The accept call can be raced against the cancellation token.
    #[default]
    Cancellable,
    /// The accept call is bounded by a short deadline and retried, checking
    /// the token between attempts.
    Deadline,
}

impl fmt::Display for AcceptMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcceptMode::Cancellable => f.write_str("cancellable"),
            AcceptMode::Deadline => f.write_str("deadline"),
        }
    }
}

impl std::str::FromStr for AcceptMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cancellable" => Ok(AcceptMode::Cancellable),
            "deadline" => Ok(AcceptMode::Deadline),
            other => Err(format!("unknown accept mode '{}'", other)),
        }
    }
}

/// Source of near endpoints.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Wait for the next near endpoint. After `close`, pending and future
    /// calls fail with [`RelayError::ListenerClosed`].
    async fn accept(&self) -> Result<SharedEndpoint, RelayError>;

    async fn close(&self) -> Result<(), RelayError>;

    fn address(&self) -> String;

    fn accept_mode(&self) -> AcceptMode {
        AcceptMode::Cancellable
    }
}

/// Source of far endpoints.
#[async_trait]
pub trait Dialer: Send + Sync {
    fn target(&self) -> &str;

    async fn dial(&self) -> Result<SharedEndpoint, RelayError>;
}

/// Build the dialer for a configured target: `echo` or `host:port`.
pub fn build_dialer(target: &str, dial_timeout: Duration, buffer_size: usize) -> Arc<dyn Dialer> {
    if target.eq_ignore_ascii_case(ECHO_TARGET) {
        Arc::new(EchoDialer::new(buffer_size))
    } else {
        Arc::new(TcpDialer::new(target, dial_timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_mode_parsing() {
        assert_eq!("deadline".parse::<AcceptMode>().unwrap(), AcceptMode::Deadline);
        assert_eq!("Cancellable".parse::<AcceptMode>().unwrap(), AcceptMode::Cancellable);
        assert!("polling".parse::<AcceptMode>().is_err());
        assert_eq!(AcceptMode::default(), AcceptMode::Cancellable);
    }

    #[test]
    fn test_build_dialer_selects_target() {
        let echo = build_dialer("echo", Duration::from_secs(1), 1024);
        assert_eq!(echo.target(), ECHO_TARGET);

        let tcp = build_dialer("127.0.0.1:1544", Duration::from_secs(1), 1024);
        assert_eq!(tcp.target(), "127.0.0.1:1544");
    }
}

//! In-process echo target

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::{Dialer, ECHO_TARGET};
use crate::endpoint::{memory_pair, SharedEndpoint};
use crate::relay::RelayError;

/// Dialer whose far endpoint returns every byte written to it.
///
/// Each dial creates an in-memory pipe and spawns a task that copies the
/// pipe back onto itself, half-closing once the relay stops sending.
#[derive(Debug, Clone)]
pub struct EchoDialer {
    buffer_size: usize,
}

impl EchoDialer {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
        }
    }
}

#[async_trait]
impl Dialer for EchoDialer {
    fn target(&self) -> &str {
        ECHO_TARGET
    }

    async fn dial(&self) -> Result<SharedEndpoint, RelayError> {
        let (endpoint, remote) = memory_pair(ECHO_TARGET, self.buffer_size);

        tokio::spawn(async move {
            let (mut reader, mut writer) = tokio::io::split(remote);
            match tokio::io::copy(&mut reader, &mut writer).await {
                Ok(bytes) => debug!(bytes, "Echo target finished"),
                Err(e) => debug!(error = %e, "Echo target stopped"),
            }
            if let Err(e) = writer.shutdown().await {
                debug!(error = %e, "Echo target shutdown failed");
            }
        });

        Ok(endpoint)
    }
}

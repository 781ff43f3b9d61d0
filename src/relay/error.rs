//! Relay Error Types

use std::io;

// errno values shared by Linux and the BSDs.
const ENFILE: i32 = 23;
const EMFILE: i32 = 24;

/// Errors produced by endpoints, listeners, dialers and the relay engine.
///
/// End-of-stream is not represented here: a source reaching its end is
/// reported as [`crate::endpoint::Chunk::EndOfStream`] and ends a copy
/// direction normally.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Read, write or accept failure on an underlying transport.
    #[error("{context}: {source}")]
    Transport {
        /// What was being attempted when the failure happened.
        context: String,
        #[source]
        source: io::Error,
    },

    /// The destination accepted fewer bytes than requested without failing.
    #[error("short write: {written} of {expected} bytes")]
    ShortWrite {
        written: usize,
        expected: usize,
    },

    /// The far endpoint could not be reached.
    #[error("failed to dial {target}: {reason}")]
    DialFailure {
        target: String,
        reason: String,
    },

    /// The listener was closed while accepting.
    #[error("listener closed")]
    ListenerClosed,

    /// The endpoint was closed while an operation was in flight.
    #[error("endpoint closed")]
    EndpointClosed,

    /// A copy task panicked or was aborted.
    #[error("relay task failed: {0}")]
    TaskFailed(String),
}

impl RelayError {
    /// Wrap an I/O error with a short description of the failed operation.
    pub fn transport(context: impl Into<String>, source: io::Error) -> Self {
        Self::Transport {
            context: context.into(),
            source,
        }
    }

    pub fn dial(target: impl Into<String>, reason: impl ToString) -> Self {
        Self::DialFailure {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    /// True for I/O timeouts, which the accept loop treats as a poll tick.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Transport { source, .. }
                if matches!(source.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
        )
    }

    /// Accept failures that concern a single incoming connection or a
    /// momentary resource shortage. The listener itself is still usable.
    pub fn is_transient_accept(&self) -> bool {
        match self {
            Self::Transport { source, .. } => {
                matches!(
                    source.kind(),
                    io::ErrorKind::ConnectionAborted
                        | io::ErrorKind::ConnectionReset
                        | io::ErrorKind::Interrupted
                ) || self.is_fd_exhausted()
            }
            _ => false,
        }
    }

    /// The process or system ran out of file descriptors.
    pub fn is_fd_exhausted(&self) -> bool {
        matches!(
            self,
            Self::Transport { source, .. }
                if matches!(source.raw_os_error(), Some(ENFILE) | Some(EMFILE))
        )
    }

    /// Errors that only mean the peer went away; logged below warn level.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::EndpointClosed | Self::ListenerClosed => true,
            Self::Transport { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_classification() {
        let err = RelayError::transport("accept", io::Error::new(io::ErrorKind::TimedOut, "deadline"));
        assert!(err.is_timeout());

        let err = RelayError::transport("accept", io::Error::new(io::ErrorKind::Other, "boom"));
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_display_messages() {
        let err = RelayError::ShortWrite { written: 3, expected: 10 };
        assert_eq!(err.to_string(), "short write: 3 of 10 bytes");

        let err = RelayError::dial("127.0.0.1:9", "connection refused");
        assert_eq!(err.to_string(), "failed to dial 127.0.0.1:9: connection refused");
    }

    #[test]
    fn test_disconnect_classification() {
        let reset = RelayError::transport("read", io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(reset.is_disconnect());
        assert!(RelayError::EndpointClosed.is_disconnect());
        assert!(!RelayError::TaskFailed("panic".into()).is_disconnect());
    }

    #[test]
    fn test_transient_accept_classification() {
        let aborted = RelayError::transport("accept", io::Error::from(io::ErrorKind::ConnectionAborted));
        assert!(aborted.is_transient_accept());
        assert!(!aborted.is_fd_exhausted());

        let emfile = RelayError::transport("accept", io::Error::from_raw_os_error(EMFILE));
        assert!(emfile.is_transient_accept());
        assert!(emfile.is_fd_exhausted());

        let fatal = RelayError::transport("accept", io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(!fatal.is_transient_accept());
        assert!(!RelayError::ListenerClosed.is_transient_accept());
    }
}

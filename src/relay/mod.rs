//! Data Relay Module
//!
//! Handles bidirectional data relay between a near and a far endpoint.

pub mod engine;
pub mod error;
pub mod session;

pub use engine::{RelayEngine, RelayOutcome, DEFAULT_BUFFER_SIZE};
pub use error::RelayError;
pub use session::{Direction, RelayId, RelayInstance, RelayStats};

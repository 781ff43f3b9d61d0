//! Relay Instance

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// Unique identifier of a relay, used to correlate log lines and registry
/// entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelayId(String);

impl RelayId {
    pub fn new() -> Self {
        Self(format!("relay-{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RelayId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RelayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Copy direction within a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    NearToFar,
    FarToNear,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::NearToFar => f.write_str("near→far"),
            Direction::FarToNear => f.write_str("far→near"),
        }
    }
}

/// One active pairing of a near and a far endpoint.
#[derive(Debug)]
pub struct RelayInstance {
    pub id: RelayId,
    pub near_peer: String,
    pub far_peer: String,
    pub start_time: Instant,
    started_at: SystemTime,
    bytes_near_to_far: AtomicU64,
    bytes_far_to_near: AtomicU64,
    cancel: CancellationToken,
    outcome: Mutex<Option<&'static str>>,
}

/// Snapshot of a relay for reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayStats {
    pub id: RelayId,
    pub near_peer: String,
    pub far_peer: String,
    pub started_at: SystemTime,
    pub duration_ms: u64,
    pub bytes_near_to_far: u64,
    pub bytes_far_to_near: u64,
    pub total_bytes: u64,
    pub outcome: Option<String>,
}

impl RelayInstance {
    /// Create a relay instance whose copy loops stop when `cancel` fires.
    pub fn new(near_peer: impl Into<String>, far_peer: impl Into<String>, cancel: CancellationToken) -> Self {
        let instance = Self {
            id: RelayId::new(),
            near_peer: near_peer.into(),
            far_peer: far_peer.into(),
            start_time: Instant::now(),
            started_at: SystemTime::now(),
            bytes_near_to_far: AtomicU64::new(0),
            bytes_far_to_near: AtomicU64::new(0),
            cancel,
            outcome: Mutex::new(None),
        };
        debug!(relay_id = %instance.id, near = %instance.near_peer, far = %instance.far_peer, "Created relay instance");
        instance
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Count bytes relayed in one direction.
    pub fn add_bytes(&self, direction: Direction, bytes: u64) {
        match direction {
            Direction::NearToFar => self.bytes_near_to_far.fetch_add(bytes, Ordering::Relaxed),
            Direction::FarToNear => self.bytes_far_to_near.fetch_add(bytes, Ordering::Relaxed),
        };
    }

    pub fn bytes_near_to_far(&self) -> u64 {
        self.bytes_near_to_far.load(Ordering::Relaxed)
    }

    pub fn bytes_far_to_near(&self) -> u64 {
        self.bytes_far_to_near.load(Ordering::Relaxed)
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes_near_to_far() + self.bytes_far_to_near()
    }

    pub fn duration(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub(crate) fn set_outcome(&self, label: &'static str) {
        if let Ok(mut outcome) = self.outcome.lock() {
            *outcome = Some(label);
        }
    }

    pub fn outcome(&self) -> Option<&'static str> {
        self.outcome.lock().ok().and_then(|outcome| *outcome)
    }

    pub fn to_stats(&self) -> RelayStats {
        RelayStats {
            id: self.id.clone(),
            near_peer: self.near_peer.clone(),
            far_peer: self.far_peer.clone(),
            started_at: self.started_at,
            duration_ms: self.duration().as_millis() as u64,
            bytes_near_to_far: self.bytes_near_to_far(),
            bytes_far_to_near: self.bytes_far_to_near(),
            total_bytes: self.total_bytes(),
            outcome: self.outcome().map(str::to_string),
        }
    }

    /// Log final relay statistics
    pub fn log_stats(&self) {
        info!(
            relay_id = %self.id,
            near = %self.near_peer,
            far = %self.far_peer,
            duration_ms = self.duration().as_millis() as u64,
            bytes_near_to_far = self.bytes_near_to_far(),
            bytes_far_to_near = self.bytes_far_to_near(),
            outcome = self.outcome().unwrap_or("running"),
            "Relay finished"
        );
    }
}

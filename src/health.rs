//! src/health.rs
//!
//! The health-escalation sink for `ConnectionManager`'s countdown (§4.2 step
//! 1, §9): "a pluggable 'unhealthy' signal; do not silently mask." Prolonged
//! `peers < min_peers` for `TICKS_BEFORE_REBOOT` ticks trips it.

use tracing::error;

pub trait HealthSink: Send + Sync {
    /// Called once the health countdown expires while under-peered. The
    /// default production sink exits the process; a supervisor is expected
    /// to restart it.
    fn on_unhealthy(&self, peer_count: usize, min_peers: usize);
}

/// Exits the process, relying on external supervision to restart it. This is
/// the production default: the countdown is a deliberate escalation policy,
/// not a transient condition to retry around.
pub struct ProcessExitHealthSink;

impl HealthSink for ProcessExitHealthSink {
    fn on_unhealthy(&self, peer_count: usize, min_peers: usize) {
        error!(
            peer_count,
            min_peers, "health countdown expired while under-peered; exiting for supervisor restart"
        );
        std::process::exit(1);
    }
}

/// Records trips instead of exiting, for embedding in a larger process or in
/// tests that must observe the escalation without killing the test runner.
#[derive(Default)]
pub struct RecordingHealthSink {
    trips: std::sync::Mutex<Vec<(usize, usize)>>,
}

impl RecordingHealthSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trips(&self) -> Vec<(usize, usize)> {
        self.trips.lock().unwrap().clone()
    }
}

impl HealthSink for RecordingHealthSink {
    fn on_unhealthy(&self, peer_count: usize, min_peers: usize) {
        self.trips.lock().unwrap().push((peer_count, min_peers));
    }
}

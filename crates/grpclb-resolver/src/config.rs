//! Discovery Configuration

use std::time::Duration;

/// Resolver settings
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Upper bound on the initial prefix read performed by `build`
    pub snapshot_timeout: Duration,

    /// Delay before re-snapshotting and re-watching after the watch stream
    /// ends. `None` leaves the resolver inert on its last published state.
    pub rewatch_delay: Option<Duration>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            snapshot_timeout: Duration::from_secs(10),
            rewatch_delay: None,
        }
    }
}

impl DiscoveryConfig {
    pub fn with_snapshot_timeout(mut self, timeout: Duration) -> Self {
        self.snapshot_timeout = timeout;
        self
    }

    pub fn with_rewatch_delay(mut self, delay: Duration) -> Self {
        self.rewatch_delay = Some(delay);
        self
    }
}

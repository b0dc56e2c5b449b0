//! Store Configuration
//!
//! Connection settings for the coordination store. The binary fills them from
//! flags with environment fallbacks.

use std::time::Duration;

/// Coordination store connection settings
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Etcd endpoints
    pub endpoints: Vec<String>,

    /// Upper bound on establishing the connection
    pub dial_timeout: Duration,

    /// Per-request timeout applied by the client
    pub request_timeout: Duration,

    // Connect backoff settings
    /// Initial interval between connection attempts
    pub backoff_initial: Duration,

    /// Maximum interval between connection attempts
    pub backoff_max: Duration,

    /// Multiplier for connect backoff
    pub backoff_multiplier: f64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            dial_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            backoff_initial: Duration::from_millis(200),
            backoff_max: Duration::from_secs(2),
            backoff_multiplier: 2.0,
        }
    }
}

impl StoreConfig {
    pub fn new(endpoints: Vec<String>) -> Self {
        Self {
            endpoints,
            ..Self::default()
        }
    }

    pub fn with_dial_timeout(mut self, dial_timeout: Duration) -> Self {
        self.dial_timeout = dial_timeout;
        self
    }
}

/// Split a comma-separated endpoint list, dropping blanks.
pub fn parse_endpoints(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

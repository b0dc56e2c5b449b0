//! Registrar Configuration

use grpclb_core::{Error, Result};
use std::time::Duration;

/// Settings for one registered instance
#[derive(Debug, Clone)]
pub struct RegistrarConfig {
    /// Service the instance belongs to
    pub service_name: String,

    /// Address clients dial, e.g. `10.0.0.1:8000`
    pub address: String,

    /// Relative weight published as the key's value
    pub weight: u64,

    /// TTL for the lease in seconds
    pub lease_ttl: i64,

    /// Interval between keep-alives (default: a third of the TTL)
    pub keepalive_interval: Option<Duration>,
}

impl RegistrarConfig {
    pub fn new(service_name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            address: address.into(),
            weight: 1,
            lease_ttl: 10,
            keepalive_interval: None,
        }
    }

    pub fn with_weight(mut self, weight: u64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_lease_ttl(mut self, lease_ttl: i64) -> Self {
        self.lease_ttl = lease_ttl;
        self
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = Some(interval);
        self
    }

    /// Effective keep-alive interval, never shorter than 100ms.
    pub fn keepalive_interval(&self) -> Duration {
        self.keepalive_interval
            .unwrap_or_else(|| Duration::from_millis(self.lease_ttl.max(1) as u64 * 1000 / 3))
            .max(Duration::from_millis(100))
    }

    pub fn validate(&self) -> Result<()> {
        if self.service_name.is_empty() || self.service_name.contains('/') {
            return Err(Error::InvalidConfig(format!(
                "service name must be non-empty and contain no '/': {:?}",
                self.service_name
            )));
        }
        if self.address.is_empty() {
            return Err(Error::InvalidConfig("instance address must be non-empty".into()));
        }
        if self.weight == 0 {
            return Err(Error::InvalidConfig("weight must be a positive integer".into()));
        }
        if self.lease_ttl < 1 {
            return Err(Error::InvalidConfig(format!(
                "lease ttl must be at least one second, got {}",
                self.lease_ttl
            )));
        }

        let ttl = Duration::from_secs(self.lease_ttl as u64);
        let interval = self.keepalive_interval();
        if interval >= ttl {
            return Err(Error::InvalidConfig(format!(
                "keep-alive interval {interval:?} must be shorter than the lease ttl {ttl:?}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RegistrarConfig::new("echo", "10.0.0.1:8000");
        assert_eq!(config.weight, 1);
        assert_eq!(config.lease_ttl, 10);
        assert_eq!(config.keepalive_interval(), Duration::from_millis(3333));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_explicit_keepalive_interval() {
        let config = RegistrarConfig::new("echo", "10.0.0.1:8000")
            .with_keepalive_interval(Duration::from_secs(1));
        assert_eq!(config.keepalive_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_validation() {
        let base = RegistrarConfig::new("echo", "10.0.0.1:8000");
        assert!(base.clone().with_weight(0).validate().is_err());
        assert!(base.clone().with_lease_ttl(0).validate().is_err());
        assert!(RegistrarConfig::new("", "10.0.0.1:8000").validate().is_err());
        assert!(RegistrarConfig::new("a/b", "10.0.0.1:8000").validate().is_err());
        assert!(RegistrarConfig::new("echo", "").validate().is_err());
    }

    #[test]
    fn test_keepalive_interval_must_be_shorter_than_ttl() {
        let base = RegistrarConfig::new("echo", "10.0.0.1:8000").with_lease_ttl(3);

        for interval in [Duration::from_secs(3), Duration::from_secs(5)] {
            assert!(matches!(
                base.clone().with_keepalive_interval(interval).validate(),
                Err(Error::InvalidConfig(_))
            ));
        }
        assert!(base
            .clone()
            .with_keepalive_interval(Duration::from_millis(2999))
            .validate()
            .is_ok());
        // Derived interval for the smallest ttl stays valid
        assert!(base.with_lease_ttl(1).validate().is_ok());
    }
}

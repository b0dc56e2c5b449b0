//! Resolution targets of the form `grpclb:///<service>`.

use grpclb_core::{service_prefix, Error, Result, SCHEMA};
use std::fmt;
use std::str::FromStr;

/// A parsed `grpclb:///<service>` target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    service_name: String,
}

impl Target {
    pub fn new(service_name: impl Into<String>) -> Result<Self> {
        let service_name = service_name.into();
        if service_name.is_empty() || service_name.contains('/') {
            return Err(Error::invalid_target(
                format!("{SCHEMA}:///{service_name}"),
                "service name must be non-empty and contain no '/'",
            ));
        }
        Ok(Self { service_name })
    }

    /// Parse `<scheme>:///<service>`; the scheme must be `grpclb`.
    pub fn parse(target: &str) -> Result<Self> {
        let (scheme, rest) = target
            .split_once("://")
            .ok_or_else(|| Error::invalid_target(target, "missing `://`"))?;

        if scheme != SCHEMA {
            return Err(Error::invalid_target(
                target,
                format!("unsupported scheme `{scheme}`, expected `{SCHEMA}`"),
            ));
        }

        // Empty authority: `grpclb:///svc`
        let path = rest
            .strip_prefix('/')
            .ok_or_else(|| Error::invalid_target(target, "authority is not supported"))?;

        Self::new(path).map_err(|_| {
            Error::invalid_target(target, "service name must be non-empty and contain no '/'")
        })
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Watch prefix, `/grpclb/<service>/`.
    pub fn prefix(&self) -> String {
        service_prefix(&self.service_name)
    }
}

impl FromStr for Target {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:///{}", SCHEMA, self.service_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_target() {
        let target = Target::parse("grpclb:///echo").unwrap();
        assert_eq!(target.service_name(), "echo");
        assert_eq!(target.prefix(), "/grpclb/echo/");
        assert_eq!(target.to_string(), "grpclb:///echo");
    }

    #[test]
    fn test_parse_rejects_bad_targets() {
        for bad in [
            "echo",
            "dns:///echo",
            "grpclb:///",
            "grpclb://host/echo",
            "grpclb:///echo/extra",
        ] {
            assert!(
                matches!(Target::parse(bad), Err(Error::InvalidTarget { .. })),
                "target {bad:?}"
            );
        }
    }

    #[test]
    fn test_from_str_round_trip() {
        let target: Target = "grpclb:///payments".parse().unwrap();
        assert_eq!(target, Target::new("payments").unwrap());
    }
}

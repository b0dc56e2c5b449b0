//! Error types shared by the registrar and resolver crates.

use crate::store::LeaseId;
use std::time::Duration;
use thiserror::Error;

/// Result alias used across the grpclb crates.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The store could not be reached while constructing a component.
    #[error("failed to connect to coordination store {endpoints:?}: {reason}")]
    Connect {
        endpoints: Vec<String>,
        reason: String,
    },

    #[error("coordination store request failed: {0}")]
    Store(#[from] etcd_client::Error),

    #[error("coordination store unavailable")]
    Unavailable,

    /// The lease was revoked or expired before the request reached the store.
    #[error("lease {0} not found")]
    LeaseNotFound(LeaseId),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("watch canceled by store: {0}")]
    WatchCanceled(String),

    #[error("invalid target `{target}`: {reason}")]
    InvalidTarget { target: String, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl Error {
    pub fn invalid_target(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidTarget {
            target: target.into(),
            reason: reason.into(),
        }
    }

    /// Whether the error means the lease no longer exists at the store.
    pub fn is_lease_not_found(&self) -> bool {
        matches!(self, Self::LeaseNotFound(_))
    }
}

//! Coordination Store
//!
//! The registrar and resolver only need six operations from the store:
//! grant a lease, put a key bound to it, read a prefix, keep the lease alive,
//! revoke it, and watch a prefix. `CoordinationStore` is that seam.
//!
//! - `etcd`: production backend on top of `etcd-client`
//! - `memory`: in-process backend with real TTL expiry, used by tests

mod etcd;
mod memory;

pub use etcd::EtcdStore;
pub use memory::MemoryStore;

use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Store-assigned lease identifier.
pub type LeaseId = i64;

/// A key/value pair returned by a prefix read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

/// Result of a prefix read, with the store revision it was served at.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub kvs: Vec<KeyValue>,
    pub revision: i64,
}

/// A change under a watched prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Put {
        key: String,
        value: String,
        revision: i64,
    },
    Delete {
        key: String,
        revision: i64,
    },
}

impl WatchEvent {
    pub fn key(&self) -> &str {
        match self {
            Self::Put { key, .. } | Self::Delete { key, .. } => key,
        }
    }

    /// Store revision at which the change happened.
    pub fn revision(&self) -> i64 {
        match self {
            Self::Put { revision, .. } | Self::Delete { revision, .. } => *revision,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Put { .. } => "put",
            Self::Delete { .. } => "delete",
        }
    }
}

/// One keep-alive acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveAck {
    pub lease_id: LeaseId,
    /// Remaining TTL in seconds after the refresh
    pub ttl: i64,
}

#[async_trait]
pub trait CoordinationStore: Clone + Send + Sync + 'static {
    /// Grant a lease with the given TTL in seconds.
    async fn grant_lease(&self, ttl: i64) -> Result<LeaseId>;

    /// Put a key, optionally bound to a lease.
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<()>;

    /// Read every key under `prefix`.
    async fn get_prefix(&self, prefix: &str) -> Result<Snapshot>;

    /// Start refreshing `lease` every `interval`.
    async fn keep_alive(
        &self,
        lease: LeaseId,
        interval: Duration,
    ) -> Result<Box<dyn KeepAliveStream>>;

    /// Revoke a lease; the store deletes every key bound to it.
    async fn revoke(&self, lease: LeaseId) -> Result<()>;

    /// Watch `prefix`, replaying changes from `start_revision` when it is positive.
    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision: i64,
    ) -> Result<Box<dyn WatchSubscription>>;
}

/// Stream of keep-alive acknowledgements for a single lease.
#[async_trait]
pub trait KeepAliveStream: Send {
    /// Send the next heartbeat and wait for its acknowledgement.
    ///
    /// `Ok(None)` means the stream ended, usually because the lease is gone.
    async fn next_ack(&mut self) -> Result<Option<KeepAliveAck>>;
}

/// Ordered batches of changes under a watched prefix.
#[async_trait]
pub trait WatchSubscription: Send {
    /// Next batch of events; `Ok(None)` once the stream has ended.
    async fn next_batch(&mut self) -> Result<Option<Vec<WatchEvent>>>;

    /// Stop the subscription. Later `next_batch` calls return `Ok(None)`.
    async fn cancel(&mut self);
}

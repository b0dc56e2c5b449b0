//! grpclb core
//!
//! Shared building blocks for weighted service registration and discovery
//! over a lease-capable coordination store:
//! - `key`: registry key and prefix layout
//! - `address`: weight parsing, address entries and the per-resolver address set
//! - `store`: the coordination store seam, with etcd and in-memory backends
//! - `config`: store connection settings
//! - `observability`: tracing setup, structured events and metrics

pub mod address;
pub mod config;
pub mod error;
pub mod key;
pub mod observability;
pub mod store;

pub use address::{parse_weight, AddrInfo, AddressEntry, AddressSet, Attributes, PublishedState};
pub use config::StoreConfig;
pub use error::{Error, Result};
pub use key::{registry_key, service_prefix, SCHEMA};
pub use store::{
    CoordinationStore, EtcdStore, KeepAliveAck, KeepAliveStream, KeyValue, LeaseId, MemoryStore,
    Snapshot, WatchEvent, WatchSubscription,
};

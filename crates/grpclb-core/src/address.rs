//! Address entries and the per-resolver address set
//!
//! Registry values are decimal weights. Anything that is not a positive
//! integer degrades to weight 1 instead of being rejected.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::key::address_from_key;

/// Weight used when a registry value is empty or malformed.
pub const DEFAULT_WEIGHT: u64 = 1;

/// Parse a registry value into a weight.
pub fn parse_weight(value: &str) -> u64 {
    value
        .parse::<u64>()
        .ok()
        .filter(|weight| *weight > 0)
        .unwrap_or(DEFAULT_WEIGHT)
}

/// Load-balancing metadata attached to every published address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrInfo {
    pub weight: u64,
}

/// Typed per-address metadata, keyed by the value's type.
#[derive(Clone, Default)]
pub struct Attributes {
    values: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Attributes {
    pub fn insert<T: Any + Send + Sync>(&mut self, value: T) {
        self.values.insert(TypeId::of::<T>(), Arc::new(value));
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.values
            .get(&TypeId::of::<T>())
            .and_then(|value| (**value).downcast_ref::<T>())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Debug for Attributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attributes")
            .field("len", &self.values.len())
            .finish()
    }
}

/// One published address with its metadata.
#[derive(Debug, Clone)]
pub struct AddressEntry {
    pub addr: String,
    pub attributes: Attributes,
}

impl AddressEntry {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            attributes: Attributes::default(),
        }
    }

    /// Build the entry for a registry key/value pair under `prefix`.
    ///
    /// Returns `None` when the key does not name an instance under the prefix.
    pub fn from_registry(prefix: &str, key: &str, value: &str) -> Option<Self> {
        let addr = address_from_key(prefix, key)?;
        Some(Self::new(addr).with_addr_info(AddrInfo {
            weight: parse_weight(value),
        }))
    }

    pub fn with_attribute<T: Any + Send + Sync>(mut self, value: T) -> Self {
        self.attributes.insert(value);
        self
    }

    pub fn with_addr_info(self, info: AddrInfo) -> Self {
        self.with_attribute(info)
    }

    pub fn addr_info(&self) -> Option<AddrInfo> {
        self.attributes.get::<AddrInfo>().copied()
    }

    /// Weight read back from the attached `AddrInfo`.
    pub fn weight(&self) -> u64 {
        self.addr_info()
            .map(|info| info.weight)
            .unwrap_or(DEFAULT_WEIGHT)
    }
}

/// Full address list handed to a consumer after every change.
#[derive(Debug, Clone, Default)]
pub struct PublishedState {
    pub addresses: Vec<AddressEntry>,
}

impl PublishedState {
    /// `(address, weight)` pairs, sorted by address.
    pub fn weighted_addresses(&self) -> Vec<(String, u64)> {
        let mut pairs: Vec<(String, u64)> = self
            .addresses
            .iter()
            .map(|entry| (entry.addr.clone(), entry.weight()))
            .collect();
        pairs.sort();
        pairs
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}

/// Registry key -> address entry, owned by a single resolver.
#[derive(Debug, Default)]
pub struct AddressSet {
    entries: HashMap<String, AddressEntry>,
}

impl AddressSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&mut self, key: impl Into<String>, entry: AddressEntry) {
        self.entries.insert(key.into(), entry);
    }

    pub fn remove(&mut self, key: &str) -> Option<AddressEntry> {
        self.entries.remove(key)
    }

    /// Replace the whole set, e.g. after a fresh prefix read.
    pub fn reset(&mut self, entries: impl IntoIterator<Item = (String, AddressEntry)>) {
        self.entries = entries.into_iter().collect();
    }

    pub fn get(&self, key: &str) -> Option<&AddressEntry> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Point-in-time copy of every entry, sorted by address.
    pub fn published(&self) -> PublishedState {
        let mut addresses: Vec<AddressEntry> = self.entries.values().cloned().collect();
        addresses.sort_by(|a, b| a.addr.cmp(&b.addr));
        PublishedState { addresses }
    }
}

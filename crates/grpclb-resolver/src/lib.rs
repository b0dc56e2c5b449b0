//! grpclb resolver
//!
//! Client-side discovery for services registered by `grpclb-registrar`:
//! 1. Snapshot: read every key under `/grpclb/<service>/` (bounded timeout)
//! 2. Publish: hand the full weighted address list to a `Consumer`
//! 3. Watch: apply PUT/DELETE events one by one, republishing after each
//!
//! `Discoverer::dial` wires a resolver to a tonic balanced channel.

mod config;
mod consumer;
mod dial;
mod discoverer;
mod target;

pub use config::DiscoveryConfig;
pub use consumer::{Consumer, LoggingConsumer};
pub use dial::{BalancedChannel, DialOptions, WEIGHT_POLICY};
pub use discoverer::{Discoverer, Resolver, ResolverPhase};
pub use target::Target;

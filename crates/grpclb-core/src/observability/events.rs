//! Structured Events
//!
//! One function per membership event so field names stay consistent between
//! the registrar and resolver sides.
//!
//! Event types:
//! - `instance_registered` - registry key written under a fresh lease
//! - `lease_revoked` - registrar closed and revoked its lease
//! - `lease_lost` - keep-alive stream ended without a revoke
//! - `address_upserted` - resolver saw a PUT for an instance
//! - `address_removed` - resolver saw a DELETE for an instance
//! - `resolver_closed` - resolver stopped watching its prefix

use tracing::{info, warn};

/// Emit an instance registered event
pub fn instance_registered(key: &str, weight: u64, lease_id: i64, ttl: i64) {
    info!(
        event_type = "instance_registered",
        key = %key,
        weight = weight,
        lease_id = lease_id,
        ttl = ttl,
        "Instance registered"
    );
}

/// Emit a lease revoked event
pub fn lease_revoked(key: &str, lease_id: i64) {
    info!(
        event_type = "lease_revoked",
        key = %key,
        lease_id = lease_id,
        "Lease revoked"
    );
}

/// Emit a lease lost event
pub fn lease_lost(key: &str, lease_id: i64, reason: &str) {
    warn!(
        event_type = "lease_lost",
        key = %key,
        lease_id = lease_id,
        reason = %reason,
        "Lease lost, instance no longer registered"
    );
}

/// Emit an address upserted event
pub fn address_upserted(service: &str, address: &str, weight: u64) {
    info!(
        event_type = "address_upserted",
        service = %service,
        address = %address,
        weight = weight,
        "Address upserted"
    );
}

/// Emit an address removed event
pub fn address_removed(service: &str, address: &str) {
    info!(
        event_type = "address_removed",
        service = %service,
        address = %address,
        "Address removed"
    );
}

/// Emit a resolver closed event
pub fn resolver_closed(service: &str) {
    info!(
        event_type = "resolver_closed",
        service = %service,
        "Resolver closed"
    );
}

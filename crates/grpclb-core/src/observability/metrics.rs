//! Prometheus Metrics
//!
//! Metrics tracked:
//! - `grpclb_leases_granted_total` - counter of leases granted to registrars
//! - `grpclb_keepalive_acks_total` - counter of keep-alive acknowledgements
//! - `grpclb_leases_lost_total` - counter of leases lost without a revoke
//! - `grpclb_watch_events_total` - counter of watch events by kind
//! - `grpclb_publishes_total` - counter of states published to consumers
//! - `grpclb_published_addresses` - gauge of addresses in the last published state

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Where to expose metrics
#[derive(Debug, Clone, Default)]
pub struct MetricsConfig {
    /// Prometheus scrape listener (None = recorder not installed, metrics are no-ops)
    pub listen_addr: Option<SocketAddr>,
}

/// Install the Prometheus exporter when a listen address is configured.
///
/// Must be called from within a tokio runtime.
pub fn init_metrics(config: &MetricsConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let Some(addr) = config.listen_addr else {
        return Ok(());
    };

    PrometheusBuilder::new().with_http_listener(addr).install()?;
    register_metric_descriptions();

    tracing::info!(addr = %addr, "Prometheus metrics listener started");
    Ok(())
}

/// Register descriptions for all metrics
fn register_metric_descriptions() {
    // Registrar metrics
    describe_counter!(
        "grpclb_leases_granted_total",
        "Total number of leases granted to registrars"
    );
    describe_counter!(
        "grpclb_keepalive_acks_total",
        "Total number of lease keep-alive acknowledgements"
    );
    describe_counter!(
        "grpclb_leases_lost_total",
        "Total number of leases lost without an explicit revoke"
    );

    // Resolver metrics
    describe_counter!(
        "grpclb_watch_events_total",
        "Total number of watch events processed by kind"
    );
    describe_counter!(
        "grpclb_publishes_total",
        "Total number of address sets published to consumers"
    );
    describe_gauge!(
        "grpclb_published_addresses",
        "Number of addresses in the last published state"
    );
}

/// Record a lease grant
pub fn record_lease_granted() {
    counter!("grpclb_leases_granted_total").increment(1);
}

/// Record a keep-alive acknowledgement
pub fn record_keepalive_ack() {
    counter!("grpclb_keepalive_acks_total").increment(1);
}

/// Record a lease lost without revoke
pub fn record_lease_lost() {
    counter!("grpclb_leases_lost_total").increment(1);
}

/// Record a processed watch event
pub fn record_watch_event(kind: &'static str) {
    counter!("grpclb_watch_events_total", "kind" => kind).increment(1);
}

/// Record a published state
pub fn record_publish(service: &str, address_count: usize) {
    counter!("grpclb_publishes_total", "service" => service.to_string()).increment(1);
    gauge!("grpclb_published_addresses", "service" => service.to_string())
        .set(address_count as f64);
}

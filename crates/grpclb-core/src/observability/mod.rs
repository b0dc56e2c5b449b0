//! Observability Module
//!
//! - `metrics`: lease, watch and publish metrics, with an optional Prometheus listener
//! - `events`: structured membership events with consistent fields
//! - `tracing`: subscriber setup (text or JSON, `RUST_LOG` filtering)

pub mod events;
pub mod metrics;
pub mod tracing;

pub use metrics::{init_metrics, MetricsConfig};
pub use tracing::{init_tracing, LogFormat, TracingConfig};

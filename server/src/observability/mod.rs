//! Observability: structured logging and metric hooks.

pub mod metrics;
pub mod tracing;

/// Initialise logging and register metric instruments.
pub fn init(log_level: &str) {
    tracing::init(log_level);
    metrics::register_metrics();
}

//! OpenTelemetry metric instruments.
//!
//! Instruments come from the global meter provider. No exporter is installed
//! here; until a provider is registered the `opentelemetry` no-op provider
//! swallows every measurement. Recording before [`register_metrics`] is a
//! no-op as well.

use std::sync::OnceLock;

use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::{global, KeyValue};

static EVENTS_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
static ADMITTED_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
static INGEST_DURATION_MS: OnceLock<Histogram<f64>> = OnceLock::new();
static TASKS_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
static TASK_DURATION_SECONDS: OnceLock<Histogram<f64>> = OnceLock::new();

/// Return the global [`opentelemetry::metrics::Meter`] scoped to `name`.
#[must_use]
pub fn meter(name: &'static str) -> opentelemetry::metrics::Meter {
    global::meter(name)
}

/// Registers all application metrics. Call once at startup.
pub fn register_metrics() {
    let meter = meter("sy-server");

    EVENTS_TOTAL.get_or_init(|| {
        meter
            .u64_counter("switchyard_events_total")
            .with_description("Webhook events by ingestion outcome")
            .build()
    });

    ADMITTED_TOTAL.get_or_init(|| {
        meter
            .u64_counter("switchyard_rate_limit_admitted_total")
            .with_description("Events that passed the per-source rate limit")
            .build()
    });

    INGEST_DURATION_MS.get_or_init(|| {
        meter
            .f64_histogram("switchyard_ingest_duration_ms")
            .with_description("Webhook handling latency in milliseconds")
            .with_unit("ms")
            .build()
    });

    TASKS_TOTAL.get_or_init(|| {
        meter
            .u64_counter("switchyard_tasks_total")
            .with_description("Dispatched tasks by execution outcome")
            .build()
    });

    TASK_DURATION_SECONDS.get_or_init(|| {
        meter
            .f64_histogram("switchyard_task_duration_seconds")
            .with_description("Task execution time including platform calls")
            .with_unit("s")
            .build()
    });
}

/// Record an ingested event with `outcome` label
/// (dispatched, deduplicated, ignored, throttled, rejected, failed).
pub fn record_event(outcome: &'static str) {
    if let Some(counter) = EVENTS_TOTAL.get() {
        counter.add(1, &[KeyValue::new("outcome", outcome)]);
    }
}

/// Record an event the rate limiter let through.
pub fn record_admitted() {
    if let Some(counter) = ADMITTED_TOTAL.get() {
        counter.add(1, &[]);
    }
}

pub fn record_ingest_duration(duration_ms: f64) {
    if let Some(histogram) = INGEST_DURATION_MS.get() {
        histogram.record(duration_ms, &[]);
    }
}

/// Record a settled task with `outcome` label (completed, automation_error, retried, dead_lettered).
pub fn record_task(outcome: &'static str) {
    if let Some(counter) = TASKS_TOTAL.get() {
        counter.add(1, &[KeyValue::new("outcome", outcome)]);
    }
}

pub fn record_task_duration(duration_s: f64) {
    if let Some(histogram) = TASK_DURATION_SECONDS.get() {
        histogram.record(duration_s, &[]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_is_safe_before_and_after_registration() {
        record_event("dispatched");
        register_metrics();
        register_metrics();
        record_event("dispatched");
        record_admitted();
        record_task("completed");
        record_ingest_duration(1.5);
        record_task_duration(0.25);
        assert!(EVENTS_TOTAL.get().is_some());
        assert!(ADMITTED_TOTAL.get().is_some());
    }
}

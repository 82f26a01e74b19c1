//! # OpenTelemetry Metrics
//!
//! Counters for every failure category the scheduler and reconciler can hit.
//! Instruments come from the global meter provider; when the embedding process
//! has not installed one they are no-ops.
//!
//! ```rust
//! use metrics_etl::metrics;
//! use opentelemetry::KeyValue;
//!
//! metrics::pipeline_failures().add(1, &[KeyValue::new("stage", "extract")]);
//! ```

use opentelemetry::metrics::{Counter, Meter};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

static ETL_METER: OnceLock<Meter> = OnceLock::new();

fn meter() -> &'static Meter {
    ETL_METER.get_or_init(|| opentelemetry::global::meter("metrics-etl"))
}

/// Fires discarded because the task's consumer was still busy
pub fn fires_dropped() -> Counter<u64> {
    meter()
        .u64_counter("etl.scheduler.fires.dropped")
        .with_description("Scheduling events dropped under backpressure")
        .build()
}

/// Pipeline stage failures
///
/// Labels:
/// - stage: extract, transform, load, authorization
pub fn pipeline_failures() -> Counter<u64> {
    meter()
        .u64_counter("etl.pipeline.failures")
        .with_description("Errors raised by extract/transform/load stages")
        .build()
}

/// Authorization failures reported by remote clients
pub fn auth_failures() -> Counter<u64> {
    meter()
        .u64_counter("etl.pipeline.auth.failures")
        .with_description("Remote client authorization failures")
        .build()
}

/// Failed or skipped configuration merges
pub fn merge_failures() -> Counter<u64> {
    meter()
        .u64_counter("etl.reconcile.merge.failures")
        .with_description("Configuration merges that were rolled back or skipped")
        .build()
}

/// Reconciliation cycles
///
/// Labels:
/// - outcome: applied, skipped, failed, resynchronized
pub fn reconcile_cycles() -> Counter<u64> {
    meter()
        .u64_counter("etl.reconcile.cycles")
        .with_description("Reconciliation cycles by outcome")
        .build()
}

/// Convenience for the single-label counters above
pub fn record(counter: Counter<u64>, label: &'static str, value: &'static str) {
    counter.add(1, &[KeyValue::new(label, value)]);
}

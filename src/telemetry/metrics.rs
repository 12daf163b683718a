//! Metric instrument factories for the router.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"bridge-router"` meter;
//! without an OTLP endpoint the global provider is a no-op.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for router instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("bridge-router")
}

/// Counter: work files claimed from the inbox.
pub fn items_claimed() -> Counter<u64> {
    meter()
        .u64_counter("bridge.items.claimed")
        .with_description("Number of work files claimed")
        .build()
}

/// Counter: work items that reached a terminal outcome.
/// Labels: `outcome` ("done" | "error" | "duplicate" | "invalid" | "unparseable" | "crash"), `target`.
pub fn items_finished() -> Counter<u64> {
    meter()
        .u64_counter("bridge.items.finished")
        .with_description("Number of work items finished")
        .build()
}

/// Counter: executor attempts.
/// Labels: `target`, `result` ("ok" or the error code).
pub fn executor_attempts() -> Counter<u64> {
    meter()
        .u64_counter("bridge.executor.attempts")
        .with_description("Number of executor attempts")
        .build()
}

/// Histogram: attempt wall-clock duration in milliseconds.
/// Labels: `target`.
pub fn attempt_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("bridge.executor.attempt_duration_ms")
        .with_description("Executor attempt duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: cycles skipped by the health gate.
/// Labels: `reason`.
pub fn cycles_blocked() -> Counter<u64> {
    meter()
        .u64_counter("bridge.cycles.blocked")
        .with_description("Processing cycles blocked by the health gate")
        .build()
}

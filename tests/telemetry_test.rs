//! Integration tests for telemetry initialization, span helpers, and metric
//! instruments.

use bridge_router::telemetry::{self, TelemetryConfig, metrics, work};
use opentelemetry::KeyValue;

#[test]
fn telemetry_initializes_without_endpoint() {
    // A subscriber can only be installed once per process; a second init in
    // the same test binary returns Err, which is fine here.
    let config = TelemetryConfig::new(None, "debug");
    assert_eq!(config.service_name, "bridge-router");
    let _guard = telemetry::init_telemetry(config);
}

#[test]
fn work_span_records_transitions() {
    let span = work::start_work_span("codex", "20260101T000000Z_t_0001_to_codex.work.md");
    let _enter = span.enter();
    work::record_state_transition(&span, "claimed", "executing");
    work::record_state_transition(&span, "executing", "done");
}

#[test]
fn metric_instruments_accept_their_labels() {
    // Without an OTLP endpoint the global meter provider is a no-op.
    metrics::items_claimed().add(2, &[]);
    metrics::items_finished().add(
        1,
        &[KeyValue::new("outcome", "done"), KeyValue::new("target", "codex")],
    );
    metrics::executor_attempts().add(
        1,
        &[KeyValue::new("target", "codex"), KeyValue::new("result", "timeout")],
    );
    metrics::attempt_duration_ms().record(12.5, &[KeyValue::new("target", "codex")]);
    metrics::cycles_blocked().add(1, &[KeyValue::new("reason", "missing_health")]);
}

#[test]
fn dropping_a_local_only_guard_is_harmless() {
    if let Ok(guard) = telemetry::init_telemetry(TelemetryConfig::new(None, "info")) {
        drop(guard);
    }
    tracing::info!("still logging after the guard is gone");
}

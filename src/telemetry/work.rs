//! Work item span helpers.
//!
//! One span per claimed item covers its whole pipeline: dedup check,
//! validation, attempts, and the terminal document.

use tracing::Span;

/// Start a span for processing one claimed work file.
///
/// The `work.state` field is declared empty and is filled in by
/// [`record_state_transition`].
pub fn start_work_span(target: &str, file: &str) -> Span {
    tracing::info_span!(
        "work.process",
        "work.target" = target,
        "work.file" = file,
        "work.state" = tracing::field::Empty,
    )
}

/// Record a state transition on `span` and update its `work.state` field.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("work.state", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}

//! Router engine: processing cycles and the per-item pipeline.

pub mod control;
pub mod pipeline;

pub use control::{CycleReport, Router};
pub use pipeline::{ItemOutcome, Pipeline};

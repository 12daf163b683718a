//! # bridge-router
//!
//! Filesystem-backed work item router.
//!
//! Work items queued as markdown files are claimed by atomic rename,
//! deduplicated against a persisted index, executed by pluggable executors
//! under a retry budget with exponential backoff, and recorded as exactly
//! one terminal document each.

pub mod config;
pub mod document;
pub mod engine;
pub mod error;
pub mod executor;
pub mod frontmatter;
pub mod health;
pub mod index;
pub mod model;
pub mod retry;
pub mod storage;
pub mod submit;
pub mod telemetry;
pub mod validate;

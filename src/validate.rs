//! Work item metadata validation.
//!
//! Any violation makes the item a non-retryable `invalid_workfile` error
//! before an executor is ever invoked.

use std::fmt;

use crate::frontmatter::{Meta, Value};
use crate::model::REQUIRED_KEYS;

/// One reason a work item was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    MissingKey(String),
    InvalidStatus(String),
    InvalidKind,
    InvalidTarget(String),
    NotAnInteger(&'static str),
    NotPositive(&'static str),
    OutOfRange(&'static str),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::MissingKey(key) => write!(f, "missing_key:{key}"),
            ValidationError::InvalidStatus(status) => write!(f, "invalid_status:{status}"),
            ValidationError::InvalidKind => write!(f, "invalid_kind"),
            ValidationError::InvalidTarget(to) => write!(f, "invalid_to:{to}"),
            ValidationError::NotAnInteger(key) => write!(f, "invalid_{key}"),
            ValidationError::NotPositive(key) => write!(f, "non_positive_{key}"),
            ValidationError::OutOfRange(key) => write!(f, "out_of_range_{key}"),
        }
    }
}

fn normalized(meta: &Meta, key: &str) -> String {
    meta.get(key)
        .map(|v| v.to_string().trim().to_lowercase())
        .unwrap_or_default()
}

/// Check a work item's metadata against the set of known executor targets.
///
/// Returns every violation found, in a stable order; empty means valid.
pub fn validate<'a>(meta: &Meta, known_targets: impl IntoIterator<Item = &'a str>) -> Vec<ValidationError> {
    let mut errors: Vec<ValidationError> = REQUIRED_KEYS
        .iter()
        .filter(|key| !meta.contains_key(**key))
        .map(|key| ValidationError::MissingKey((*key).to_string()))
        .collect();
    errors.sort_by_key(|e| e.to_string());

    let status = normalized(meta, "status");
    if status != "new" {
        errors.push(ValidationError::InvalidStatus(status));
    }

    if normalized(meta, "kind") != "work" {
        errors.push(ValidationError::InvalidKind);
    }

    let to = normalized(meta, "to");
    if !known_targets.into_iter().any(|t| t == to) {
        errors.push(ValidationError::InvalidTarget(to));
    }

    for (key, max) in [("timeout_s", i64::MAX), ("max_retries", i64::from(u32::MAX))] {
        match meta.get(key) {
            Some(Value::Int(n)) if *n > max => errors.push(ValidationError::OutOfRange(key)),
            Some(Value::Int(n)) if *n > 0 => {}
            Some(Value::Int(_)) => errors.push(ValidationError::NotPositive(key)),
            _ => errors.push(ValidationError::NotAnInteger(key)),
        }
    }

    errors
}

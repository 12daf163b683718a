//! Typed configuration from environment variables.
//!
//! Loads once at startup and fails fast on malformed values.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::executor::ExecutorRegistry;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct Config {
    /// Repository root; the queue lives at `{root}/bridge/`.
    pub root: PathBuf,
    /// Default pool width.
    pub workers: usize,
    /// Explicit executor definition directory.
    pub executors_dir: Option<PathBuf>,
    /// Length of one backoff time unit.
    pub backoff_unit: Duration,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            root: PathBuf::from(var_or("BRIDGE_ROOT", ".")),
            workers: positive_var("BRIDGE_WORKERS", 1)? as usize,
            executors_dir: std::env::var("BRIDGE_EXECUTORS_DIR")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
            backoff_unit: Duration::from_millis(positive_var("BRIDGE_BACKOFF_UNIT_MS", 1000)?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: var_or("LOG_LEVEL", "info"),
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::with_unit(self.backoff_unit)
    }

    /// Build the executor registry: the explicit directory, else
    /// `{root}/bridge/executors` if present, else the built-in variants.
    pub fn registry(&self) -> Result<ExecutorRegistry> {
        if let Some(dir) = &self.executors_dir {
            return ExecutorRegistry::load_from_dir(dir, &self.root);
        }
        let default_dir = self.root.join("bridge").join("executors");
        if default_dir.is_dir() {
            ExecutorRegistry::load_from_dir(&default_dir, &self.root)
        } else {
            Ok(ExecutorRegistry::builtin(&self.root))
        }
    }
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn positive_var(name: &str, default: u64) -> Result<u64> {
    let Ok(raw) = std::env::var(name) else {
        return Ok(default);
    };
    match raw.trim().parse::<u64>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(Error::Config(format!(
            "{name} must be a positive integer, got {raw:?}"
        ))),
    }
}

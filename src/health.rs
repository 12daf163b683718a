//! Health gate.
//!
//! Health is computed by an external checker; the router only reads the
//! snapshot, once per cycle.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::warn;

use crate::model::HealthStatus;

/// Reason reported when no snapshot has been written yet.
pub const MISSING_HEALTH: &str = "missing_health";

/// Source of the precondition consulted before each cycle.
#[async_trait]
pub trait HealthSource: Send + Sync {
    async fn status(&self) -> HealthStatus;
}

/// Snapshot file at `state/health.json`.
#[derive(Debug, Clone)]
pub struct HealthFile {
    path: PathBuf,
}

impl HealthFile {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }
}

#[async_trait]
impl HealthSource for HealthFile {
    async fn status(&self) -> HealthStatus {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(_) => return HealthStatus::unhealthy(MISSING_HEALTH),
        };
        match serde_json::from_str::<HealthStatus>(&text) {
            Ok(mut status) => {
                if !status.ok && status.reason.is_empty() {
                    status.reason = "health_not_ok".to_string();
                }
                status
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "unreadable health snapshot");
                HealthStatus::unhealthy(format!("invalid_health: {e}"))
            }
        }
    }
}

/// A fixed status, for embedding and tests.
#[derive(Debug, Clone)]
pub struct StaticHealth(pub HealthStatus);

#[async_trait]
impl HealthSource for StaticHealth {
    async fn status(&self) -> HealthStatus {
        self.0.clone()
    }
}

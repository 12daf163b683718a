//! Control plane: health gate, claiming, bounded fan-out, daemon loop.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{Instrument, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::Result;
use crate::executor::ExecutorRegistry;
use crate::health::{HealthFile, HealthSource};
use crate::index::DedupIndex;
use crate::retry::RetryPolicy;
use crate::storage::{self, Layout};
use crate::telemetry::metrics;

use super::pipeline::{ItemOutcome, Pipeline, display_name};

/// What one processing cycle did.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    /// Items that reached a terminal outcome.
    pub processed: usize,
    /// Per-item outcomes in claim order.
    pub outcomes: Vec<ItemOutcome>,
    /// Health gate reason when the cycle was blocked.
    pub blocked: Option<String>,
}

/// The router: runs processing cycles over one queue root.
pub struct Router {
    pipeline: Arc<Pipeline>,
    health: Arc<dyn HealthSource>,
}

impl Clone for Router {
    fn clone(&self) -> Self {
        Self {
            pipeline: Arc::clone(&self.pipeline),
            health: Arc::clone(&self.health),
        }
    }
}

impl Router {
    pub fn new(
        layout: Layout,
        registry: ExecutorRegistry,
        health: Arc<dyn HealthSource>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            pipeline: Arc::new(Pipeline::new(layout, registry, policy)),
            health,
        }
    }

    /// Router over `{root}/bridge` reading `state/health.json`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let layout = Layout::new(&config.root);
        let health = Arc::new(HealthFile::new(&layout.health_path()));
        Ok(Self::new(
            layout,
            config.registry()?,
            health,
            config.retry_policy(),
        ))
    }

    pub fn layout(&self) -> &Layout {
        &self.pipeline.layout
    }

    pub fn registry(&self) -> &ExecutorRegistry {
        &self.pipeline.registry
    }

    /// Run one cycle: gate, claim everything pending, process with `workers`
    /// parallel workers.
    pub async fn run_once(&self, workers: usize) -> Result<CycleReport> {
        let cycle_id = Uuid::new_v4();
        let span = tracing::info_span!("router.cycle", cycle.id = %cycle_id, workers);
        self.cycle(workers).instrument(span).await
    }

    async fn cycle(&self, workers: usize) -> Result<CycleReport> {
        let layout = self.layout();
        layout.ensure().await?;

        let health = self.health.status().await;
        if !health.ok {
            warn!(reason = %health.reason, "health gate closed, nothing claimed");
            metrics::cycles_blocked().add(1, &[KeyValue::new("reason", health.reason.clone())]);
            return Ok(CycleReport {
                blocked: Some(health.reason),
                ..CycleReport::default()
            });
        }

        let claimed = storage::claim_all(&layout.inbox, &layout.inprogress).await?;
        if claimed.is_empty() {
            return Ok(CycleReport::default());
        }
        metrics::items_claimed().add(claimed.len() as u64, &[]);
        info!(claimed = claimed.len(), "claimed work files");

        let index = Arc::new(DedupIndex::load(&layout.index_path()).await);
        let outcomes = self.process_batch(claimed, index, workers).await;

        for outcome in &outcomes {
            metrics::items_finished().add(
                1,
                &[
                    KeyValue::new("outcome", outcome.label()),
                    KeyValue::new("target", outcome.target().to_string()),
                ],
            );
        }
        let processed = outcomes.iter().filter(|o| o.is_processed()).count();
        info!(processed, "cycle finished");
        Ok(CycleReport {
            processed,
            outcomes,
            blocked: None,
        })
    }

    /// Process a batch with at most `width` items in flight.
    ///
    /// Permits are taken in claim order before each spawn, so width 1 runs
    /// items strictly one after another. A failing or panicking item becomes
    /// a `Crashed` outcome and never affects its siblings.
    pub async fn process_batch(
        &self,
        paths: Vec<PathBuf>,
        index: Arc<DedupIndex>,
        width: usize,
    ) -> Vec<ItemOutcome> {
        let semaphore = Arc::new(Semaphore::new(width.max(1)));
        let mut handles: Vec<(String, JoinHandle<ItemOutcome>)> = Vec::with_capacity(paths.len());
        let mut outcomes = Vec::with_capacity(paths.len());

        for path in paths {
            let file = display_name(&path);
            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!(file = %file, error = %e, "worker pool closed");
                    outcomes.push(ItemOutcome::Crashed {
                        file,
                        error: e.to_string(),
                    });
                    continue;
                }
            };

            let pipeline = Arc::clone(&self.pipeline);
            let index = Arc::clone(&index);
            let task_file = file.clone();
            let handle = tokio::spawn(async move {
                let _permit = permit;
                match pipeline.process(&index, &path).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!(file = %task_file, error = %e, "work item crashed");
                        ItemOutcome::Crashed {
                            file: task_file,
                            error: e.to_string(),
                        }
                    }
                }
            });
            handles.push((file, handle));
        }

        for (file, handle) in handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    error!(file = %file, error = %e, "worker task panicked");
                    outcomes.push(ItemOutcome::Crashed {
                        file,
                        error: e.to_string(),
                    });
                }
            }
        }
        outcomes
    }

    /// Run cycles every `interval` until `shutdown` is notified.
    ///
    /// `on_cycle` sees each report (the binary prints it). A cycle in
    /// progress always completes; shutdown is observed between cycles.
    pub async fn run_daemon<F>(
        &self,
        interval: Duration,
        workers: usize,
        shutdown: Arc<Notify>,
        mut on_cycle: F,
    ) -> Result<()>
    where
        F: FnMut(&CycleReport),
    {
        info!(interval_s = interval.as_secs(), workers, "daemon started");
        loop {
            match self.run_once(workers).await {
                Ok(report) => on_cycle(&report),
                Err(e) => error!(error = %e, "cycle failed"),
            }

            tokio::select! {
                _ = shutdown.notified() => {
                    info!("daemon shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("pipeline", &self.pipeline)
            .finish_non_exhaustive()
    }
}

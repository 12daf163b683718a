//! Per-item pipeline: dedup check, validation, attempts, terminal document,
//! index commit, in-flight cleanup.

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{Instrument, Span, error, info, warn};

use crate::document;
use crate::error::{Error, Result};
use crate::executor::ExecutorRegistry;
use crate::frontmatter::Meta;
use crate::index::{DedupIndex, EntryStatus, IndexEntry};
use crate::model::{DedupKey, ErrorStage, ExecutorResult, WorkItem, codes};
use crate::retry::{self, RetryPolicy};
use crate::storage::{self, Layout};
use crate::telemetry::work::{record_state_transition, start_work_span};
use crate::validate::validate;

/// Actor name on documents the router writes itself.
pub const ROUTER_ACTOR: &str = "router";

const DEFAULT_TIMEOUT_S: u64 = 240;
const DEFAULT_MAX_RETRIES: u32 = 1;

/// Terminal outcome of one claimed file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Done {
        file: String,
        target: String,
        document: PathBuf,
        followup: Option<PathBuf>,
        attempts: u32,
    },
    Failed {
        file: String,
        target: String,
        document: PathBuf,
        error_code: String,
        attempts: u32,
    },
    Duplicate {
        file: String,
        target: String,
        document: PathBuf,
    },
    Invalid {
        file: String,
        target: String,
        document: PathBuf,
        errors: Vec<String>,
    },
    /// Frontmatter could not be parsed; no identity, never indexed.
    Unparseable {
        file: String,
        reason: String,
        document: PathBuf,
    },
    /// Internal fault caught at the pool boundary.
    Crashed { file: String, error: String },
}

impl ItemOutcome {
    /// Whether the item counts toward a cycle's processed total.
    pub fn is_processed(&self) -> bool {
        !matches!(self, ItemOutcome::Crashed { .. })
    }

    /// Metric label.
    pub fn label(&self) -> &'static str {
        match self {
            ItemOutcome::Done { .. } => "done",
            ItemOutcome::Failed { .. } => "error",
            ItemOutcome::Duplicate { .. } => "duplicate",
            ItemOutcome::Invalid { .. } => "invalid",
            ItemOutcome::Unparseable { .. } => "unparseable",
            ItemOutcome::Crashed { .. } => "crash",
        }
    }

    pub fn target(&self) -> &str {
        match self {
            ItemOutcome::Done { target, .. }
            | ItemOutcome::Failed { target, .. }
            | ItemOutcome::Duplicate { target, .. }
            | ItemOutcome::Invalid { target, .. } => target,
            ItemOutcome::Unparseable { .. } | ItemOutcome::Crashed { .. } => "unknown",
        }
    }

    /// The terminal document, if one was written.
    pub fn document(&self) -> Option<&Path> {
        match self {
            ItemOutcome::Done { document, .. }
            | ItemOutcome::Failed { document, .. }
            | ItemOutcome::Duplicate { document, .. }
            | ItemOutcome::Invalid { document, .. }
            | ItemOutcome::Unparseable { document, .. } => Some(document),
            ItemOutcome::Crashed { .. } => None,
        }
    }
}

/// Operator-facing outcome line body.
impl fmt::Display for ItemOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemOutcome::Done { file, target, .. } => write!(f, "done:{file}:{target}"),
            ItemOutcome::Failed { file, target, .. } => write!(f, "error:{file}:{target}"),
            ItemOutcome::Duplicate { file, target, .. } => {
                write!(f, "skip_duplicate:{file}:{target}")
            }
            ItemOutcome::Invalid { file, target, .. } => write!(f, "error_invalid:{file}:{target}"),
            ItemOutcome::Unparseable { file, reason, .. } => {
                write!(f, "error_parse:{file}:{reason}")
            }
            ItemOutcome::Crashed { file, error } => write!(f, "crash:{file}:{error}"),
        }
    }
}

/// File name of `path` for outcome lines.
pub fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Shared, read-only context for processing claimed items.
#[derive(Debug)]
pub struct Pipeline {
    pub layout: Layout,
    pub registry: ExecutorRegistry,
    pub policy: RetryPolicy,
}

impl Pipeline {
    pub fn new(layout: Layout, registry: ExecutorRegistry, policy: RetryPolicy) -> Self {
        Self {
            layout,
            registry,
            policy,
        }
    }

    /// Drive one claimed file to its terminal outcome.
    ///
    /// `Err` means an internal fault; the caller reports it as a crash.
    pub async fn process(&self, index: &DedupIndex, path: &Path) -> Result<ItemOutcome> {
        let file = display_name(path);
        let item = match WorkItem::load(path).await {
            Ok(item) => item,
            Err(e) => return self.reject_unparseable(path, file, e).await,
        };

        let span = start_work_span(&item.target(), &file);
        record_state_transition(&span, "pending", "claimed");
        self.process_item(index, item, file, &span)
            .instrument(span.clone())
            .await
    }

    async fn process_item(
        &self,
        index: &DedupIndex,
        item: WorkItem,
        file: String,
        span: &Span,
    ) -> Result<ItemOutcome> {
        let target = item.target();
        let key = item.key();

        if !index.reserve(&key).await {
            record_state_transition(span, "claimed", "duplicate");
            let result = router_failure(
                codes::DUPLICATE_TASK,
                ErrorStage::Dedupe,
                format!("duplicate key already processed: {key}"),
            );
            let document = document::write_error(&self.layout, &item.meta, &target, &result).await?;
            storage::remove_inflight(&item.path).await;
            info!(key = %key, "duplicate task skipped");
            return Ok(ItemOutcome::Duplicate {
                file,
                target,
                document,
            });
        }

        let outcome = self.process_reserved(index, &item, &key, file, span).await;
        if outcome.is_err() {
            index.release(&key).await;
        }
        outcome
    }

    async fn process_reserved(
        &self,
        index: &DedupIndex,
        item: &WorkItem,
        key: &DedupKey,
        file: String,
        span: &Span,
    ) -> Result<ItemOutcome> {
        let target = item.target();

        record_state_transition(span, "claimed", "validating");
        let errors: Vec<String> = validate(&item.meta, self.registry.targets())
            .iter()
            .map(ToString::to_string)
            .collect();
        if !errors.is_empty() {
            record_state_transition(span, "validating", "invalid");
            warn!(errors = %errors.join(","), "invalid work file");
            let result = router_failure(codes::INVALID_WORKFILE, ErrorStage::Validation, errors.join("\n"));
            let document = document::write_error(&self.layout, &item.meta, &target, &result).await?;
            let entry = IndexEntry {
                status: EntryStatus::Error,
                actor: None,
                error_code: Some(codes::INVALID_WORKFILE.to_string()),
                at: storage::now_iso(),
                source: item.path.display().to_string(),
                output: document.display().to_string(),
                followup: None,
            };
            index.commit(key, entry).await?;
            storage::remove_inflight(&item.path).await;
            return Ok(ItemOutcome::Invalid {
                file,
                target,
                document,
                errors,
            });
        }

        let executor = self
            .registry
            .get(&target)
            .ok_or_else(|| Error::Other(format!("no executor registered for {target}")))?;
        let timeout_s = item.timeout_s().unwrap_or(DEFAULT_TIMEOUT_S);
        let max_retries = item.max_retries().unwrap_or(DEFAULT_MAX_RETRIES);

        record_state_transition(span, "validating", "executing");
        let run = retry::run_with_retries(
            executor.as_ref(),
            item,
            &self.layout,
            self.policy,
            max_retries,
            timeout_s,
        )
        .await?;
        let actor = executor.name().to_string();

        if run.result.ok {
            let followup = match executor.handoff_target() {
                Some(next) => Some(
                    document::write_handoff(&self.layout, &item.meta, &actor, next, &run.result.stdout)
                        .await?,
                ),
                None => None,
            };
            let document =
                document::write_success(&self.layout, &item.meta, &actor, &run.result, followup.as_deref())
                    .await?;
            let entry = IndexEntry {
                status: EntryStatus::Done,
                actor: Some(actor),
                error_code: None,
                at: storage::now_iso(),
                source: item.path.display().to_string(),
                output: document.display().to_string(),
                followup: followup.as_ref().map(|p| p.display().to_string()),
            };
            index.commit(key, entry).await?;
            storage::remove_inflight(&item.path).await;
            record_state_transition(span, "executing", "done");
            if let Some(next) = &followup {
                info!(followup = %next.display(), "hand-off queued");
            }
            return Ok(ItemOutcome::Done {
                file,
                target,
                document,
                followup,
                attempts: run.attempts,
            });
        }

        let error_code = run.result.code().to_string();
        let document = document::write_error(&self.layout, &item.meta, &actor, &run.result).await?;
        let entry = IndexEntry {
            status: EntryStatus::Error,
            actor: Some(actor),
            error_code: Some(error_code.clone()),
            at: storage::now_iso(),
            source: item.path.display().to_string(),
            output: document.display().to_string(),
            followup: None,
        };
        index.commit(key, entry).await?;
        storage::remove_inflight(&item.path).await;
        record_state_transition(span, "executing", "error");
        Ok(ItemOutcome::Failed {
            file,
            target,
            document,
            error_code,
            attempts: run.attempts,
        })
    }

    async fn reject_unparseable(&self, path: &Path, file: String, cause: Error) -> Result<ItemOutcome> {
        let reason = cause.to_string();
        error!(file = %file, error = %reason, "unparseable work file");

        let mut meta = Meta::new();
        meta.insert("thread_id".into(), "unknown".into());
        meta.insert("task_id".into(), "unknown".into());
        let result = router_failure(
            codes::UNPARSEABLE_WORKFILE,
            ErrorStage::Validation,
            format!("{file}: {reason}"),
        );
        let document = document::write_error(&self.layout, &meta, ROUTER_ACTOR, &result).await?;
        storage::remove_inflight(path).await;
        Ok(ItemOutcome::Unparseable {
            file,
            reason,
            document,
        })
    }
}

/// A non-retryable failure decided by the router before any attempt.
fn router_failure(code: &str, stage: ErrorStage, detail: String) -> ExecutorResult {
    ExecutorResult::failure(code, stage, false, detail, 0)
}

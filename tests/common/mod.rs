//! Shared helpers for router integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bridge_router::engine::Router;
use bridge_router::executor::{Executor, ExecutorRegistry};
use bridge_router::frontmatter::{self, Meta, Value};
use bridge_router::health::StaticHealth;
use bridge_router::model::{ErrorStage, ExecutorResult, HealthStatus};
use bridge_router::retry::RetryPolicy;
use bridge_router::storage::{self, Layout};

pub const STAMP: &str = "20260101T000000Z";

/// In-process executor that replays scripted results.
pub struct Scripted {
    name: String,
    handoff: Option<String>,
    retryable: Vec<String>,
    script: Mutex<VecDeque<ExecutorResult>>,
    fallback: ExecutorResult,
    delay: Duration,
    calls: AtomicU32,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl Scripted {
    /// Always succeeds with `stdout`.
    pub fn succeeding(name: &str, stdout: &str) -> Self {
        Self {
            name: name.to_string(),
            handoff: None,
            retryable: ["timeout", "stream_disconnected", "exec_error", "non_zero"]
                .map(String::from)
                .to_vec(),
            script: Mutex::new(VecDeque::new()),
            fallback: ExecutorResult::success(stdout, 1),
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
        }
    }

    /// Always fails with `code`.
    pub fn failing(name: &str, code: &str, stage: ErrorStage, can_retry: bool) -> Self {
        let mut s = Self::succeeding(name, "");
        s.fallback = ExecutorResult::failure(code, stage, can_retry, format!("{code} from {name}"), 1);
        s
    }

    pub fn handing_off_to(mut self, target: &str) -> Self {
        self.handoff = Some(target.to_string());
        self
    }

    pub fn with_retryable(mut self, codes: &[&str]) -> Self {
        self.retryable = codes.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Results returned before falling back, in order.
    pub fn then(self, result: ExecutorResult) -> Self {
        self.script.lock().unwrap().push_back(result);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Executor for Scripted {
    fn name(&self) -> &str {
        &self.name
    }

    fn handoff_target(&self) -> Option<&str> {
        self.handoff.as_deref()
    }

    fn retryable_errors(&self) -> &[String] {
        &self.retryable
    }

    async fn execute(&self, _meta: &Meta, _body: &str, _timeout_s: u64, attempt: u32) -> ExecutorResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.running.fetch_sub(1, Ordering::SeqCst);

        let scripted = self.script.lock().unwrap().pop_front();
        let mut result = scripted.unwrap_or_else(|| self.fallback.clone());
        result.retry_count = attempt;
        result
    }
}

/// Fresh queue in a temp dir with every stage created.
pub async fn test_layout() -> (tempfile::TempDir, Layout) {
    let dir = tempfile::tempdir().unwrap();
    let layout = Layout::new(dir.path());
    layout.ensure().await.unwrap();
    (dir, layout)
}

/// Router with a healthy gate and a 1ms backoff unit.
pub fn test_router(layout: &Layout, registry: ExecutorRegistry) -> Router {
    router_with_health(layout, registry, HealthStatus::healthy())
}

pub fn router_with_health(layout: &Layout, registry: ExecutorRegistry, health: HealthStatus) -> Router {
    Router::new(
        layout.clone(),
        registry,
        Arc::new(StaticHealth(health)),
        RetryPolicy::with_unit(Duration::from_millis(1)),
    )
}

/// Valid work item metadata.
pub fn work_meta(thread_id: &str, task_id: &str, to: &str) -> Meta {
    let mut meta = Meta::new();
    meta.insert("kind".into(), "work".into());
    meta.insert("thread_id".into(), thread_id.into());
    meta.insert("task_id".into(), task_id.into());
    meta.insert("from".into(), "human".into());
    meta.insert("to".into(), to.into());
    meta.insert("assign".into(), "@implementer".into());
    meta.insert("priority".into(), "high".into());
    meta.insert("status".into(), "new".into());
    meta.insert("timeout_s".into(), Value::Int(30));
    meta.insert("max_retries".into(), Value::Int(3));
    meta.insert("response_lang".into(), "en".into());
    meta.insert("created_at".into(), "2026-01-01T00:00:00+00:00".into());
    meta
}

/// Drop a work item into the inbox; `n` disambiguates identical identities.
pub async fn enqueue(layout: &Layout, meta: &Meta, body: &str, n: u32) -> PathBuf {
    let name = storage::work_file_name(
        STAMP,
        &meta["thread_id"].to_string(),
        &meta["task_id"].to_string(),
        n,
        &meta["to"].to_string(),
    );
    let path = layout.inbox.join(name);
    tokio::fs::write(&path, frontmatter::render(meta, body)).await.unwrap();
    path
}

/// Sorted file names in `dir`.
pub fn files_in(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| !n.starts_with('.'))
        .collect();
    names.sort();
    names
}

/// Parse a document's frontmatter.
pub fn read_meta(path: &Path) -> Meta {
    let text = std::fs::read_to_string(path).unwrap();
    frontmatter::parse(&text).unwrap().0
}

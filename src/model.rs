//! Core data model.
//!
//! A work item is a queued instruction for one executor target. Its identity
//! is the `(thread_id, task_id, target)` triple; everything else in the
//! frontmatter is routing, scheduling, or lifecycle metadata.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::frontmatter::{self, Meta, Value};

/// Metadata keys every work item must carry.
pub const REQUIRED_KEYS: [&str; 11] = [
    "kind",
    "thread_id",
    "task_id",
    "from",
    "to",
    "assign",
    "priority",
    "status",
    "timeout_s",
    "max_retries",
    "created_at",
];

// ---------------------------------------------------------------------------
// Work Item
// ---------------------------------------------------------------------------

/// A parsed work item file.
#[derive(Debug, Clone)]
pub struct WorkItem {
    /// Where the file currently lives (normally the in-flight stage).
    pub path: PathBuf,
    pub meta: Meta,
    /// Task instructions. Opaque to the router.
    pub body: String,
}

impl WorkItem {
    /// Read and parse a work item file.
    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path).await?;
        let (meta, body) = frontmatter::parse(&text)?;
        Ok(Self {
            path: path.to_path_buf(),
            meta,
            body,
        })
    }

    /// File name with the final `.md` removed, used for attempt log names.
    pub fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Executor target, lower-cased. `"unknown"` when absent.
    pub fn target(&self) -> String {
        target_of(&self.meta)
    }

    pub fn key(&self) -> DedupKey {
        DedupKey::from_meta(&self.meta)
    }

    /// Per-attempt wall-clock bound, in seconds.
    pub fn timeout_s(&self) -> Option<u64> {
        self.budget("timeout_s")
    }

    /// Attempt budget.
    pub fn max_retries(&self) -> Option<u32> {
        self.budget("max_retries")
    }

    /// Positive integer metadata value that fits `T`.
    fn budget<T: TryFrom<i64>>(&self, key: &str) -> Option<T> {
        self.meta
            .get(key)
            .and_then(Value::as_int)
            .filter(|n| *n > 0)
            .and_then(|n| T::try_from(n).ok())
    }
}

/// Lower-cased, trimmed `to` value of a metadata map.
pub fn target_of(meta: &Meta) -> String {
    let target = meta
        .get("to")
        .map(|v| v.to_string().trim().to_lowercase())
        .unwrap_or_default();
    if target.is_empty() {
        "unknown".to_string()
    } else {
        target
    }
}

/// Render a metadata value as it appears in file names and keys.
pub fn meta_str(meta: &Meta, key: &str) -> String {
    meta.get(key).map_or_else(|| "null".to_string(), Value::to_string)
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Logical task identity: `thread_id::task_id::target`.
///
/// The target is part of the key so one `(thread_id, task_id)` may be
/// processed once per executor in a refine → execute chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DedupKey(pub String);

impl DedupKey {
    pub fn new(thread_id: &str, task_id: &str, target: &str) -> Self {
        Self(format!(
            "{thread_id}::{task_id}::{}",
            target.trim().to_lowercase()
        ))
    }

    pub fn from_meta(meta: &Meta) -> Self {
        let target = meta
            .get("to")
            .map(|v| v.to_string())
            .unwrap_or_default();
        Self::new(
            &meta_str(meta, "thread_id"),
            &meta_str(meta, "task_id"),
            &target,
        )
    }
}

impl std::fmt::Display for DedupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

/// Where in the pipeline a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStage {
    /// Required binary or runtime missing.
    Precheck,
    /// Missing or rejected credentials.
    Auth,
    /// Launch failure, non-zero exit, timeout.
    Exec,
    /// Transport disconnect mid-stream.
    ResponseStream,
    /// Output unusable after a clean exit.
    Postprocess,
    /// Malformed or incomplete metadata.
    Validation,
    /// Already processed.
    Dedupe,
    Unknown,
}

impl std::fmt::Display for ErrorStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorStage::Precheck => "precheck",
            ErrorStage::Auth => "auth",
            ErrorStage::Exec => "exec",
            ErrorStage::ResponseStream => "response_stream",
            ErrorStage::Postprocess => "postprocess",
            ErrorStage::Validation => "validation",
            ErrorStage::Dedupe => "dedupe",
            ErrorStage::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Error codes produced by the router itself and the bundled executors.
pub mod codes {
    pub const DUPLICATE_TASK: &str = "duplicate_task";
    pub const INVALID_WORKFILE: &str = "invalid_workfile";
    pub const UNPARSEABLE_WORKFILE: &str = "unparseable_workfile";
    pub const TIMEOUT: &str = "timeout";
    pub const EXEC_ERROR: &str = "exec_error";
    pub const NON_ZERO: &str = "non_zero";
    pub const STREAM_DISCONNECTED: &str = "stream_disconnected";
    pub const AUTH_FAILED: &str = "auth_failed";
    pub const EMPTY_OUTPUT: &str = "empty_output";
    pub const UNKNOWN: &str = "unknown";
}

// ---------------------------------------------------------------------------
// Executor result
// ---------------------------------------------------------------------------

/// Outcome of one executor attempt. Never persisted directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorResult {
    pub ok: bool,
    pub error_code: Option<String>,
    pub error_stage: Option<ErrorStage>,
    pub exit_code: Option<i32>,
    pub elapsed_ms: u64,
    /// Attempt number that produced this result.
    pub retry_count: u32,
    pub can_retry: bool,
    /// Parsed output handed to documents and hand-offs.
    pub stdout: String,
    pub stderr: String,
    /// Unparsed stdout, kept for attempt logs.
    pub raw_stdout: String,
}

impl ExecutorResult {
    pub fn success(stdout: impl Into<String>, attempt: u32) -> Self {
        Self {
            ok: true,
            error_code: None,
            error_stage: None,
            exit_code: Some(0),
            elapsed_ms: 0,
            retry_count: attempt,
            can_retry: false,
            stdout: stdout.into(),
            stderr: String::new(),
            raw_stdout: String::new(),
        }
    }

    pub fn failure(
        code: impl Into<String>,
        stage: ErrorStage,
        can_retry: bool,
        stderr: impl Into<String>,
        attempt: u32,
    ) -> Self {
        Self {
            ok: false,
            error_code: Some(code.into()),
            error_stage: Some(stage),
            exit_code: None,
            elapsed_ms: 0,
            retry_count: attempt,
            can_retry,
            stdout: String::new(),
            stderr: stderr.into(),
            raw_stdout: String::new(),
        }
    }

    pub fn with_exit_code(mut self, code: Option<i32>) -> Self {
        self.exit_code = code;
        self
    }

    pub fn with_elapsed_ms(mut self, elapsed_ms: u64) -> Self {
        self.elapsed_ms = elapsed_ms;
        self
    }

    pub fn with_output(mut self, stdout: impl Into<String>, raw_stdout: impl Into<String>) -> Self {
        self.stdout = stdout.into();
        self.raw_stdout = raw_stdout.into();
        self
    }

    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = stderr.into();
        self
    }

    pub fn code(&self) -> &str {
        self.error_code.as_deref().unwrap_or(codes::UNKNOWN)
    }

    pub fn stage(&self) -> ErrorStage {
        self.error_stage.unwrap_or(ErrorStage::Unknown)
    }
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

/// Snapshot written by the external health checker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub checks: serde_json::Value,
}

impl HealthStatus {
    pub fn healthy() -> Self {
        Self {
            ok: true,
            reason: "ok".to_string(),
            checks: serde_json::Value::Null,
        }
    }

    pub fn unhealthy(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            reason: reason.into(),
            checks: serde_json::Value::Null,
        }
    }
}

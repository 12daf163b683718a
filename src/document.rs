//! Terminal documents and the refine → execute hand-off.
//!
//! Every work item ends in exactly one document in the done or error stage.
//! Documents use the same frontmatter envelope as work items and are
//! created exclusively, so an existing document is never replaced.

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::frontmatter::{self, Meta, Value};
use crate::model::{ExecutorResult, meta_str};
use crate::storage::{self, Layout};

/// Lines of captured stderr kept in an error document.
pub const STDERR_TAIL_LINES: usize = 80;

const TEMPLATE_SECTIONS: [&str; 4] = ["# TASK", "# CONTEXT", "# REQUIREMENTS", "# OUTPUT"];

const HANDOFF_DEFAULT_TIMEOUT_S: i64 = 240;
const HANDOFF_DEFAULT_MAX_RETRIES: i64 = 3;

/// Last `n` lines of `text`, trimmed.
pub fn tail(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n").trim().to_string()
}

fn copy(meta: &Meta, key: &str) -> Value {
    meta.get(key).cloned().unwrap_or(Value::Null)
}

/// Render the success document for `result`.
pub fn render_success(meta: &Meta, actor: &str, result: &ExecutorResult, followup: Option<&Path>) -> String {
    let mut front = Meta::new();
    front.insert("kind".into(), "result".into());
    front.insert("thread_id".into(), copy(meta, "thread_id"));
    front.insert("task_id".into(), copy(meta, "task_id"));
    front.insert("from".into(), actor.into());
    front.insert("to".into(), "router".into());
    front.insert("assign".into(), copy(meta, "assign"));
    front.insert("status".into(), "done".into());
    front.insert("exit_code".into(), i64::from(result.exit_code.unwrap_or(0)).into());
    front.insert("elapsed_ms".into(), result.elapsed_ms.into());
    front.insert("retries".into(), result.retry_count.into());
    front.insert("created_at".into(), storage::now_iso().into());

    let summary = result.stdout.trim();
    let mut body = format!(
        "# RESULT\n{}\n\n",
        if summary.is_empty() { "(no summary)" } else { summary }
    );
    if let Some(path) = followup {
        body.push_str(&format!(
            "# FOLLOWUP\n- created_work: {}\n- The router queued this follow-up work item automatically.\n\n",
            path.display()
        ));
    }
    body.push_str("# NEXT\n- Review the result and decide whether to queue further work.\n");
    frontmatter::render(&front, &body)
}

/// Render the error document for `result`.
pub fn render_error(meta: &Meta, actor: &str, result: &ExecutorResult) -> String {
    let code = result.code();
    let stage = result.stage().to_string();

    let mut front = Meta::new();
    front.insert("kind".into(), "error".into());
    front.insert("thread_id".into(), copy(meta, "thread_id"));
    front.insert("task_id".into(), copy(meta, "task_id"));
    front.insert("from".into(), actor.into());
    front.insert("to".into(), "router".into());
    front.insert("assign".into(), copy(meta, "assign"));
    front.insert("status".into(), "error".into());
    front.insert("error_code".into(), code.into());
    front.insert("error_stage".into(), stage.as_str().into());
    front.insert("retry_count".into(), result.retry_count.into());
    front.insert("can_retry".into(), result.can_retry.into());
    front.insert("created_at".into(), storage::now_iso().into());

    let stderr_tail = tail(&result.stderr, STDERR_TAIL_LINES);
    let body = format!(
        "# ERROR\n\
         - error_code: {code}\n\
         - error_stage: {stage}\n\
         - retry_count: {}\n\
         - can_retry: {}\n\
         \n\
         # STDERR_TAIL\n\
         ```text\n\
         {}\n\
         ```\n",
        result.retry_count,
        result.can_retry,
        if stderr_tail.is_empty() { "(empty)" } else { stderr_tail.as_str() },
    );
    frontmatter::render(&front, &body)
}

/// Create the document file in `dir` for `meta` and return its path.
async fn write_document(dir: &Path, meta: &Meta, actor: &str, kind: &str, text: &str) -> Result<PathBuf> {
    let stamp = storage::now_stamp();
    let thread_id = meta_str(meta, "thread_id");
    let task_id = meta_str(meta, "task_id");
    storage::create_unique(
        dir,
        |n| storage::document_file_name(&stamp, &thread_id, &task_id, n, actor, kind),
        text,
    )
    .await
}

/// Write a success document into the done stage.
pub async fn write_success(
    layout: &Layout,
    meta: &Meta,
    actor: &str,
    result: &ExecutorResult,
    followup: Option<&Path>,
) -> Result<PathBuf> {
    let text = render_success(meta, actor, result, followup);
    write_document(&layout.done, meta, actor, "result", &text).await
}

/// Write an error document into the error stage.
pub async fn write_error(layout: &Layout, meta: &Meta, actor: &str, result: &ExecutorResult) -> Result<PathBuf> {
    let text = render_error(meta, actor, result);
    write_document(&layout.error, meta, actor, "error", &text).await
}

// ---------------------------------------------------------------------------
// Hand-off
// ---------------------------------------------------------------------------

/// Does `text` already carry the execution body template?
pub fn is_templated(text: &str) -> bool {
    TEMPLATE_SECTIONS.iter().all(|s| text.contains(s))
}

/// Wrap refinement output into an execution work body. Output that already
/// follows the template passes through unchanged.
pub fn wrap_for_execution(text: &str, refiner: &str) -> String {
    let text = text.trim();
    if is_templated(text) {
        return format!("{text}\n");
    }
    format!(
        "# TASK\n\
         Carry out the instructions produced by {refiner} as an execution task.\n\
         \n\
         # CONTEXT\n\
         - Raw refinement output from {refiner} is attached below.\n\
         \n\
         # REQUIREMENTS\n\
         - Perform the code and documentation work the raw output describes.\n\
         \n\
         # OUTPUT\n\
         - Summary of changes, verification results, suggested next steps.\n\
         \n\
         # NOTES\n\
         ```text\n\
         {text}\n\
         ```\n"
    )
}

/// Per-target override `{target}_{key}`, then `key`, then `default`.
fn handoff_int(meta: &Meta, target: &str, key: &str, default: i64) -> i64 {
    meta.get(&format!("{target}_{key}"))
        .or_else(|| meta.get(key))
        .and_then(Value::as_int)
        .filter(|n| *n > 0)
        .unwrap_or(default)
}

/// Metadata for the work item a refinement run hands to `target`.
pub fn handoff_meta(meta: &Meta, refiner: &str, target: &str) -> Meta {
    let assign = meta
        .get(&format!("{target}_assign"))
        .or_else(|| meta.get("assign"))
        .cloned()
        .unwrap_or_else(|| "@implementer".into());

    let mut front = Meta::new();
    front.insert("kind".into(), "work".into());
    front.insert("thread_id".into(), copy(meta, "thread_id"));
    front.insert("task_id".into(), copy(meta, "task_id"));
    front.insert("from".into(), refiner.into());
    front.insert("to".into(), target.into());
    front.insert("assign".into(), assign);
    front.insert(
        "priority".into(),
        meta.get("priority").cloned().unwrap_or_else(|| "high".into()),
    );
    front.insert("status".into(), "new".into());
    front.insert(
        "timeout_s".into(),
        handoff_int(meta, target, "timeout_s", HANDOFF_DEFAULT_TIMEOUT_S).into(),
    );
    front.insert(
        "max_retries".into(),
        handoff_int(meta, target, "max_retries", HANDOFF_DEFAULT_MAX_RETRIES).into(),
    );
    front.insert(
        "response_lang".into(),
        meta.get("response_lang").cloned().unwrap_or_else(|| "en".into()),
    );
    front.insert("created_at".into(), storage::now_iso().into());
    front
}

/// Queue a new pending work item for `target` carrying `output`.
pub async fn write_handoff(
    layout: &Layout,
    meta: &Meta,
    refiner: &str,
    target: &str,
    output: &str,
) -> Result<PathBuf> {
    let front = handoff_meta(meta, refiner, target);
    let text = frontmatter::render(&front, &wrap_for_execution(output, refiner));
    let stamp = storage::now_stamp();
    let thread_id = meta_str(&front, "thread_id");
    let task_id = meta_str(&front, "task_id");
    storage::create_unique(
        &layout.inbox,
        |n| storage::work_file_name(&stamp, &thread_id, &task_id, n, target),
        &text,
    )
    .await
}

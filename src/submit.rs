//! Work item submission.
//!
//! Creates one pending work item in the inbox with a templated body. Task
//! ids default to a per-thread counter kept in `state/submit_state.json`.
//! The submitter can then look up, or wait for, the terminal document that
//! answers its request.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::executor::ExecutorRegistry;
use crate::frontmatter::{self, Meta};
use crate::index::EntryStatus;
use crate::model::meta_str;
use crate::storage::{self, Layout};

/// Persisted per-thread task counters.
#[derive(Debug, Default, Serialize, Deserialize)]
struct SubmitState {
    #[serde(default)]
    thread_counters: BTreeMap<String, u64>,
}

/// Everything needed to queue one work item.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub text: String,
    pub target: String,
    pub thread_id: String,
    /// Explicit task id; allocated from the thread counter when `None`.
    pub task_id: Option<String>,
    /// Assignee; defaults by target kind when `None`.
    pub assign: Option<String>,
    pub priority: String,
    pub timeout_s: u64,
    pub max_retries: u32,
    pub response_lang: String,
    pub notes: Option<String>,
}

impl SubmitRequest {
    pub fn new(text: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            target: target.into(),
            thread_id: "manual".to_string(),
            task_id: None,
            assign: None,
            priority: "high".to_string(),
            timeout_s: 240,
            max_retries: 3,
            response_lang: "en".to_string(),
            notes: None,
        }
    }
}

/// A queued work item and who is expected to answer it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submitted {
    pub path: PathBuf,
    pub thread_id: String,
    pub task_id: String,
    pub target: String,
    /// Actor whose terminal document is the final answer: the hand-off
    /// target when `target` refines, otherwise `target` itself.
    pub expected_actor: String,
    /// Processing cycles needed before that document can exist.
    pub cycles: usize,
}

/// Terminal document found for a submitted item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalResult {
    pub status: EntryStatus,
    pub path: PathBuf,
}

impl FinalResult {
    pub fn label(&self) -> &'static str {
        match self.status {
            EntryStatus::Done => "done",
            EntryStatus::Error => "error",
        }
    }
}

/// Increment and return the next task id for `thread_id`, zero-padded to
/// four digits.
pub async fn next_task_id(state_path: &Path, thread_id: &str) -> Result<String> {
    let mut state: SubmitState = storage::load_json_or_default(state_path).await;
    let counter = state.thread_counters.entry(thread_id.to_string()).or_insert(0);
    *counter += 1;
    let id = format!("{:04}", *counter);
    storage::save_json(state_path, &state).await?;
    Ok(id)
}

/// Templated work body for `target`.
pub fn build_body(target: &str, refinement: bool, text: &str, notes: Option<&str>) -> String {
    let requirement = if refinement {
        "- Turn this into a work body the execution agent can run directly."
    } else {
        "- Produce results in an actionable form."
    };
    let mut body = format!(
        "# TASK\n{}\n\n\
         # CONTEXT\n\
         - submitted_by: bridge submit\n\
         - target: {target}\n\n\
         # REQUIREMENTS\n\
         {requirement}\n\n\
         # OUTPUT\n\
         - Organize the answer as RESULT, TEST, NEXT.\n",
        text.trim()
    );
    if let Some(notes) = notes.map(str::trim).filter(|n| !n.is_empty()) {
        body.push_str(&format!("\n# NOTES\n{notes}\n"));
    }
    body
}

/// Queue `request` as a new pending work item.
pub async fn submit(layout: &Layout, registry: &ExecutorRegistry, request: SubmitRequest) -> Result<Submitted> {
    let text = request.text.trim();
    if text.is_empty() {
        return Err(Error::Other("instruction text is empty".to_string()));
    }
    let target = request.target.trim().to_lowercase();
    let Some(executor) = registry.get(&target) else {
        let known: Vec<&str> = registry.targets().collect();
        return Err(Error::Config(format!(
            "unknown target {target}; expected one of {}",
            known.join(", ")
        )));
    };
    let handoff = executor.handoff_target().map(str::to_string);
    let refinement = handoff.is_some();

    layout.ensure().await?;

    let thread_id = match request.thread_id.trim() {
        "" => "manual".to_string(),
        t => t.to_string(),
    };
    let task_id = match request.task_id.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => next_task_id(&layout.submit_state_path(), &thread_id).await?,
    };
    let assign = match request.assign.as_deref().map(str::trim) {
        Some(a) if !a.is_empty() => a.to_string(),
        _ if refinement => "@planner".to_string(),
        _ => "@implementer".to_string(),
    };

    let mut meta = Meta::new();
    meta.insert("kind".into(), "work".into());
    meta.insert("thread_id".into(), thread_id.as_str().into());
    meta.insert("task_id".into(), task_id.as_str().into());
    meta.insert("from".into(), "human".into());
    meta.insert("to".into(), target.as_str().into());
    meta.insert("assign".into(), assign.into());
    meta.insert("priority".into(), request.priority.into());
    meta.insert("status".into(), "new".into());
    meta.insert("timeout_s".into(), request.timeout_s.into());
    meta.insert("max_retries".into(), request.max_retries.into());
    meta.insert("response_lang".into(), request.response_lang.into());
    meta.insert("created_at".into(), storage::now_iso().into());

    let body = build_body(&target, refinement, text, request.notes.as_deref());
    let stamp = storage::now_stamp();
    let path = storage::create_unique(
        &layout.inbox,
        |n| storage::work_file_name(&stamp, &thread_id, &task_id, n, &target),
        &frontmatter::render(&meta, &body),
    )
    .await?;
    info!(path = %path.display(), thread_id = %thread_id, task_id = %task_id, target = %target, "work item submitted");

    Ok(Submitted {
        path,
        cycles: if refinement { 2 } else { 1 },
        expected_actor: handoff.unwrap_or_else(|| target.clone()),
        thread_id,
        task_id,
        target,
    })
}

/// Newest terminal document for `(thread_id, task_id)` written by `actor`.
///
/// Results in `done/` win over error documents in `error/`. Files that do
/// not parse are skipped.
pub async fn find_result(
    layout: &Layout,
    thread_id: &str,
    task_id: &str,
    actor: &str,
) -> Result<Option<FinalResult>> {
    for (dir, suffix, status) in [
        (&layout.done, ".result.md", EntryStatus::Done),
        (&layout.error, ".error.md", EntryStatus::Error),
    ] {
        for path in storage::list_by_suffix(dir, suffix).await?.into_iter().rev() {
            let Ok(text) = tokio::fs::read_to_string(&path).await else {
                continue;
            };
            let Ok((meta, _)) = frontmatter::parse(&text) else {
                continue;
            };
            if meta_str(&meta, "thread_id") == thread_id
                && meta_str(&meta, "task_id") == task_id
                && meta_str(&meta, "from") == actor
            {
                return Ok(Some(FinalResult { status, path }));
            }
        }
    }
    Ok(None)
}

/// Poll [`find_result`] for `submitted` every `poll` until a terminal
/// document shows up or `timeout` elapses.
pub async fn wait_for_result(
    layout: &Layout,
    submitted: &Submitted,
    timeout: Duration,
    poll: Duration,
) -> Result<Option<FinalResult>> {
    let deadline = Instant::now() + timeout;
    loop {
        let found = find_result(
            layout,
            &submitted.thread_id,
            &submitted.task_id,
            &submitted.expected_actor,
        )
        .await?;
        if found.is_some() {
            return Ok(found);
        }
        if Instant::now() >= deadline {
            debug!(thread_id = %submitted.thread_id, task_id = %submitted.task_id, "no final result before deadline");
            return Ok(None);
        }
        tokio::time::sleep(poll).await;
    }
}

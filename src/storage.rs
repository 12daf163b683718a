//! Filesystem queue storage.
//!
//! The queue is a set of stage directories under `{root}/bridge/`. Items
//! move between stages by rename, which is the only cross-process exclusion
//! primitive. It is atomic only on a single local POSIX filesystem; network
//! filesystems are unsupported.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Suffix of pending work item files.
pub const WORK_SUFFIX: &str = ".work.md";

/// Highest disambiguator tried before giving up on a unique file name.
const MAX_DISAMBIGUATOR: u32 = 999;

const MAX_SLUG_LEN: usize = 48;

/// Queue stage directories.
#[derive(Debug, Clone)]
pub struct Layout {
    pub base: PathBuf,
    /// Pending items.
    pub inbox: PathBuf,
    /// Claimed items being processed.
    pub inprogress: PathBuf,
    pub done: PathBuf,
    pub error: PathBuf,
    /// Per-attempt executor output.
    pub logs: PathBuf,
    /// Index, health snapshot, submission counters.
    pub state: PathBuf,
}

impl Layout {
    /// Layout rooted at `{root}/bridge`. Does not touch the filesystem.
    pub fn new(root: &Path) -> Self {
        let base = root.join("bridge");
        Self {
            inbox: base.join("inbox"),
            inprogress: base.join("inprogress"),
            done: base.join("done"),
            error: base.join("error"),
            logs: base.join("logs"),
            state: base.join("state"),
            base,
        }
    }

    /// Create every stage directory.
    pub async fn ensure(&self) -> Result<()> {
        for dir in [
            &self.inbox,
            &self.inprogress,
            &self.done,
            &self.error,
            &self.logs,
            &self.state,
        ] {
            tokio::fs::create_dir_all(dir).await?;
        }
        Ok(())
    }

    pub fn index_path(&self) -> PathBuf {
        self.state.join("processed_index.json")
    }

    pub fn health_path(&self) -> PathBuf {
        self.state.join("health.json")
    }

    pub fn submit_state_path(&self) -> PathBuf {
        self.state.join("submit_state.json")
    }

    /// `{stem}.attempt{N}.{stream}.log` in the logs stage.
    pub fn attempt_log_path(&self, stem: &str, attempt: u32, stream: &str) -> PathBuf {
        self.logs.join(format!("{stem}.attempt{attempt}.{stream}.log"))
    }
}

// ---------------------------------------------------------------------------
// Naming
// ---------------------------------------------------------------------------

/// Compact UTC stamp used as the sortable file name prefix.
pub fn now_stamp() -> String {
    Utc::now().format("%Y%m%dT%H%M%SZ").to_string()
}

/// RFC 3339 UTC timestamp for metadata.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

fn disambiguated(n: u32) -> String {
    if n == 0 {
        String::new()
    } else {
        format!("_{n:03}")
    }
}

/// File-name-safe form of an identity component.
///
/// Lower-cases, collapses every run of characters outside `[a-z0-9._-]`
/// into one `-`, strips leading and trailing `-` and `.`, and truncates to
/// 48 bytes. Falls back to `x` when nothing is left. Only names are
/// slugged; frontmatter and index keys keep the raw value.
pub fn slugify(value: &str) -> String {
    let mut slug = String::with_capacity(value.len());
    for c in value.trim().to_lowercase().chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-') {
            slug.push(c);
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    while slug.contains("--") {
        slug = slug.replace("--", "-");
    }
    let slug = slug.trim_matches(|c| c == '-' || c == '.');
    if slug.is_empty() {
        return "x".to_string();
    }
    slug.chars().take(MAX_SLUG_LEN).collect()
}

/// Pending item name: `{stamp}_{thread}_{task}[_{n}]_to_{target}.work.md`.
pub fn work_file_name(stamp: &str, thread_id: &str, task_id: &str, n: u32, target: &str) -> String {
    format!(
        "{stamp}_{}_{}{}_to_{}{WORK_SUFFIX}",
        slugify(thread_id),
        slugify(task_id),
        disambiguated(n),
        slugify(target),
    )
}

/// Terminal document name: `{stamp}_{thread}_{task}[_{n}]_from_{actor}.{kind}.md`.
pub fn document_file_name(
    stamp: &str,
    thread_id: &str,
    task_id: &str,
    n: u32,
    actor: &str,
    kind: &str,
) -> String {
    format!(
        "{stamp}_{}_{}{}_from_{}.{kind}.md",
        slugify(thread_id),
        slugify(task_id),
        disambiguated(n),
        slugify(actor),
    )
}

/// Hidden scratch path in `dir`. Never matches [`WORK_SUFFIX`], so a
/// half-written file is invisible to claimers.
fn scratch_path(dir: &Path) -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    dir.join(format!(".tmp-{}-{seq}", std::process::id()))
}

async fn write_synced(path: &Path, contents: &[u8]) -> Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(contents).await?;
    file.sync_data().await?;
    Ok(())
}

/// Write `contents` to a new file in `dir`, never replacing an existing one.
///
/// The contents are written and synced under a scratch name first, then
/// published by hard link, which fails if the name is taken. `name` is
/// called with disambiguator 0, 1, 2, ... until a name is free. A file is
/// therefore complete from the moment it appears under its final name.
pub async fn create_unique(
    dir: &Path,
    name: impl Fn(u32) -> String,
    contents: &str,
) -> Result<PathBuf> {
    let scratch = scratch_path(dir);
    if let Err(e) = write_synced(&scratch, contents.as_bytes()).await {
        let _ = tokio::fs::remove_file(&scratch).await;
        return Err(e);
    }

    let mut published = None;
    for n in 0..=MAX_DISAMBIGUATOR {
        let path = dir.join(name(n));
        match tokio::fs::hard_link(&scratch, &path).await {
            Ok(()) => {
                published = Some(Ok(path));
                break;
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => {
                published = Some(Err(e.into()));
                break;
            }
        }
    }
    let _ = tokio::fs::remove_file(&scratch).await;

    published.unwrap_or_else(|| {
        Err(Error::Other(format!(
            "unable to allocate a unique file name in {}",
            dir.display()
        )))
    })
}

/// Write a file atomically: scratch file in the same directory, then rename.
pub async fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or(Path::new("."));
    tokio::fs::create_dir_all(parent).await?;
    let tmp = scratch_path(parent);

    if let Err(e) = write_synced(&tmp, contents).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

/// Load a JSON file, falling back to `T::default()` when it is missing or
/// cannot be decoded.
pub async fn load_json_or_default<T>(path: &Path) -> T
where
    T: serde::de::DeserializeOwned + Default,
{
    match tokio::fs::read_to_string(path).await {
        Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "unreadable state file, using default");
            T::default()
        }),
        Err(_) => T::default(),
    }
}

/// Pretty-print `value` and write it atomically with a trailing newline.
pub async fn save_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut text = serde_json::to_string_pretty(value)?;
    text.push('\n');
    atomic_write(path, text.as_bytes()).await
}

// ---------------------------------------------------------------------------
// Claiming
// ---------------------------------------------------------------------------

/// Files in `dir` whose names end with `suffix`, in name order. A missing
/// directory lists as empty.
pub async fn list_by_suffix(dir: &Path, suffix: &str) -> Result<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        if name.to_string_lossy().ends_with(suffix) {
            paths.push(entry.path());
        }
    }
    paths.sort();
    Ok(paths)
}

/// Pending work files, sorted by name (and therefore by stamp).
pub async fn list_pending(inbox: &Path) -> Result<Vec<PathBuf>> {
    list_by_suffix(inbox, WORK_SUFFIX).await
}

/// Move every pending item into the in-flight stage.
///
/// Each move is a rename, so of several routers racing for one file exactly
/// one succeeds. Files that vanish before the rename were claimed elsewhere
/// and are skipped silently.
pub async fn claim_all(pending_dir: &Path, inflight_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut claimed = Vec::new();
    for src in list_pending(pending_dir).await? {
        let Some(name) = src.file_name() else {
            continue;
        };
        let dst = inflight_dir.join(name);
        match tokio::fs::rename(&src, &dst).await {
            Ok(()) => {
                debug!(file = %dst.display(), "claimed");
                claimed.push(dst);
            }
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => warn!(file = %src.display(), error = %e, "claim skipped"),
        }
    }
    Ok(claimed)
}

/// Remove an in-flight file. Absence or removal failure is tolerated: the
/// terminal document, not this file, is the source of truth.
pub async fn remove_inflight(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(file = %path.display(), error = %e, "in-flight cleanup failed"),
    }
}

/// Persist one attempt's stdout and stderr for postmortem.
pub async fn write_attempt_logs(
    layout: &Layout,
    stem: &str,
    attempt: u32,
    target: &str,
    stdout: &str,
    stderr: &str,
) -> Result<()> {
    tokio::fs::create_dir_all(&layout.logs).await?;
    tokio::fs::write(
        layout.attempt_log_path(stem, attempt, &format!("{target}.stdout")),
        stdout,
    )
    .await?;
    tokio::fs::write(
        layout.attempt_log_path(stem, attempt, &format!("{target}.stderr")),
        stderr,
    )
    .await?;
    Ok(())
}

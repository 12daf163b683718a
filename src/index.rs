//! Processed-task index: at-most-once processing per logical task.
//!
//! An in-memory map mirrored to `state/processed_index.json`. Every read and
//! write goes through one mutex, and every commit flushes the whole map
//! before the lock is released, so concurrent workers never lose updates.
//! The lock only serializes access within one process.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::Result;
use crate::model::DedupKey;
use crate::storage;

/// Terminal status recorded for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Done,
    Error,
}

/// What the index remembers about a processed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub status: EntryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// When the entry was recorded (RFC 3339).
    pub at: String,
    /// The work item file the outcome came from.
    pub source: String,
    /// The terminal document produced.
    pub output: String,
    /// Hand-off work item created by a refinement run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub followup: Option<String>,
}

/// On-disk shape of the index file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexFile {
    #[serde(default)]
    processed: BTreeMap<DedupKey, IndexEntry>,
}

#[derive(Debug, Default)]
struct IndexState {
    file: IndexFile,
    /// Keys currently being processed in this process.
    reserved: HashSet<DedupKey>,
}

/// Mutex-guarded processed index.
#[derive(Debug)]
pub struct DedupIndex {
    path: PathBuf,
    state: Mutex<IndexState>,
}

impl DedupIndex {
    /// Load the index from disk. A missing or corrupt file starts empty.
    pub async fn load(path: &Path) -> Self {
        let file: IndexFile = storage::load_json_or_default(path).await;
        debug!(path = %path.display(), entries = file.processed.len(), "index loaded");
        Self {
            path: path.to_path_buf(),
            state: Mutex::new(IndexState {
                file,
                reserved: HashSet::new(),
            }),
        }
    }

    /// Has a terminal outcome already been committed for `key`?
    pub async fn is_duplicate(&self, key: &DedupKey) -> bool {
        self.state.lock().await.file.processed.contains_key(key)
    }

    /// Claim `key` for processing in this process.
    ///
    /// Returns `false` when the key is already committed or another worker
    /// holds it, in which case the caller must treat the item as a duplicate.
    pub async fn reserve(&self, key: &DedupKey) -> bool {
        let mut state = self.state.lock().await;
        if state.file.processed.contains_key(key) {
            return false;
        }
        state.reserved.insert(key.clone())
    }

    /// Give up a reservation without committing.
    pub async fn release(&self, key: &DedupKey) {
        self.state.lock().await.reserved.remove(key);
    }

    /// Record the terminal outcome for `key` and flush to disk.
    ///
    /// Insert-if-absent: an existing entry is never overwritten. Returns
    /// whether this call inserted the entry.
    pub async fn commit(&self, key: &DedupKey, entry: IndexEntry) -> Result<bool> {
        let mut state = self.state.lock().await;
        state.reserved.remove(key);
        if state.file.processed.contains_key(key) {
            return Ok(false);
        }
        state.file.processed.insert(key.clone(), entry);
        storage::save_json(&self.path, &state.file).await?;
        Ok(true)
    }

    pub async fn get(&self, key: &DedupKey) -> Option<IndexEntry> {
        self.state.lock().await.file.processed.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.file.processed.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

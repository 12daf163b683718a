//! Executor contract and registry.
//!
//! An executor is a pluggable collaborator that attempts a work item's
//! instructions once and reports an [`ExecutorResult`]. The work item's `to`
//! field selects the executor by name; the registered names are the set of
//! valid targets.

pub mod command;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::frontmatter::Meta;
use crate::model::ExecutorResult;

pub use command::{CommandExecutor, ExecutorSpec, OutputFormat};

/// One executor variant.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Target name work items use in their `to` field.
    fn name(&self) -> &str;

    /// For a refinement variant, the execution target its output is handed
    /// to as a new work item. `None` for variants that complete work.
    fn handoff_target(&self) -> Option<&str> {
        None
    }

    /// Error codes this variant considers transient.
    fn retryable_errors(&self) -> &[String];

    /// Should a failed attempt be retried?
    fn is_retryable(&self, result: &ExecutorResult) -> bool {
        match result.error_code.as_deref() {
            Some(code) => result.can_retry && self.retryable_errors().iter().any(|c| c == code),
            None => false,
        }
    }

    /// Attempt the work once, bounded by `timeout_s`.
    async fn execute(&self, meta: &Meta, body: &str, timeout_s: u64, attempt: u32)
    -> ExecutorResult;
}

/// Registry of executors, indexed by target name.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: BTreeMap<String, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    /// Create an empty registry with no executors.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The two bundled variants: `codex` executes, `gemini` refines and
    /// hands off to `codex`. Both run in `root`.
    pub fn builtin(root: &Path) -> Self {
        let mut registry = Self::empty();
        for spec in [ExecutorSpec::codex(), ExecutorSpec::gemini()] {
            registry.insert(Arc::new(CommandExecutor::new(spec, root)));
        }
        registry
    }

    /// Load all `.toml` files from a directory and build the registry.
    ///
    /// Relative executor working directories resolve against `root`.
    pub fn load_from_dir(dir: &Path, root: &Path) -> Result<Self> {
        let mut registry = Self::empty();

        let entries = std::fs::read_dir(dir).map_err(|e| {
            Error::Config(format!("cannot read executor dir {}: {e}", dir.display()))
        })?;

        let mut paths: Vec<_> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "toml"))
            .collect();
        paths.sort();

        for path in paths {
            let spec = ExecutorSpec::from_file(&path)?;
            registry.insert(Arc::new(CommandExecutor::new(spec, root)));
        }

        registry.check_handoffs()?;
        Ok(registry)
    }

    /// Register an executor under its own name, replacing any previous one.
    pub fn insert(&mut self, executor: Arc<dyn Executor>) {
        self.executors
            .insert(executor.name().to_lowercase(), executor);
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with(mut self, executor: Arc<dyn Executor>) -> Self {
        self.insert(executor);
        self
    }

    /// Every hand-off target must itself be registered.
    pub fn check_handoffs(&self) -> Result<()> {
        for executor in self.executors.values() {
            if let Some(target) = executor.handoff_target() {
                if !self.executors.contains_key(&target.to_lowercase()) {
                    return Err(Error::Config(format!(
                        "executor {} hands off to unknown target {target}",
                        executor.name()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Look up an executor by target name.
    pub fn get(&self, target: &str) -> Option<&Arc<dyn Executor>> {
        self.executors.get(&target.trim().to_lowercase())
    }

    /// Registered target names.
    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.executors.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("targets", &self.executors.keys().collect::<Vec<_>>())
            .finish()
    }
}

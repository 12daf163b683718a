//! Subprocess executor configured from TOML.
//!
//! Runs an external program with a prompt built from the work item, bounded
//! by a wall-clock timeout, and classifies the outcome into error codes the
//! retry controller understands.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};

use super::Executor;
use crate::error::{Error, Result};
use crate::frontmatter::Meta;
use crate::model::{ErrorStage, ExecutorResult, codes, meta_str};

const PROMPT_PLACEHOLDER: &str = "{prompt}";
const DEFAULT_PROFILE: &str = "@implementer";
const AUTH_MARKERS: [&str; 3] = ["401 unauthorized", "missing bearer", "authentication"];
const STREAM_DISCONNECT_MARKER: &str = "stream disconnected";

/// How the program reports its answer on stdout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// Plain text; the trimmed stdout is the answer.
    #[default]
    Text,
    /// One JSON event per line; agent messages are the answer and error
    /// events are transport or auth failures.
    JsonEvents,
}

/// Top-level TOML wrapper.
#[derive(Debug, Deserialize)]
struct ExecutorFile {
    executor: ExecutorSpec,
}

/// An executor definition.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorSpec {
    /// Target name used in work items' `to` field.
    pub name: String,
    pub program: String,
    /// Arguments; `{prompt}` is substituted, otherwise the prompt is appended.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub output: OutputFormat,
    /// Error codes worth another attempt.
    #[serde(default)]
    pub retryable: Vec<String>,
    /// Execution target this variant's output is handed to.
    #[serde(default)]
    pub handoff_to: Option<String>,
    /// Opening instructions of every prompt.
    #[serde(default)]
    pub preamble: String,
    /// Extra instructions keyed by the work item's `assign`.
    #[serde(default)]
    pub profiles: BTreeMap<String, String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Working directory; relative paths resolve against the router root.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

impl ExecutorSpec {
    /// Parse a single executor TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let file: ExecutorFile = toml::from_str(&content).map_err(|e| {
            Error::Config(format!("bad executor config {}: {e}", path.display()))
        })?;
        Ok(file.executor)
    }

    /// Bundled execution variant.
    pub fn codex() -> Self {
        Self {
            name: "codex".to_string(),
            program: "codex".to_string(),
            args: [
                "exec",
                "--json",
                "--ephemeral",
                "--skip-git-repo-check",
                "--full-auto",
                PROMPT_PLACEHOLDER,
            ]
            .map(String::from)
            .to_vec(),
            output: OutputFormat::JsonEvents,
            retryable: [
                codes::TIMEOUT,
                codes::STREAM_DISCONNECTED,
                codes::EXEC_ERROR,
                codes::NON_ZERO,
            ]
            .map(String::from)
            .to_vec(),
            handoff_to: None,
            preamble: "Process the provided work file and return actionable results concisely.\n\
                       Keep the response sections in the order RESULT, TEST, NEXT.\n\
                       Skip introductions and meta commentary."
                .to_string(),
            profiles: profiles(&[
                ("@planner", "You are the architect and reviewer. Focus on analysis and keep code changes minimal."),
                ("@implementer", "You are the implementer. Propose concrete code changes and how to verify them."),
                ("@qa", "You are QA. Check testability, regression risk, and failing edge cases first."),
            ]),
            env: BTreeMap::new(),
            working_dir: None,
        }
    }

    /// Bundled refinement variant. Turns a request into a structured work
    /// body for `codex`.
    pub fn gemini() -> Self {
        Self {
            name: "gemini".to_string(),
            program: "gemini".to_string(),
            args: [
                "-p",
                PROMPT_PLACEHOLDER,
                "--approval-mode",
                "yolo",
                "--output-format",
                "text",
            ]
            .map(String::from)
            .to_vec(),
            output: OutputFormat::Text,
            retryable: [codes::TIMEOUT, codes::EXEC_ERROR, codes::NON_ZERO]
                .map(String::from)
                .to_vec(),
            handoff_to: Some("codex".to_string()),
            preamble: "Convert the request below into a work body the execution agent can run directly.\n\
                       Output only the markdown body, never frontmatter.\n\
                       Use the sections '# TASK', '# CONTEXT', '# REQUIREMENTS', '# OUTPUT', '# NOTES' in that order.\n\
                       Skip introductions, apologies, and meta commentary."
                .to_string(),
            profiles: profiles(&[
                ("@planner", "You plan and review. Write clear, conservative execution instructions."),
                ("@implementer", "You write implementation instructions the execution agent can act on immediately."),
                ("@qa", "You plan QA. Put test perspectives and verification conditions first."),
            ]),
            env: BTreeMap::new(),
            working_dir: None,
        }
    }
}

fn profiles(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

/// Executor that shells out to an external program.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    spec: ExecutorSpec,
    working_dir: PathBuf,
}

impl CommandExecutor {
    /// `root` is the directory the program runs in unless the definition
    /// names another.
    pub fn new(spec: ExecutorSpec, root: &Path) -> Self {
        let working_dir = match &spec.working_dir {
            Some(dir) if dir.is_relative() => root.join(dir),
            Some(dir) => dir.clone(),
            None => root.to_path_buf(),
        };
        Self { spec, working_dir }
    }

    /// Build the prompt handed to the program.
    pub fn build_prompt(&self, meta: &Meta, body: &str) -> String {
        let assign = meta
            .get("assign")
            .map(|v| v.to_string())
            .unwrap_or_else(|| DEFAULT_PROFILE.to_string());
        let profile = self
            .spec
            .profiles
            .get(&assign)
            .or_else(|| self.spec.profiles.get(DEFAULT_PROFILE));
        let lang = meta
            .get("response_lang")
            .map(|v| v.to_string().trim().to_lowercase());

        let mut prompt = String::new();
        for part in [profile.map(String::as_str), Some(self.spec.preamble.as_str())]
            .into_iter()
            .flatten()
            .filter(|p| !p.is_empty())
        {
            prompt.push_str(part.trim_end());
            prompt.push('\n');
        }
        match lang.as_deref() {
            Some("en") => prompt.push_str("Write all content in English.\n"),
            Some("ko") => prompt.push_str("Write all content in Korean.\n"),
            Some(other) if !other.is_empty() => {
                prompt.push_str(&format!("Write all content in the language '{other}'.\n"));
            }
            _ => {}
        }

        prompt.push_str("\n[META]\n");
        for key in ["thread_id", "task_id", "assign", "response_lang", "priority"] {
            prompt.push_str(&format!("{key}={}\n", meta_str(meta, key)));
        }
        prompt.push_str("\n[WORK]\n");
        prompt.push_str(body.trim());
        prompt.push('\n');
        prompt
    }

    fn command(&self, prompt: &str) -> Command {
        let mut args: Vec<String> = self
            .spec
            .args
            .iter()
            .map(|a| a.replace(PROMPT_PLACEHOLDER, prompt))
            .collect();
        if !self.spec.args.iter().any(|a| a.contains(PROMPT_PLACEHOLDER)) {
            args.push(prompt.to_string());
        }

        let mut cmd = Command::new(&self.spec.program);
        cmd.args(&args)
            .current_dir(&self.working_dir)
            .envs(&self.spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn handoff_target(&self) -> Option<&str> {
        self.spec.handoff_to.as_deref()
    }

    fn retryable_errors(&self) -> &[String] {
        &self.spec.retryable
    }

    async fn execute(
        &self,
        meta: &Meta,
        body: &str,
        timeout_s: u64,
        attempt: u32,
    ) -> ExecutorResult {
        let start = Instant::now();
        let elapsed = || start.elapsed().as_millis() as u64;
        let prompt = self.build_prompt(meta, body);

        debug!(
            executor = %self.spec.name,
            program = %self.spec.program,
            attempt,
            timeout_s,
            "running executor"
        );

        let child = match self.command(&prompt).spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return ExecutorResult::failure(
                    format!("{}_not_found", self.spec.name),
                    ErrorStage::Precheck,
                    false,
                    format!("{} binary not found in PATH", self.spec.program),
                    attempt,
                )
                .with_elapsed_ms(elapsed());
            }
            Err(e) => {
                return ExecutorResult::failure(
                    codes::EXEC_ERROR,
                    ErrorStage::Exec,
                    true,
                    e.to_string(),
                    attempt,
                )
                .with_elapsed_ms(elapsed());
            }
        };

        let limit = Duration::from_secs(timeout_s);
        let output = match tokio::time::timeout(limit, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return ExecutorResult::failure(
                    codes::EXEC_ERROR,
                    ErrorStage::Exec,
                    true,
                    e.to_string(),
                    attempt,
                )
                .with_elapsed_ms(elapsed());
            }
            Err(_) => {
                warn!(executor = %self.spec.name, attempt, timeout_s, "executor timed out");
                return ExecutorResult::failure(
                    codes::TIMEOUT,
                    ErrorStage::Exec,
                    true,
                    format!("no result within {timeout_s}s"),
                    attempt,
                )
                .with_elapsed_ms(elapsed());
            }
        };

        let raw_stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        classify(
            self.spec.output,
            output.status.code(),
            raw_stdout,
            stderr,
            attempt,
        )
        .with_elapsed_ms(elapsed())
    }
}

/// Collect agent messages and error events from a JSON event stream.
///
/// Lines that are not JSON are ignored.
pub fn parse_json_events(text: &str) -> (String, Vec<String>) {
    let mut messages = Vec::new();
    let mut errors = Vec::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let Ok(event) = serde_json::from_str::<serde_json::Value>(line) else {
            continue;
        };
        match event.get("type").and_then(|t| t.as_str()) {
            Some("item.completed") => {
                let item = &event["item"];
                if item.get("type").and_then(|t| t.as_str()) == Some("agent_message") {
                    let msg = item.get("text").and_then(|t| t.as_str()).unwrap_or("").trim();
                    if !msg.is_empty() {
                        messages.push(msg.to_string());
                    }
                }
            }
            Some("error") => {
                let msg = event
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("")
                    .trim();
                if !msg.is_empty() {
                    errors.push(msg.to_string());
                }
            }
            _ => {}
        }
    }
    (messages.join("\n\n").trim().to_string(), errors)
}

fn has_auth_error(messages: &[String], stderr: &str) -> bool {
    let text = format!("{}\n{stderr}", messages.join("\n")).to_lowercase();
    AUTH_MARKERS.iter().any(|m| text.contains(m))
}

fn join_errors(stderr: &str, stream_errors: &[String]) -> String {
    if stream_errors.is_empty() {
        stderr.to_string()
    } else if stderr.is_empty() {
        stream_errors.join("\n")
    } else {
        format!("{stderr}\n{}", stream_errors.join("\n"))
    }
}

/// Turn a finished process into an [`ExecutorResult`].
pub fn classify(
    format: OutputFormat,
    exit_code: Option<i32>,
    raw_stdout: String,
    stderr: String,
    attempt: u32,
) -> ExecutorResult {
    let failed = |code: &str, stage: ErrorStage, can_retry: bool, stdout: &str, stderr: String| {
        ExecutorResult::failure(code, stage, can_retry, stderr, attempt)
            .with_exit_code(exit_code)
            .with_output(stdout, raw_stdout.clone())
    };

    let stdout = match format {
        OutputFormat::Text => raw_stdout.trim().to_string(),
        OutputFormat::JsonEvents => {
            let (stdout, stream_errors) = parse_json_events(&raw_stdout);
            if has_auth_error(&stream_errors, &stderr) {
                let stderr = join_errors(&stderr, &stream_errors);
                return failed(codes::AUTH_FAILED, ErrorStage::Auth, false, &stdout, stderr);
            }
            let disconnected = stream_errors
                .iter()
                .chain([&stderr, &stdout])
                .any(|m| m.to_lowercase().contains(STREAM_DISCONNECT_MARKER));
            if disconnected {
                let stderr = join_errors(&stderr, &stream_errors);
                return failed(
                    codes::STREAM_DISCONNECTED,
                    ErrorStage::ResponseStream,
                    true,
                    &stdout,
                    stderr,
                );
            }
            stdout
        }
    };

    if exit_code != Some(0) {
        if has_auth_error(&[], &stderr) {
            return failed(codes::AUTH_FAILED, ErrorStage::Auth, false, &stdout, stderr);
        }
        return failed(codes::NON_ZERO, ErrorStage::Exec, true, &stdout, stderr);
    }

    if stdout.is_empty() {
        return failed(codes::EMPTY_OUTPUT, ErrorStage::Postprocess, false, &stdout, stderr);
    }

    ExecutorResult::success(stdout.clone(), attempt)
        .with_exit_code(exit_code)
        .with_output(stdout, raw_stdout)
        .with_stderr(stderr)
}

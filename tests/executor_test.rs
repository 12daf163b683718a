//! Integration tests for subprocess executors and the executor registry.
//!
//! These shell out to `sh`, `echo`, and `sleep`, which every POSIX host has.

mod common;

use std::path::{Path, PathBuf};

use bridge_router::engine::ItemOutcome;
use bridge_router::executor::{CommandExecutor, Executor, ExecutorRegistry, ExecutorSpec, OutputFormat};
use bridge_router::frontmatter::{Meta, Value};
use bridge_router::model::{ErrorStage, codes};

use common::*;

fn fixtures_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("fixtures/executors")
}

fn shell(name: &str, script: &str) -> ExecutorSpec {
    ExecutorSpec {
        name: name.to_string(),
        program: "sh".to_string(),
        args: vec!["-c".to_string(), script.to_string(), name.to_string(), "{prompt}".to_string()],
        output: OutputFormat::Text,
        retryable: vec![codes::TIMEOUT.to_string(), codes::NON_ZERO.to_string()],
        handoff_to: None,
        preamble: String::new(),
        profiles: Default::default(),
        env: Default::default(),
        working_dir: None,
    }
}

fn meta() -> Meta {
    work_meta("t", "0001", "sh")
}

#[tokio::test]
async fn successful_command_returns_trimmed_stdout() {
    let dir = tempfile::tempdir().unwrap();
    let executor = CommandExecutor::new(shell("sh", "echo '  all good  '"), dir.path());

    let result = executor.execute(&meta(), "body", 5, 1).await;

    assert!(result.ok, "{result:?}");
    assert_eq!(result.stdout, "all good");
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.retry_count, 1);
}

#[tokio::test]
async fn prompt_is_substituted_into_arguments() {
    let dir = tempfile::tempdir().unwrap();
    let executor = CommandExecutor::new(shell("sh", "printf '%s' \"$1\""), dir.path());

    let result = executor.execute(&meta(), "Fix the parser.", 5, 1).await;

    assert!(result.ok, "{result:?}");
    assert!(result.stdout.contains("[META]\nthread_id=t\ntask_id=0001"));
    assert!(result.stdout.contains("[WORK]\nFix the parser."));
    assert!(result.stdout.contains("Write all content in English."));
}

#[tokio::test]
async fn non_zero_exit_is_retryable() {
    let dir = tempfile::tempdir().unwrap();
    let executor = CommandExecutor::new(shell("sh", "echo boom >&2; exit 3"), dir.path());

    let result = executor.execute(&meta(), "body", 5, 2).await;

    assert!(!result.ok);
    assert_eq!(result.error_code.as_deref(), Some(codes::NON_ZERO));
    assert_eq!(result.error_stage, Some(ErrorStage::Exec));
    assert_eq!(result.exit_code, Some(3));
    assert_eq!(result.stderr.trim(), "boom");
    assert_eq!(result.retry_count, 2);
    assert!(executor.is_retryable(&result));
}

#[tokio::test]
async fn rejected_credentials_are_not_retried() {
    let dir = tempfile::tempdir().unwrap();
    let executor = CommandExecutor::new(shell("sh", "echo 'HTTP 401 Unauthorized' >&2; exit 1"), dir.path());

    let result = executor.execute(&meta(), "body", 5, 1).await;

    assert_eq!(result.error_code.as_deref(), Some(codes::AUTH_FAILED));
    assert_eq!(result.error_stage, Some(ErrorStage::Auth));
    assert_eq!(result.exit_code, Some(1));
    assert!(!executor.is_retryable(&result));
}

#[tokio::test]
async fn slow_command_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let executor = CommandExecutor::new(shell("sh", "sleep 5; echo late"), dir.path());

    let started = std::time::Instant::now();
    let result = executor.execute(&meta(), "body", 1, 1).await;

    assert!(started.elapsed() < std::time::Duration::from_secs(4));
    assert_eq!(result.error_code.as_deref(), Some(codes::TIMEOUT));
    assert!(result.stdout.is_empty());
    assert!(result.can_retry);
}

#[tokio::test]
async fn missing_binary_is_a_precheck_failure() {
    let dir = tempfile::tempdir().unwrap();
    let mut spec = shell("ghost", "");
    spec.program = "bridge-router-test-no-such-binary".to_string();
    let executor = CommandExecutor::new(spec, dir.path());

    let result = executor.execute(&meta(), "body", 5, 1).await;

    assert_eq!(result.error_code.as_deref(), Some("ghost_not_found"));
    assert_eq!(result.error_stage, Some(ErrorStage::Precheck));
    assert!(!executor.is_retryable(&result));
}

#[tokio::test]
async fn json_event_output_yields_agent_messages() {
    let dir = tempfile::tempdir().unwrap();
    let mut spec = shell(
        "sh",
        r#"echo '{"type":"item.completed","item":{"type":"agent_message","text":"patched"}}'"#,
    );
    spec.output = OutputFormat::JsonEvents;
    let executor = CommandExecutor::new(spec, dir.path());

    let result = executor.execute(&meta(), "body", 5, 1).await;

    assert!(result.ok, "{result:?}");
    assert_eq!(result.stdout, "patched");
    assert!(result.raw_stdout.contains("item.completed"));
}

#[tokio::test]
async fn commands_run_in_the_configured_directory() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("work")).unwrap();
    std::fs::write(dir.path().join("work/marker.txt"), "here").unwrap();
    let mut spec = shell("sh", "cat marker.txt");
    spec.working_dir = Some(PathBuf::from("work"));
    let executor = CommandExecutor::new(spec, dir.path());

    let result = executor.execute(&meta(), "body", 5, 1).await;

    assert_eq!(result.stdout, "here");
}

#[test]
fn prompt_uses_assignee_profile() {
    let executor = CommandExecutor::new(ExecutorSpec::codex(), Path::new("."));
    let mut meta = meta();
    meta.insert("assign".into(), Value::from("@qa"));

    let prompt = executor.build_prompt(&meta, "check it");

    assert!(prompt.starts_with("You are QA."));
    assert!(prompt.contains("assign=@qa"));
    assert!(prompt.ends_with("[WORK]\ncheck it\n"));
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[test]
fn builtin_registry_has_execute_and_refine_variants() {
    let registry = ExecutorRegistry::builtin(Path::new("."));

    assert_eq!(registry.targets().collect::<Vec<_>>(), vec!["codex", "gemini"]);
    assert_eq!(registry.get("Codex").unwrap().handoff_target(), None);
    assert_eq!(registry.get("gemini").unwrap().handoff_target(), Some("codex"));
    registry.check_handoffs().unwrap();
}

#[test]
fn registry_loads_fixture_directory() {
    let registry = ExecutorRegistry::load_from_dir(&fixtures_dir(), Path::new(".")).unwrap();

    assert_eq!(registry.len(), 2);
    assert_eq!(registry.get("refine").unwrap().handoff_target(), Some("echo"));
    assert!(registry.get("echo").unwrap().retryable_errors().contains(&"non_zero".to_string()));
}

#[test]
fn dangling_handoff_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("lonely.toml"),
        "[executor]\nname = \"lonely\"\nprogram = \"true\"\nhandoff_to = \"nowhere\"\n",
    )
    .unwrap();

    let err = ExecutorRegistry::load_from_dir(dir.path(), dir.path()).unwrap_err();
    assert!(err.to_string().contains("unknown target nowhere"), "{err}");
}

#[test]
fn malformed_definition_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("bad.toml"), "[executor]\nname = 3\n").unwrap();

    let err = ExecutorRegistry::load_from_dir(dir.path(), dir.path()).unwrap_err();
    assert!(err.to_string().contains("bad executor config"), "{err}");
}

#[tokio::test]
async fn fixture_chain_refines_then_executes() {
    let (dir, layout) = test_layout().await;
    let registry = ExecutorRegistry::load_from_dir(&fixtures_dir(), dir.path()).unwrap();
    let router = test_router(&layout, registry);

    enqueue(&layout, &work_meta("chain", "0001", "refine"), "rename the flag", 0).await;

    let first = router.run_once(1).await.unwrap();
    assert!(matches!(first.outcomes[0], ItemOutcome::Done { followup: Some(_), .. }));
    let pending = files_in(&layout.inbox);
    assert_eq!(pending.len(), 1);
    assert!(pending[0].ends_with("_chain_0001_to_echo.work.md"));

    let second = router.run_once(1).await.unwrap();
    assert_eq!(second.processed, 1);
    let done = files_in(&layout.done);
    let echoed = done.iter().find(|n| n.ends_with("_from_echo.result.md")).unwrap();
    let text = std::fs::read_to_string(layout.done.join(echoed)).unwrap();
    assert!(text.contains("Refined request: rename the flag."));
}

mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bridge_router::executor::ExecutorRegistry;
use bridge_router::frontmatter::Value;
use bridge_router::index::EntryStatus;
use bridge_router::model::ErrorStage;
use bridge_router::submit::{SubmitRequest, find_result, next_task_id, submit, wait_for_result};
use bridge_router::validate::validate;

use common::*;

#[tokio::test]
async fn task_ids_count_per_thread() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("submit_state.json");

    assert_eq!(next_task_id(&state, "a").await.unwrap(), "0001");
    assert_eq!(next_task_id(&state, "a").await.unwrap(), "0002");
    assert_eq!(next_task_id(&state, "b").await.unwrap(), "0001");

    let raw: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&state).unwrap()).unwrap();
    assert_eq!(raw["thread_counters"]["a"], 2);
}

#[tokio::test]
async fn submitted_item_is_valid_and_routable() {
    let (_dir, layout) = test_layout().await;
    let registry = ExecutorRegistry::builtin(Path::new("."));

    let submitted = submit(&layout, &registry, SubmitRequest::new("Add a --dry-run flag", "Codex"))
        .await
        .unwrap();
    let path = submitted.path.clone();
    assert_eq!(submitted.expected_actor, "codex");
    assert_eq!(submitted.cycles, 1);

    let name = path.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.ends_with("_manual_0001_to_codex.work.md"), "{name}");
    assert!(path.starts_with(&layout.inbox));

    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.contains("task_id: \"0001\""));
    let meta = read_meta(&path);
    assert!(validate(&meta, registry.targets()).is_empty());
    assert_eq!(meta["task_id"], Value::from("0001"));
    assert_eq!(meta["assign"], Value::from("@implementer"));
    assert_eq!(meta["timeout_s"], Value::Int(240));
    assert!(text.contains("# TASK\nAdd a --dry-run flag"));
    assert!(text.contains("Produce results in an actionable form."));
}

#[tokio::test]
async fn refinement_target_defaults_to_planner() {
    let (_dir, layout) = test_layout().await;
    let registry = ExecutorRegistry::builtin(Path::new("."));
    let mut request = SubmitRequest::new("Tidy the docs", "gemini");
    request.thread_id = "docs".to_string();
    request.notes = Some("Only the README.".to_string());

    let submitted = submit(&layout, &registry, request).await.unwrap();
    assert_eq!(submitted.expected_actor, "codex");
    assert_eq!(submitted.cycles, 2);

    let path = submitted.path;
    let meta = read_meta(&path);
    assert_eq!(meta["assign"], Value::from("@planner"));
    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.contains("Turn this into a work body"));
    assert!(text.contains("# NOTES\nOnly the README."));
}

#[tokio::test]
async fn explicit_task_id_skips_the_counter() {
    let (_dir, layout) = test_layout().await;
    let registry = ExecutorRegistry::builtin(Path::new("."));
    let mut request = SubmitRequest::new("x", "codex");
    request.task_id = Some("0042".to_string());

    let first = submit(&layout, &registry, request.clone()).await.unwrap().path;
    let second = submit(&layout, &registry, request).await.unwrap().path;

    assert_ne!(first, second);
    assert_eq!(read_meta(&second)["task_id"], Value::from("0042"));
    assert!(!layout.submit_state_path().exists());
}

#[tokio::test]
async fn bad_requests_are_rejected() {
    let (_dir, layout) = test_layout().await;
    let registry = ExecutorRegistry::builtin(Path::new("."));

    let err = submit(&layout, &registry, SubmitRequest::new("x", "claude")).await.unwrap_err();
    assert!(err.to_string().contains("unknown target claude"), "{err}");

    let err = submit(&layout, &registry, SubmitRequest::new("   ", "codex")).await.unwrap_err();
    assert!(err.to_string().contains("empty"), "{err}");

    assert!(files_in(&layout.inbox).is_empty());
}

// ---------------------------------------------------------------------------
// Final results
// ---------------------------------------------------------------------------

#[tokio::test]
async fn refined_request_resolves_to_the_execution_result() {
    let (_dir, layout) = test_layout().await;
    let registry = ExecutorRegistry::empty()
        .with(Arc::new(Scripted::succeeding("planner", "Refined: add the flag.").handing_off_to("runner")))
        .with(Arc::new(Scripted::succeeding("runner", "flag added")));
    let router = test_router(&layout, registry);

    let submitted = submit(&layout, router.registry(), SubmitRequest::new("Add a flag", "planner"))
        .await
        .unwrap();
    assert_eq!(submitted.expected_actor, "runner");

    router.run_once(1).await.unwrap();
    let after_refine = find_result(&layout, &submitted.thread_id, &submitted.task_id, "runner").await.unwrap();
    assert!(after_refine.is_none(), "the refiner's result is not the final answer");

    for _ in 1..submitted.cycles {
        router.run_once(1).await.unwrap();
    }
    let found = wait_for_result(&layout, &submitted, Duration::from_secs(1), Duration::from_millis(10))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.status, EntryStatus::Done);
    assert_eq!(found.label(), "done");
    assert!(found.path.starts_with(&layout.done));
    assert_eq!(read_meta(&found.path)["from"], Value::from("runner"));
}

#[tokio::test]
async fn failed_request_resolves_to_its_error_document() {
    let (_dir, layout) = test_layout().await;
    let registry = ExecutorRegistry::empty()
        .with(Arc::new(Scripted::failing("runner", "runner_not_found", ErrorStage::Precheck, false)));
    let router = test_router(&layout, registry);

    let submitted = submit(&layout, router.registry(), SubmitRequest::new("x", "runner")).await.unwrap();
    router.run_once(1).await.unwrap();

    let found = find_result(&layout, &submitted.thread_id, &submitted.task_id, "runner")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.status, EntryStatus::Error);
    assert!(found.path.starts_with(&layout.error));
}

#[tokio::test]
async fn waiting_without_processing_times_out() {
    let (_dir, layout) = test_layout().await;
    let registry = ExecutorRegistry::builtin(Path::new("."));

    let submitted = submit(&layout, &registry, SubmitRequest::new("x", "codex")).await.unwrap();
    let started = std::time::Instant::now();
    let found = wait_for_result(&layout, &submitted, Duration::from_millis(50), Duration::from_millis(10))
        .await
        .unwrap();

    assert!(found.is_none());
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert_eq!(files_in(&layout.inbox).len(), 1);
}

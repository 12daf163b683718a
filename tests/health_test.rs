mod common;

use std::sync::Arc;

use bridge_router::engine::Router;
use bridge_router::executor::ExecutorRegistry;
use bridge_router::health::{HealthFile, HealthSource, MISSING_HEALTH};
use bridge_router::retry::RetryPolicy;

use common::*;

#[tokio::test]
async fn missing_snapshot_is_unhealthy() {
    let dir = tempfile::tempdir().unwrap();
    let status = HealthFile::new(&dir.path().join("health.json")).status().await;
    assert!(!status.ok);
    assert_eq!(status.reason, MISSING_HEALTH);
}

#[tokio::test]
async fn snapshot_is_read_as_written() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("health.json");

    std::fs::write(&path, r#"{"ok": true, "reason": "ok", "checks": {"codex": "ok"}}"#).unwrap();
    let status = HealthFile::new(&path).status().await;
    assert!(status.ok);
    assert_eq!(status.checks["codex"], "ok");

    std::fs::write(&path, r#"{"ok": false, "reason": "codex_auth_missing"}"#).unwrap();
    let status = HealthFile::new(&path).status().await;
    assert!(!status.ok);
    assert_eq!(status.reason, "codex_auth_missing");
}

#[tokio::test]
async fn unhealthy_without_reason_gets_a_generic_one() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("health.json");
    std::fs::write(&path, r#"{"ok": false}"#).unwrap();

    let status = HealthFile::new(&path).status().await;
    assert_eq!(status.reason, "health_not_ok");
}

#[tokio::test]
async fn garbage_snapshot_is_unhealthy() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("health.json");
    std::fs::write(&path, "ok!").unwrap();

    let status = HealthFile::new(&path).status().await;
    assert!(!status.ok);
    assert!(status.reason.starts_with("invalid_health"));
}

#[tokio::test]
async fn router_reads_snapshot_from_state_dir() {
    let (_dir, layout) = test_layout().await;
    let codex = Arc::new(Scripted::succeeding("codex", "ok"));
    let router = Router::new(
        layout.clone(),
        ExecutorRegistry::empty().with(codex.clone()),
        Arc::new(HealthFile::new(&layout.health_path())),
        RetryPolicy::default(),
    );
    enqueue(&layout, &work_meta("h", "0001", "codex"), "body", 0).await;

    let report = router.run_once(1).await.unwrap();
    assert_eq!(report.blocked.as_deref(), Some(MISSING_HEALTH));
    assert_eq!(files_in(&layout.inbox).len(), 1);

    std::fs::write(layout.health_path(), r#"{"ok": true, "reason": "ok"}"#).unwrap();
    let report = router.run_once(1).await.unwrap();
    assert_eq!(report.blocked, None);
    assert_eq!(report.processed, 1);
    assert_eq!(codex.calls(), 1);
}

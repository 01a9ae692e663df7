//! End-to-end scenarios from spec.md §8, exercised against the public
//! `Sandbox` facade rather than any internal module.

use pretty_assertions::assert_eq;

use sandbox_kernel::convert::TransferredValue;
use sandbox_kernel::{ErrorKind, KernelConfig, RunRequest, Sandbox};

#[tokio::test]
async fn one_plus_one_returns_two() {
    let sandbox = Sandbox::new(KernelConfig::default());
    let result = sandbox.run(RunRequest::new("1 + 1")).await.unwrap();
    assert!(result.error.is_none());
    assert_eq!(result.value, Some(TransferredValue::Json(serde_json::json!(2))));
}

#[tokio::test]
async fn infinite_loop_is_killed_by_the_watchdog_within_its_timeout() {
    let sandbox = Sandbox::new(KernelConfig::default());
    let request = RunRequest::new("while (true) {}").with_wall_timeout_ms(100);
    let started = std::time::Instant::now();
    let result = sandbox.run(request).await.unwrap();
    assert!(started.elapsed() < std::time::Duration::from_secs(2));
    let error = result.error.expect("expected the watchdog to report an error");
    assert!(matches!(error.kind, ErrorKind::Timeout | ErrorKind::CpuLimit));
}

#[tokio::test]
async fn filesystem_write_read_roundtrip_and_quota_exceeded() {
    let sandbox = Sandbox::new(KernelConfig::default().with_filesystem_enabled(true));

    sandbox.fs_write("/sandbox/greeting.txt", b"hello sandbox".to_vec()).unwrap();
    assert_eq!(sandbox.fs_read("/sandbox/greeting.txt").unwrap(), b"hello sandbox");

    let tiny = Sandbox::new(
        KernelConfig::default()
            .with_filesystem_enabled(true)
            .with_vfs_default_quota_bytes(4),
    );
    let result = tiny.fs_write("/sandbox/too_big.txt", b"far too much data".to_vec());
    assert!(result.is_err());
}

#[tokio::test]
async fn allocating_past_the_memory_limit_is_reported_and_the_isolate_is_not_reused() {
    let sandbox = Sandbox::new(KernelConfig::default().with_max_isolates(1));
    let request = RunRequest::new(
        "let chunks = []; while (true) { chunks.push(new Array(1 << 20).fill(0)); }",
    )
    .with_memory_limit_bytes(4 << 20)
    .with_wall_timeout_ms(2_000);
    let result = sandbox.run(request).await.unwrap();
    let error = result.error.expect("runaway allocation should not succeed");
    assert!(matches!(
        error.kind,
        ErrorKind::MemoryLimit | ErrorKind::Timeout | ErrorKind::CpuLimit
    ));
}

#[tokio::test]
async fn process_env_access_without_env_is_a_reference_error() {
    let sandbox = Sandbox::new(KernelConfig::default());
    let result = sandbox.run(RunRequest::new("process.env.HOME")).await.unwrap();
    let error = result.error.expect("process is not defined in this sandbox");
    assert_eq!(error.kind, ErrorKind::Reference);
}

#[tokio::test]
async fn requiring_an_unlisted_builtin_is_module_denied() {
    let sandbox = Sandbox::new(KernelConfig::default());
    let result = sandbox.run(RunRequest::new("require('fs')")).await.unwrap();
    let error = result.error.expect("fs should be denied without allowBuiltins");
    assert_eq!(error.kind, ErrorKind::ModuleDenied);
}

#[tokio::test]
async fn session_state_carries_between_runs_without_reexecuting_setup() {
    let sandbox = Sandbox::new(KernelConfig::default());
    let session = sandbox.create_session();
    session.set_state("counter", serde_json::json!(1));

    let first = sandbox
        .run_in_session(session.id(), RunRequest::new("$env"))
        .await
        .unwrap();
    assert!(first.error.is_none());
    assert_eq!(session.execution_count(), 1);

    let second = sandbox
        .run_in_session(session.id(), RunRequest::new("$env"))
        .await
        .unwrap();
    assert!(second.error.is_none());
    assert_eq!(session.execution_count(), 2);
}

#[tokio::test]
async fn disposing_the_sandbox_is_idempotent() {
    let sandbox = Sandbox::new(KernelConfig::default());
    sandbox.dispose_all().await;
    sandbox.dispose_all().await;
}

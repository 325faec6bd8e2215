//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use orchflow::domain::models::{Config, SchedulingDiscipline};
use orchflow::infrastructure::store::InMemoryStore;
use orchflow::infrastructure::terminal::ProcessBackend;
use orchflow::services::OrchflowRuntime;

/// Build a runtime over the in-memory store and the process backend,
/// with supervision loops running but no pre-spawned workers and no
/// auto-scaling.
pub async fn test_runtime(discipline: SchedulingDiscipline, tick_ms: u64) -> Arc<OrchflowRuntime> {
    let mut config = Config::default();
    config.runtime.min_workers = 0;
    config.runtime.enable_auto_scaling = false;
    config.scheduler.discipline = discipline;
    config.scheduler.tick_ms = tick_ms;

    let runtime = OrchflowRuntime::assemble(
        config,
        Arc::new(InMemoryStore::new()),
        Arc::new(ProcessBackend::new()),
    );
    runtime.start().await.expect("runtime start");
    runtime
}

/// Shell command that prints a completion marker with the given JSON.
pub fn complete_cmd(json: &str) -> String {
    format!("echo 'TASK_COMPLETE: {json}'")
}

/// Shell command that sleeps then completes.
pub fn slow_complete_cmd(seconds: f32, json: &str) -> String {
    format!("sleep {seconds} && echo 'TASK_COMPLETE: {json}'")
}

/// Poll until `probe` returns true or the timeout elapses.
pub async fn wait_for<F, Fut>(timeout: Duration, mut probe: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if probe().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

//! Auto-scaling and pool supervision scenarios.

mod common;

use std::sync::Arc;
use std::time::Duration;

use orchflow::domain::models::{Config, Task};
use orchflow::infrastructure::store::InMemoryStore;
use orchflow::infrastructure::terminal::ProcessBackend;
use orchflow::services::OrchflowRuntime;

async fn scaling_runtime() -> Arc<OrchflowRuntime> {
    let mut config = Config::default();
    config.runtime.min_workers = 2;
    config.runtime.max_workers = 6;
    config.runtime.scale_up_threshold = 3;
    config.runtime.scale_down_threshold_ms = 1000;
    // The periodic loop stays quiet; scaling cycles run explicitly
    config.runtime.enable_auto_scaling = false;

    let runtime = OrchflowRuntime::assemble(
        config,
        Arc::new(InMemoryStore::new()),
        Arc::new(ProcessBackend::new()),
    );
    runtime.start().await.expect("runtime start");
    runtime
}

#[tokio::test]
async fn test_scale_up_under_backlog_then_down_when_idle() {
    let runtime = scaling_runtime().await;
    assert_eq!(runtime.worker_manager.worker_count().await, 2);

    // Ten tasks no worker can run keep the backlog at ten
    let mut task_ids = Vec::new();
    for i in 0..10 {
        let task = Task::new(format!("backlog-{i}"), "queued");
        task_ids.push(task.id);
        runtime.graph.submit(task).await.unwrap();
    }
    assert_eq!(runtime.graph.backlog().await, 10);

    // Two scaling cycles reach the maximum
    runtime.swarm.autoscale_once().await;
    runtime.swarm.autoscale_once().await;
    assert_eq!(runtime.worker_manager.worker_count().await, 6);

    // Drain the backlog, wait past the idle threshold, and scale down
    for id in task_ids {
        runtime.cancel_task(id).await.unwrap();
    }
    assert_eq!(runtime.graph.backlog().await, 0);
    tokio::time::sleep(Duration::from_millis(1200)).await;

    // Repeated cycles remove idle workers but never dip below min
    for _ in 0..4 {
        runtime.swarm.autoscale_once().await;
    }
    assert_eq!(runtime.worker_manager.worker_count().await, 2);

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_min_equals_max_is_inert() {
    let mut config = Config::default();
    config.runtime.min_workers = 2;
    config.runtime.max_workers = 2;
    config.runtime.scale_up_threshold = 1;
    config.runtime.scale_down_threshold_ms = 50;
    config.runtime.enable_auto_scaling = false;

    let runtime = OrchflowRuntime::assemble(
        config,
        Arc::new(InMemoryStore::new()),
        Arc::new(ProcessBackend::new()),
    );
    runtime.start().await.unwrap();
    assert_eq!(runtime.worker_manager.worker_count().await, 2);

    for i in 0..5 {
        runtime
            .graph
            .submit(Task::new(format!("t{i}"), "queued"))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    runtime.swarm.autoscale_once().await;
    runtime.swarm.autoscale_once().await;
    // Pressure up or idle down, the pool stays pinned
    assert_eq!(runtime.worker_manager.worker_count().await, 2);

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_spawn_beyond_max_is_rejected() {
    let mut config = Config::default();
    config.runtime.min_workers = 0;
    config.runtime.max_workers = 1;
    config.runtime.enable_auto_scaling = false;

    let runtime = OrchflowRuntime::assemble(
        config,
        Arc::new(InMemoryStore::new()),
        Arc::new(ProcessBackend::new()),
    );
    runtime.start().await.unwrap();

    runtime
        .worker_manager
        .spawn_worker("dev", &[], None)
        .await
        .unwrap();
    let err = runtime
        .worker_manager
        .spawn_worker("dev", &[], None)
        .await
        .unwrap_err();
    assert_eq!(
        err.kind(),
        orchflow::domain::ErrorKind::AtCapacity
    );

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_restart_preserves_name_and_type() {
    let mut config = Config::default();
    config.runtime.min_workers = 0;
    config.runtime.enable_auto_scaling = false;

    let runtime = OrchflowRuntime::assemble(
        config,
        Arc::new(InMemoryStore::new()),
        Arc::new(ProcessBackend::new()),
    );
    runtime.start().await.unwrap();

    let original = runtime
        .worker_manager
        .spawn_worker("code", &[], None)
        .await
        .unwrap();
    let replacement = runtime
        .worker_manager
        .restart_worker(original.worker_id)
        .await
        .unwrap();

    assert_ne!(replacement.worker_id, original.worker_id);
    assert_eq!(replacement.name, original.name);
    assert_eq!(replacement.worker_type, "code");
    assert_eq!(runtime.worker_manager.worker_count().await, 1);

    runtime.shutdown().await;
}

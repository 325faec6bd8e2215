//! End-to-end orchestration scenarios: real shell workers driven through
//! the task graph, scheduler, and worker manager.

mod common;

use std::time::Duration;

use orchflow::domain::models::{Task, TaskPriority, TaskStatus, SchedulingDiscipline};
use serde_json::Value;

use common::{complete_cmd, slow_complete_cmd, test_runtime, wait_for};

#[tokio::test]
async fn test_dependency_chain_executes_in_order() {
    let runtime = test_runtime(SchedulingDiscipline::Fifo, 50).await;
    runtime
        .worker_manager
        .spawn_worker("code", &[], None)
        .await
        .unwrap();

    let a = Task::new("a", "code").with_payload(Value::String(complete_cmd("\"a\"")));
    let a_id = a.id;
    let b = Task::new("b", "code")
        .with_dependency(a_id)
        .with_payload(Value::String(complete_cmd("\"b\"")));
    let b_id = b.id;
    let c = Task::new("c", "code")
        .with_dependency(b_id)
        .with_payload(Value::String(complete_cmd("\"c\"")));
    let c_id = c.id;

    runtime.graph.submit(a).await.unwrap();
    runtime.graph.submit(b).await.unwrap();
    runtime.graph.submit(c).await.unwrap();

    // b must stay pending while a is unfinished
    assert_eq!(
        runtime.graph.get(b_id).await.unwrap().status,
        TaskStatus::Pending
    );

    let runtime_ref = &runtime;
    let done = wait_for(Duration::from_secs(15), || async move {
        runtime_ref
            .graph
            .get(c_id)
            .await
            .is_ok_and(|t| t.status == TaskStatus::Completed)
    })
    .await;
    assert!(done, "chain did not complete in time");

    let a = runtime.graph.get(a_id).await.unwrap();
    let b = runtime.graph.get(b_id).await.unwrap();
    let c = runtime.graph.get(c_id).await.unwrap();
    assert_eq!(a.status, TaskStatus::Completed);
    assert_eq!(b.status, TaskStatus::Completed);
    assert_eq!(a.result, Some(Value::String("a".into())));

    // Dependency safety: each task started only after its dependency
    // completed
    assert!(b.started_at.unwrap() >= a.completed_at.unwrap());
    assert!(c.started_at.unwrap() >= b.completed_at.unwrap());

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_priority_discipline_runs_critical_first() {
    let runtime = test_runtime(SchedulingDiscipline::Priority, 50).await;

    let normal = Task::new("normal", "code")
        .with_priority(TaskPriority::Normal)
        .with_payload(Value::String(complete_cmd("\"normal\"")));
    let critical = Task::new("critical", "code")
        .with_priority(TaskPriority::Critical)
        .with_payload(Value::String(complete_cmd("\"critical\"")));
    let normal_id = normal.id;
    let critical_id = critical.id;

    // Both tasks sit in the ready-set before any worker exists
    runtime.graph.submit(normal).await.unwrap();
    runtime.graph.submit(critical).await.unwrap();
    runtime
        .worker_manager
        .spawn_worker("code", &[], None)
        .await
        .unwrap();

    let runtime_ref = &runtime;
    let done = wait_for(Duration::from_secs(15), || async move {
        let n = runtime_ref.graph.get(normal_id).await.unwrap();
        let c = runtime_ref.graph.get(critical_id).await.unwrap();
        n.status == TaskStatus::Completed && c.status == TaskStatus::Completed
    })
    .await;
    assert!(done, "tasks did not complete in time");

    // Critical was assigned first despite arriving later
    let normal = runtime.graph.get(normal_id).await.unwrap();
    let critical = runtime.graph.get(critical_id).await.unwrap();
    assert!(critical.started_at.unwrap() <= normal.started_at.unwrap());

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_retry_twice_then_succeed() {
    let runtime = test_runtime(SchedulingDiscipline::Fifo, 50).await;
    runtime
        .worker_manager
        .spawn_worker("code", &[], None)
        .await
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let counter = dir.path().join("attempts");
    // Fails twice with an ERROR line, succeeds on the third attempt
    let script = format!(
        "n=$(cat {path} 2>/dev/null || echo 0); n=$((n+1)); echo $n > {path}; \
         if [ $n -lt 3 ]; then echo \"ERROR: attempt $n\"; \
         else echo 'TASK_COMPLETE: {{\"ok\":true}}'; fi",
        path = counter.display()
    );

    let task = Task::new("flaky", "code")
        .with_max_retries(2)
        .with_payload(Value::String(script));
    let task_id = task.id;
    runtime.graph.submit(task).await.unwrap();

    let runtime_ref = &runtime;
    let done = wait_for(Duration::from_secs(20), || async move {
        runtime_ref
            .graph
            .get(task_id)
            .await
            .is_ok_and(|t| t.status == TaskStatus::Completed)
    })
    .await;
    assert!(done, "flaky task did not recover");

    let task = runtime.graph.get(task_id).await.unwrap();
    assert_eq!(task.retries, 2);
    assert_eq!(task.result, Some(serde_json::json!({"ok": true})));
    assert_eq!(runtime.metrics.counter_value("scheduler.tasks.retried"), 2);
    assert!(runtime.metrics.counter_value("scheduler.tasks.completed") >= 1);

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_zero_retries_surfaces_failure() {
    let runtime = test_runtime(SchedulingDiscipline::Fifo, 50).await;
    runtime
        .worker_manager
        .spawn_worker("code", &[], None)
        .await
        .unwrap();

    let task = Task::new("doomed", "code")
        .with_max_retries(0)
        .with_payload(Value::String("echo 'ERROR: no'".to_string()));
    let task_id = task.id;
    runtime.graph.submit(task).await.unwrap();

    let runtime_ref = &runtime;
    let done = wait_for(Duration::from_secs(15), || async move {
        runtime_ref
            .graph
            .get(task_id)
            .await
            .is_ok_and(|t| t.status == TaskStatus::Failed)
    })
    .await;
    assert!(done, "task did not fail");

    let task = runtime.graph.get(task_id).await.unwrap();
    assert_eq!(task.retries, 0);
    assert!(task.error.is_some());

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_type_lock_serializes_same_type_tasks() {
    let runtime = test_runtime(SchedulingDiscipline::Fifo, 50).await;
    // Two capable workers: without the exclusive type lock these tasks
    // would overlap
    runtime
        .worker_manager
        .spawn_worker("code", &[], None)
        .await
        .unwrap();
    runtime
        .worker_manager
        .spawn_worker("code", &[], None)
        .await
        .unwrap();

    let first = Task::new("first", "code")
        .with_agent_type("code")
        .with_payload(Value::String(slow_complete_cmd(0.3, "1")));
    let second = Task::new("second", "code")
        .with_agent_type("code")
        .with_payload(Value::String(slow_complete_cmd(0.3, "2")));
    let first_id = first.id;
    let second_id = second.id;

    runtime.graph.submit(first).await.unwrap();
    runtime.graph.submit(second).await.unwrap();

    let runtime_ref = &runtime;
    let done = wait_for(Duration::from_secs(20), || async move {
        let a = runtime_ref.graph.get(first_id).await.unwrap();
        let b = runtime_ref.graph.get(second_id).await.unwrap();
        a.status == TaskStatus::Completed && b.status == TaskStatus::Completed
    })
    .await;
    assert!(done, "locked tasks did not complete");

    let first = runtime.graph.get(first_id).await.unwrap();
    let second = runtime.graph.get(second_id).await.unwrap();
    assert_eq!(first.retries, 0);
    assert_eq!(second.retries, 0);

    // Execution windows must not overlap
    let (earlier, later) = if first.started_at <= second.started_at {
        (first, second)
    } else {
        (second, first)
    };
    assert!(later.started_at.unwrap() >= earlier.completed_at.unwrap());

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_cancel_running_task() {
    let runtime = test_runtime(SchedulingDiscipline::Fifo, 50).await;
    runtime
        .worker_manager
        .spawn_worker("code", &[], None)
        .await
        .unwrap();

    let task = Task::new("long", "code")
        .with_payload(Value::String(slow_complete_cmd(5.0, "null")));
    let task_id = task.id;
    runtime.graph.submit(task).await.unwrap();

    let runtime_ref = &runtime;
    let running = wait_for(Duration::from_secs(10), || async move {
        runtime_ref
            .graph
            .get(task_id)
            .await
            .is_ok_and(|t| t.status == TaskStatus::Running)
    })
    .await;
    assert!(running, "task never started");

    runtime.cancel_task(task_id).await.unwrap();
    assert_eq!(
        runtime.graph.get(task_id).await.unwrap().status,
        TaskStatus::Cancelled
    );

    // The worker survives and is free again for reassignment
    let freed = wait_for(Duration::from_secs(5), || async move {
        runtime_ref
            .worker_manager
            .list_workers()
            .await
            .first()
            .is_some_and(|w| w.current_work.is_none())
    })
    .await;
    assert!(freed, "worker was not released after cancel");

    runtime.shutdown().await;
}

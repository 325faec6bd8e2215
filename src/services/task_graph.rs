//! Task graph service.
//!
//! Exclusive owner of all tasks. Tracks dependency edges, detects cycles on
//! submission, promotes tasks to the ready-set as dependencies complete,
//! and retains terminal tasks until a configurable history cap.
//!
//! Forward references are allowed: a task may depend on an id that has not
//! been submitted yet; it stays pending until that dependency exists and
//! completes. Cycle detection runs across both directions of reference.

use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::error::{OrchResult, OrchestratorError};
use crate::domain::models::{Task, TaskStatus};
use crate::services::event_bus::{EventBus, EventPayload};
use crate::services::metrics::{names, MetricsRegistry};

/// Default number of terminal tasks kept queryable.
pub const DEFAULT_HISTORY_CAP: usize = 10_000;

struct GraphState {
    tasks: HashMap<Uuid, Task>,
    /// Reverse edges: dependency id -> tasks waiting on it
    dependents: HashMap<Uuid, Vec<Uuid>>,
    /// Terminal tasks in completion order, for history trimming
    terminal_order: VecDeque<Uuid>,
    /// Ids of every task that ever completed; survives history trimming so
    /// late dependents still observe satisfied dependencies
    completed_ids: HashSet<Uuid>,
}

impl GraphState {
    fn deps_satisfied(&self, task: &Task) -> bool {
        task.dependencies.iter().all(|d| self.completed_ids.contains(d))
    }

    /// Whether following dependency edges from `from` can reach `target`.
    fn reaches(&self, from: Uuid, target: Uuid) -> bool {
        let mut stack = vec![from];
        let mut visited = HashSet::new();
        while let Some(id) = stack.pop() {
            if id == target {
                return true;
            }
            if !visited.insert(id) {
                continue;
            }
            if let Some(task) = self.tasks.get(&id) {
                stack.extend(task.dependencies.iter().copied());
            }
        }
        false
    }
}

/// Per-status counts for the status view.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct GraphCounts {
    pub pending: usize,
    pub scheduled: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Filters for task listing.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub task_type: Option<String>,
    pub limit: Option<usize>,
}

/// The dependency graph and exclusive owner of task records.
pub struct TaskGraph {
    state: RwLock<GraphState>,
    event_bus: Arc<EventBus>,
    metrics: Arc<MetricsRegistry>,
    history_cap: usize,
}

impl TaskGraph {
    pub fn new(event_bus: Arc<EventBus>, metrics: Arc<MetricsRegistry>) -> Self {
        Self::with_history_cap(event_bus, metrics, DEFAULT_HISTORY_CAP)
    }

    pub fn with_history_cap(
        event_bus: Arc<EventBus>,
        metrics: Arc<MetricsRegistry>,
        history_cap: usize,
    ) -> Self {
        Self {
            state: RwLock::new(GraphState {
                tasks: HashMap::new(),
                dependents: HashMap::new(),
                terminal_order: VecDeque::new(),
                completed_ids: HashSet::new(),
            }),
            event_bus,
            metrics,
            history_cap,
        }
    }

    /// Submit a task. Rejects cycles without mutating the graph; promotes
    /// straight to `scheduled` when all dependencies are already complete.
    pub async fn submit(&self, mut task: Task) -> OrchResult<Uuid> {
        task.validate()
            .map_err(|msg| OrchestratorError::invalid_argument("task", msg))?;

        let mut events = Vec::new();
        let id = {
            let mut state = self.state.write().await;
            if state.tasks.contains_key(&task.id) {
                return Err(OrchestratorError::invalid_argument(
                    "task.id",
                    format!("task {} already submitted", task.id),
                ));
            }

            // Adding edges task -> dep closes a cycle iff some dependency
            // already reaches this task through forward references.
            for dep in &task.dependencies {
                if state.reaches(*dep, task.id) {
                    return Err(OrchestratorError::DependencyCycle { task_id: task.id });
                }
            }

            for dep in &task.dependencies {
                state.dependents.entry(*dep).or_default().push(task.id);
            }

            let id = task.id;
            events.push(EventPayload::TaskSubmitted {
                task_id: id,
                name: task.name.clone(),
                task_type: task.task_type.clone(),
            });

            if state.deps_satisfied(&task) {
                // Fresh tasks always admit this transition
                let _ = task.transition_to(TaskStatus::Scheduled);
                events.push(EventPayload::TaskScheduled { task_id: id });
            }
            state.tasks.insert(id, task);
            id
        };

        self.metrics.incr(names::TASKS_SUBMITTED);
        for event in events {
            self.event_bus.publish(event).await;
        }
        Ok(id)
    }

    /// All tasks whose status is `scheduled`, in submission order.
    pub async fn ready_set(&self) -> Vec<Task> {
        let state = self.state.read().await;
        let mut ready: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Scheduled)
            .cloned()
            .collect();
        ready.sort_by_key(|t| t.created_at);
        ready
    }

    /// Transition a scheduled task to running, assigned to `agent_id`.
    pub async fn mark_running(&self, task_id: Uuid, agent_id: Uuid) -> OrchResult<Task> {
        let (task, wait_ms) = {
            let mut state = self.state.write().await;
            let task = state
                .tasks
                .get_mut(&task_id)
                .ok_or(OrchestratorError::TaskNotFound(task_id))?;
            task.transition_to(TaskStatus::Running).map_err(|_| {
                OrchestratorError::InvalidStatusTransition {
                    from: task.status.as_str().to_string(),
                    to: TaskStatus::Running.as_str().to_string(),
                }
            })?;
            task.assigned_to.insert(agent_id);
            let wait_ms = task
                .scheduled_at
                .map(|t| (Utc::now() - t).num_milliseconds().max(0) as f64);
            (task.clone(), wait_ms)
        };

        if let Some(wait_ms) = wait_ms {
            self.metrics.observe(names::TASK_WAIT_TIME, wait_ms);
        }
        self.event_bus
            .publish(EventPayload::TaskStarted { task_id, agent_id })
            .await;
        Ok(task)
    }

    /// Record successful completion. A task already terminal is left
    /// untouched (completion never un-cancels).
    pub async fn on_complete(&self, task_id: Uuid, result: serde_json::Value) -> OrchResult<Task> {
        let mut events = Vec::new();
        let task = {
            let mut state = self.state.write().await;
            let task = state
                .tasks
                .get_mut(&task_id)
                .ok_or(OrchestratorError::TaskNotFound(task_id))?;
            if task.is_terminal() {
                return Ok(task.clone());
            }
            task.transition_to(TaskStatus::Completed).map_err(|_| {
                OrchestratorError::InvalidStatusTransition {
                    from: task.status.as_str().to_string(),
                    to: TaskStatus::Completed.as_str().to_string(),
                }
            })?;
            task.result = Some(result);
            task.error = None;
            let duration_ms = task
                .started_at
                .zip(task.completed_at)
                .map(|(s, e)| (e - s).num_milliseconds().max(0) as u64)
                .unwrap_or(0);
            events.push(EventPayload::TaskCompleted {
                task_id,
                duration_ms,
            });
            self.metrics
                .observe(names::TASK_EXECUTION_TIME, duration_ms as f64);
            let snapshot = task.clone();

            state.completed_ids.insert(task_id);
            state.terminal_order.push_back(task_id);
            Self::promote_dependents(&mut state, task_id, &mut events);
            Self::trim_history(&mut state, self.history_cap);
            snapshot
        };

        self.metrics.incr(names::TASKS_COMPLETED);
        for event in events {
            self.event_bus.publish(event).await;
        }
        Ok(task)
    }

    /// Record a failure. Retries re-enter `scheduled` until the budget is
    /// exhausted; the final failure is terminal.
    pub async fn on_fail(&self, task_id: Uuid, error: impl Into<String>) -> OrchResult<Task> {
        let error = error.into();
        let mut events = Vec::new();
        let mut retried = false;
        let task = {
            let mut state = self.state.write().await;
            let task = state
                .tasks
                .get_mut(&task_id)
                .ok_or(OrchestratorError::TaskNotFound(task_id))?;
            // Completion and cancellation win over a late failure report
            if task.is_terminal() {
                return Ok(task.clone());
            }
            if task.status == TaskStatus::Scheduled || task.status == TaskStatus::Pending {
                // A synthetic failure can race assignment; fail in place
                task.force_status(TaskStatus::Failed, "failure before start");
            } else {
                task.transition_to(TaskStatus::Failed).map_err(|_| {
                    OrchestratorError::InvalidStatusTransition {
                        from: task.status.as_str().to_string(),
                        to: TaskStatus::Failed.as_str().to_string(),
                    }
                })?;
            }
            task.error = Some(error.clone());

            if task.can_retry() {
                // Admitted: Failed -> Scheduled is the retry edge
                let _ = task.retry();
                retried = true;
                events.push(EventPayload::TaskRetrying {
                    task_id,
                    attempt: task.retries,
                    max_attempts: task.max_retries,
                });
            } else {
                events.push(EventPayload::TaskFailed {
                    task_id,
                    error,
                    retries: task.retries,
                });
                state.terminal_order.push_back(task_id);
            }
            let snapshot = state.tasks.get(&task_id).cloned();
            Self::trim_history(&mut state, self.history_cap);
            snapshot.ok_or(OrchestratorError::TaskNotFound(task_id))?
        };

        if retried {
            self.metrics.incr(names::TASKS_RETRIED);
        } else {
            self.metrics.incr(names::TASKS_FAILED);
        }
        for event in events {
            self.event_bus.publish(event).await;
        }
        Ok(task)
    }

    /// Cancel a task. Returns the agents that were assigned so the caller
    /// can signal them. Terminal tasks cannot be cancelled.
    pub async fn cancel(&self, task_id: Uuid) -> OrchResult<Vec<Uuid>> {
        let assigned = {
            let mut state = self.state.write().await;
            let task = state
                .tasks
                .get_mut(&task_id)
                .ok_or(OrchestratorError::TaskNotFound(task_id))?;
            task.transition_to(TaskStatus::Cancelled).map_err(|_| {
                OrchestratorError::InvalidStatusTransition {
                    from: task.status.as_str().to_string(),
                    to: TaskStatus::Cancelled.as_str().to_string(),
                }
            })?;
            let assigned: Vec<Uuid> = task.assigned_to.iter().copied().collect();
            state.terminal_order.push_back(task_id);
            Self::trim_history(&mut state, self.history_cap);
            assigned
        };

        self.metrics.incr(names::TASKS_CANCELLED);
        self.event_bus
            .publish(EventPayload::TaskCancelled { task_id })
            .await;
        Ok(assigned)
    }

    /// Revert tasks left `running` with no live agent, e.g. after a crash.
    /// Returns how many tasks were reconciled.
    pub async fn reconcile_orphans(&self, live_agents: &HashSet<Uuid>) -> usize {
        let mut state = self.state.write().await;
        let orphaned: Vec<Uuid> = state
            .tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Running
                    && t.assigned_to.iter().all(|a| !live_agents.contains(a))
            })
            .map(|t| t.id)
            .collect();

        for id in &orphaned {
            if let Some(task) = state.tasks.get_mut(id) {
                task.assigned_to.clear();
                task.force_status(TaskStatus::Scheduled, "assigned worker lost");
            }
        }
        orphaned.len()
    }

    /// Fetch a task by id.
    pub async fn get(&self, task_id: Uuid) -> OrchResult<Task> {
        self.state
            .read()
            .await
            .tasks
            .get(&task_id)
            .cloned()
            .ok_or(OrchestratorError::TaskNotFound(task_id))
    }

    /// List tasks matching the filter, newest first.
    pub async fn list(&self, filter: &TaskFilter) -> Vec<Task> {
        let state = self.state.read().await;
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| filter.status.is_none_or(|s| t.status == s))
            .filter(|t| {
                filter
                    .task_type
                    .as_deref()
                    .is_none_or(|ty| t.task_type == ty)
            })
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            tasks.truncate(limit);
        }
        tasks
    }

    /// Per-status counts.
    pub async fn counts(&self) -> GraphCounts {
        let state = self.state.read().await;
        let mut counts = GraphCounts::default();
        for task in state.tasks.values() {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Scheduled => counts.scheduled += 1,
                TaskStatus::Running => counts.running += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
                TaskStatus::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    /// Pending plus scheduled count; the auto-scaler's backlog signal.
    pub async fn backlog(&self) -> usize {
        let counts = self.counts().await;
        counts.pending + counts.scheduled
    }

    fn promote_dependents(state: &mut GraphState, completed: Uuid, events: &mut Vec<EventPayload>) {
        let dependents = state.dependents.get(&completed).cloned().unwrap_or_default();
        for dep_id in dependents {
            let satisfied = state
                .tasks
                .get(&dep_id)
                .is_some_and(|t| t.status == TaskStatus::Pending && state.deps_satisfied(t));
            if satisfied {
                if let Some(task) = state.tasks.get_mut(&dep_id) {
                    let _ = task.transition_to(TaskStatus::Scheduled);
                    events.push(EventPayload::TaskScheduled { task_id: dep_id });
                }
            }
        }
    }

    fn trim_history(state: &mut GraphState, cap: usize) {
        while state.terminal_order.len() > cap {
            if let Some(old) = state.terminal_order.pop_front() {
                if let Some(task) = state.tasks.remove(&old) {
                    for dep in &task.dependencies {
                        if let Some(list) = state.dependents.get_mut(dep) {
                            list.retain(|id| *id != old);
                        }
                    }
                }
                state.dependents.remove(&old);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::TaskPriority;

    fn graph() -> TaskGraph {
        TaskGraph::new(
            Arc::new(EventBus::with_defaults()),
            Arc::new(MetricsRegistry::new()),
        )
    }

    fn graph_with_cap(cap: usize) -> TaskGraph {
        TaskGraph::with_history_cap(
            Arc::new(EventBus::with_defaults()),
            Arc::new(MetricsRegistry::new()),
            cap,
        )
    }

    #[tokio::test]
    async fn test_submit_promotes_when_no_deps() {
        let graph = graph();
        let task = Task::new("a", "code");
        let id = task.id;
        graph.submit(task).await.unwrap();
        assert_eq!(graph.get(id).await.unwrap().status, TaskStatus::Scheduled);
        assert_eq!(graph.ready_set().await.len(), 1);
    }

    #[tokio::test]
    async fn test_dependency_chain_promotion() {
        let graph = graph();
        let a = Task::new("a", "code");
        let a_id = a.id;
        let b = Task::new("b", "code").with_dependency(a_id);
        let b_id = b.id;
        let c = Task::new("c", "code").with_dependency(b_id);
        let c_id = c.id;

        graph.submit(a).await.unwrap();
        graph.submit(b).await.unwrap();
        graph.submit(c).await.unwrap();

        assert_eq!(graph.get(b_id).await.unwrap().status, TaskStatus::Pending);
        assert_eq!(graph.get(c_id).await.unwrap().status, TaskStatus::Pending);

        let agent = Uuid::new_v4();
        graph.mark_running(a_id, agent).await.unwrap();
        graph.on_complete(a_id, serde_json::json!({"ok": true})).await.unwrap();

        assert_eq!(graph.get(b_id).await.unwrap().status, TaskStatus::Scheduled);
        assert_eq!(graph.get(c_id).await.unwrap().status, TaskStatus::Pending);

        graph.mark_running(b_id, agent).await.unwrap();
        graph.on_complete(b_id, serde_json::json!(null)).await.unwrap();
        assert_eq!(graph.get(c_id).await.unwrap().status, TaskStatus::Scheduled);
    }

    #[tokio::test]
    async fn test_cycle_rejected_without_mutation() {
        let graph = graph();
        let b_id = Uuid::new_v4();
        // a depends on b, which does not exist yet
        let a = Task::new("a", "code").with_dependency(b_id);
        let a_id = a.id;
        graph.submit(a).await.unwrap();

        // b depending on a would close the cycle
        let mut b = Task::new("b", "code");
        b.id = b_id;
        b = b.with_dependency(a_id);
        let err = graph.submit(b).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::DependencyCycle { .. }));
        // b was not inserted
        assert!(graph.get(b_id).await.is_err());
    }

    #[tokio::test]
    async fn test_self_dependency_rejected() {
        let graph = graph();
        let mut task = Task::new("a", "code");
        let id = task.id;
        task.dependencies.push(id);
        assert!(graph.submit(task).await.is_err());
    }

    #[tokio::test]
    async fn test_retry_then_terminal_failure() {
        let graph = graph();
        let task = Task::new("flaky", "code").with_max_retries(1);
        let id = task.id;
        graph.submit(task).await.unwrap();
        let agent = Uuid::new_v4();

        graph.mark_running(id, agent).await.unwrap();
        let after_first = graph.on_fail(id, "boom").await.unwrap();
        assert_eq!(after_first.status, TaskStatus::Scheduled);
        assert_eq!(after_first.retries, 1);

        graph.mark_running(id, agent).await.unwrap();
        let after_second = graph.on_fail(id, "boom again").await.unwrap();
        assert_eq!(after_second.status, TaskStatus::Failed);
        assert_eq!(after_second.error.as_deref(), Some("boom again"));
    }

    #[tokio::test]
    async fn test_zero_retries_fails_immediately() {
        let graph = graph();
        let task = Task::new("once", "code").with_max_retries(0);
        let id = task.id;
        graph.submit(task).await.unwrap();
        graph.mark_running(id, Uuid::new_v4()).await.unwrap();
        let failed = graph.on_fail(id, "no").await.unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_completion_wins_over_late_failure() {
        let graph = graph();
        let task = Task::new("t", "code");
        let id = task.id;
        graph.submit(task).await.unwrap();
        graph.mark_running(id, Uuid::new_v4()).await.unwrap();
        graph.on_complete(id, serde_json::json!(1)).await.unwrap();

        let after = graph.on_fail(id, "late").await.unwrap();
        assert_eq!(after.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_cancel_returns_assigned_agents() {
        let graph = graph();
        let task = Task::new("t", "code");
        let id = task.id;
        graph.submit(task).await.unwrap();
        let agent = Uuid::new_v4();
        graph.mark_running(id, agent).await.unwrap();

        let assigned = graph.cancel(id).await.unwrap();
        assert_eq!(assigned, vec![agent]);
        assert_eq!(graph.get(id).await.unwrap().status, TaskStatus::Cancelled);

        // Cancelling a terminal task is rejected
        assert!(graph.cancel(id).await.is_err());
    }

    #[tokio::test]
    async fn test_history_cap_discards_oldest_terminal() {
        let graph = graph_with_cap(2);
        let agent = Uuid::new_v4();
        let mut ids = Vec::new();
        for i in 0..4 {
            let task = Task::new(format!("t{i}"), "code");
            ids.push(task.id);
            graph.submit(task).await.unwrap();
            graph.mark_running(ids[i], agent).await.unwrap();
            graph.on_complete(ids[i], serde_json::json!(i)).await.unwrap();
        }

        // The two oldest completed tasks were discarded
        assert!(graph.get(ids[0]).await.is_err());
        assert!(graph.get(ids[1]).await.is_err());
        assert!(graph.get(ids[2]).await.is_ok());
        assert!(graph.get(ids[3]).await.is_ok());
    }

    #[tokio::test]
    async fn test_promotion_survives_history_trim() {
        let graph = graph_with_cap(1);
        let agent = Uuid::new_v4();

        let a = Task::new("a", "code");
        let a_id = a.id;
        graph.submit(a).await.unwrap();
        graph.mark_running(a_id, agent).await.unwrap();
        graph.on_complete(a_id, serde_json::json!(null)).await.unwrap();

        // Push a out of history
        let b = Task::new("b", "code");
        let b_id = b.id;
        graph.submit(b).await.unwrap();
        graph.mark_running(b_id, agent).await.unwrap();
        graph.on_complete(b_id, serde_json::json!(null)).await.unwrap();
        assert!(graph.get(a_id).await.is_err());

        // A late dependent of a still observes it as completed
        let c = Task::new("c", "code").with_dependency(a_id);
        let c_id = c.id;
        graph.submit(c).await.unwrap();
        assert_eq!(graph.get(c_id).await.unwrap().status, TaskStatus::Scheduled);
    }

    #[tokio::test]
    async fn test_ready_set_submission_order() {
        let graph = graph();
        let first = Task::new("first", "code").with_priority(TaskPriority::Low);
        let second = Task::new("second", "code").with_priority(TaskPriority::Critical);
        let first_id = first.id;
        graph.submit(first).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        graph.submit(second).await.unwrap();

        let ready = graph.ready_set().await;
        assert_eq!(ready.len(), 2);
        assert_eq!(ready[0].id, first_id);
    }

    #[tokio::test]
    async fn test_reconcile_orphans() {
        let graph = graph();
        let task = Task::new("t", "code");
        let id = task.id;
        graph.submit(task).await.unwrap();
        let dead_agent = Uuid::new_v4();
        graph.mark_running(id, dead_agent).await.unwrap();

        let live = HashSet::new();
        assert_eq!(graph.reconcile_orphans(&live).await, 1);
        let task = graph.get(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Scheduled);
        assert!(task.assigned_to.is_empty());
    }
}

//! Swarm coordinator.
//!
//! Composes direct worker commands into five execution shapes, supervises
//! the pool with heartbeats, and scales it between `min_workers` and
//! `max_workers` from backlog pressure and idle time.

use futures::future::join_all;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use uuid::Uuid;

use crate::domain::error::{OrchResult, OrchestratorError};
use crate::domain::models::{
    RuntimeConfig, SubtaskSpec, SwarmShape, SwarmStatus, SwarmTask, Task,
};
use crate::services::agent_registry::AgentRegistry;
use crate::services::event_bus::{EventBus, EventPayload};
use crate::services::load_balancer::LoadBalancer;
use crate::services::metrics::{names, MetricsRegistry};
use crate::services::task_graph::TaskGraph;
use crate::services::worker_manager::WorkerManager;

/// How long a subtask waits for an available worker.
const WORKER_WAIT_MS: u64 = 30_000;

/// Poll interval while waiting for a worker.
const WORKER_POLL_MS: u64 = 500;

/// Cadence of the auto-scale and heartbeat loops.
const SUPERVISION_INTERVAL_MS: u64 = 30_000;

/// Worker type spawned by the auto-scaler.
const DEFAULT_WORKER_TYPE: &str = "dev";

/// Executes composite tasks and supervises the worker pool.
pub struct SwarmCoordinator {
    worker_manager: Arc<WorkerManager>,
    registry: Arc<AgentRegistry>,
    balancer: Arc<LoadBalancer>,
    graph: Arc<TaskGraph>,
    event_bus: Arc<EventBus>,
    metrics: Arc<MetricsRegistry>,
    config: RuntimeConfig,
    swarms: RwLock<HashMap<Uuid, SwarmTask>>,
    cancel_flags: RwLock<HashMap<Uuid, Arc<AtomicBool>>>,
    active_workers: RwLock<HashMap<Uuid, HashSet<Uuid>>>,
}

impl SwarmCoordinator {
    pub fn new(
        worker_manager: Arc<WorkerManager>,
        registry: Arc<AgentRegistry>,
        balancer: Arc<LoadBalancer>,
        graph: Arc<TaskGraph>,
        event_bus: Arc<EventBus>,
        metrics: Arc<MetricsRegistry>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            worker_manager,
            registry,
            balancer,
            graph,
            event_bus,
            metrics,
            config,
            swarms: RwLock::new(HashMap::new()),
            cancel_flags: RwLock::new(HashMap::new()),
            active_workers: RwLock::new(HashMap::new()),
        }
    }

    /// Execute a swarm to completion and return its final record.
    pub async fn execute(self: &Arc<Self>, mut swarm: SwarmTask) -> OrchResult<SwarmTask> {
        swarm
            .validate()
            .map_err(|msg| OrchestratorError::invalid_argument("swarm", msg))?;

        let swarm_id = swarm.id;
        swarm.started_at = Some(chrono::Utc::now());

        // A swarm with no subtasks completes immediately
        if swarm.subtasks.is_empty() {
            swarm.status = SwarmStatus::Completed;
            swarm.completed_at = Some(chrono::Utc::now());
            self.swarms.write().await.insert(swarm_id, swarm.clone());
            return Ok(swarm);
        }

        swarm.status = SwarmStatus::Running;
        let cancel = Arc::new(AtomicBool::new(false));
        {
            self.swarms.write().await.insert(swarm_id, swarm.clone());
            self.cancel_flags
                .write()
                .await
                .insert(swarm_id, Arc::clone(&cancel));
            self.active_workers
                .write()
                .await
                .insert(swarm_id, HashSet::new());
        }
        self.event_bus
            .publish(EventPayload::SwarmStarted {
                swarm_id,
                shape: swarm.shape.as_str().to_string(),
                subtask_count: swarm.subtasks.len(),
            })
            .await;

        let _timer = self.metrics.timer(names::SWARM_EXECUTION_TIME);
        let (results, errors, aborted) = match swarm.shape {
            SwarmShape::Parallel => self.run_parallel(&swarm, &cancel).await,
            SwarmShape::Sequential => self.run_sequential(&swarm, &cancel, false).await,
            SwarmShape::Map => self.run_map(&swarm, &cancel).await,
            SwarmShape::Reduce => Self::run_reduce(&swarm),
            SwarmShape::Pipeline => self.run_sequential(&swarm, &cancel, true).await,
        };

        swarm.results = results;
        swarm.errors = errors;
        swarm.completed_at = Some(chrono::Utc::now());

        let cancelled = cancel.load(Ordering::SeqCst);
        swarm.status = if cancelled || aborted || swarm.over_failure_threshold() {
            SwarmStatus::Failed
        } else {
            SwarmStatus::Completed
        };
        if cancelled {
            swarm.errors.insert("__swarm".into(), "cancelled".into());
        }

        {
            let mut swarms = self.swarms.write().await;
            swarms.insert(swarm_id, swarm.clone());
        }
        self.cancel_flags.write().await.remove(&swarm_id);
        self.active_workers.write().await.remove(&swarm_id);

        match swarm.status {
            SwarmStatus::Completed => {
                self.event_bus
                    .publish(EventPayload::SwarmCompleted {
                        swarm_id,
                        succeeded: swarm.results.len(),
                        failed: swarm.errors.len(),
                    })
                    .await;
            }
            _ => {
                let reason = if cancelled {
                    "cancelled".to_string()
                } else {
                    format!("{:.0}% of subtasks failed", swarm.failure_pct())
                };
                self.event_bus
                    .publish(EventPayload::SwarmFailed { swarm_id, reason })
                    .await;
            }
        }
        Ok(swarm)
    }

    /// Mark a swarm failed with cause `cancelled` and abort its workers.
    pub async fn cancel_swarm(&self, swarm_id: Uuid) -> OrchResult<()> {
        let flag = {
            let flags = self.cancel_flags.read().await;
            flags.get(&swarm_id).cloned()
        };

        match flag {
            Some(flag) => flag.store(true, Ordering::SeqCst),
            None => {
                // Not running; it must at least exist
                let swarms = self.swarms.read().await;
                if !swarms.contains_key(&swarm_id) {
                    return Err(OrchestratorError::SwarmNotFound(swarm_id));
                }
                return Ok(());
            }
        }

        let workers: Vec<Uuid> = {
            let active = self.active_workers.read().await;
            active
                .get(&swarm_id)
                .map(|set| set.iter().copied().collect())
                .unwrap_or_default()
        };
        for worker_id in workers {
            self.worker_manager
                .abort_current(worker_id, "swarm cancelled")
                .await;
        }

        self.event_bus
            .publish(EventPayload::SwarmCancelled { swarm_id })
            .await;
        Ok(())
    }

    /// Fetch a swarm record.
    pub async fn get(&self, swarm_id: Uuid) -> OrchResult<SwarmTask> {
        self.swarms
            .read()
            .await
            .get(&swarm_id)
            .cloned()
            .ok_or(OrchestratorError::SwarmNotFound(swarm_id))
    }

    /// All known swarms, newest first.
    pub async fn list(&self) -> Vec<SwarmTask> {
        let swarms = self.swarms.read().await;
        let mut list: Vec<SwarmTask> = swarms.values().cloned().collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        list
    }

    // ------------------------------------------------------------------
    // Shapes
    // ------------------------------------------------------------------

    async fn run_parallel(
        self: &Arc<Self>,
        swarm: &SwarmTask,
        cancel: &Arc<AtomicBool>,
    ) -> (HashMap<String, Value>, HashMap<String, String>, bool) {
        let mut results = HashMap::new();
        let mut errors: HashMap<String, String> = HashMap::new();
        let total = swarm.subtasks.len();

        for chunk in swarm.subtasks.chunks(swarm.config.max_concurrency.max(1)) {
            if cancel.load(Ordering::SeqCst) {
                break;
            }
            // Failure threshold: stop fanning out, cancel the rest
            if let Some(threshold) = swarm.config.failure_threshold_pct {
                let pct = errors.len() as f64 / total as f64 * 100.0;
                if pct > threshold {
                    break;
                }
            }

            let outcomes = join_all(chunk.iter().map(|subtask| {
                let coordinator = Arc::clone(self);
                let swarm_id = swarm.id;
                let config = swarm.config.clone();
                async move {
                    let outcome = coordinator
                        .run_subtask(swarm_id, subtask, &config, None)
                        .await;
                    (subtask.id.clone(), outcome)
                }
            }))
            .await;

            for (id, outcome) in outcomes {
                match outcome {
                    Ok(value) => {
                        self.metrics.incr(names::SWARM_TASKS_COMPLETED);
                        results.insert(id, value);
                    }
                    Err(message) => {
                        self.metrics.incr(names::SWARM_TASKS_FAILED);
                        errors.insert(id, message);
                    }
                }
            }
        }

        // Anything never attempted was cancelled
        for subtask in &swarm.subtasks {
            if !results.contains_key(&subtask.id) && !errors.contains_key(&subtask.id) {
                errors.insert(subtask.id.clone(), "cancelled".to_string());
            }
        }
        (results, errors, false)
    }

    async fn run_sequential(
        self: &Arc<Self>,
        swarm: &SwarmTask,
        cancel: &Arc<AtomicBool>,
        pipeline: bool,
    ) -> (HashMap<String, Value>, HashMap<String, String>, bool) {
        let mut results = HashMap::new();
        let mut errors = HashMap::new();
        let mut aborted = false;
        let mut previous: Option<Value> = None;

        for subtask in &swarm.subtasks {
            if cancel.load(Ordering::SeqCst) {
                aborted = true;
                break;
            }

            let input = if pipeline { previous.take() } else { None };
            match self
                .run_subtask(swarm.id, subtask, &swarm.config, input)
                .await
            {
                Ok(value) => {
                    self.metrics.incr(names::SWARM_TASKS_COMPLETED);
                    if pipeline {
                        previous = Some(value.clone());
                    }
                    results.insert(subtask.id.clone(), value);
                }
                Err(message) => {
                    self.metrics.incr(names::SWARM_TASKS_FAILED);
                    errors.insert(subtask.id.clone(), message);
                    aborted = true;
                    break;
                }
            }
        }
        (results, errors, aborted)
    }

    async fn run_map(
        self: &Arc<Self>,
        swarm: &SwarmTask,
        cancel: &Arc<AtomicBool>,
    ) -> (HashMap<String, Value>, HashMap<String, String>, bool) {
        let (mut results, errors, aborted) = self.run_parallel(swarm, cancel).await;

        // Implicit reduce over the map outputs, in subtask order
        let outputs: Vec<Value> = swarm
            .subtasks
            .iter()
            .filter_map(|s| results.get(&s.id).cloned())
            .collect();
        results.insert("__reduce".to_string(), Self::reduce_values(outputs));
        (results, errors, aborted)
    }

    /// Reduce finalization over the subtask commands as JSON inputs.
    fn run_reduce(
        swarm: &SwarmTask,
    ) -> (HashMap<String, Value>, HashMap<String, String>, bool) {
        let inputs: Vec<Value> = swarm
            .subtasks
            .iter()
            .map(|s| {
                serde_json::from_str(&s.command)
                    .unwrap_or_else(|_| Value::String(s.command.clone()))
            })
            .collect();

        let mut results = HashMap::new();
        results.insert("reduce".to_string(), Self::reduce_values(inputs));
        (results, HashMap::new(), false)
    }

    /// Numeric inputs sum; objects shallow-merge; anything else passes
    /// through as a list.
    fn reduce_values(values: Vec<Value>) -> Value {
        if values.is_empty() {
            return Value::Array(vec![]);
        }
        if values.iter().all(Value::is_number) {
            if values.iter().all(|v| v.as_i64().is_some()) {
                let sum: i64 = values.iter().filter_map(Value::as_i64).sum();
                return Value::from(sum);
            }
            let sum: f64 = values.iter().filter_map(Value::as_f64).sum();
            return Value::from(sum);
        }
        if values.iter().all(Value::is_object) {
            let mut merged = serde_json::Map::new();
            for value in values {
                if let Value::Object(map) = value {
                    for (key, entry) in map {
                        merged.insert(key, entry);
                    }
                }
            }
            return Value::Object(merged);
        }
        Value::Array(values)
    }

    /// Run one subtask on an available worker, retrying per its budget.
    async fn run_subtask(
        self: &Arc<Self>,
        swarm_id: Uuid,
        subtask: &SubtaskSpec,
        config: &crate::domain::models::SwarmTaskConfig,
        pipeline_input: Option<Value>,
    ) -> Result<Value, String> {
        let _timer = self.metrics.timer(names::SUBTASK_EXECUTION_TIME);
        let timeout_ms = config.timeout_ms.unwrap_or(self.config.task_timeout_ms);
        let attempts = 1 + if subtask.retryable {
            config.retry_attempts
        } else {
            0
        };

        let command = match pipeline_input {
            Some(input) => format!("{} {}", subtask.command, input),
            None => subtask.command.clone(),
        };

        let mut last_error = String::new();
        for attempt in 0..attempts {
            if attempt > 0 {
                tracing::debug!(subtask = %subtask.id, attempt, "retrying subtask");
            }

            let deadline =
                std::time::Instant::now() + std::time::Duration::from_millis(WORKER_WAIT_MS);
            let outcome = loop {
                let worker_id = match self.acquire_worker(&subtask.name).await {
                    Ok(id) => id,
                    Err(err) => break Err(err),
                };

                {
                    let mut active = self.active_workers.write().await;
                    active.entry(swarm_id).or_default().insert(worker_id);
                }
                let result = self
                    .worker_manager
                    .execute(worker_id, command.clone(), timeout_ms)
                    .await;
                {
                    let mut active = self.active_workers.write().await;
                    if let Some(set) = active.get_mut(&swarm_id) {
                        set.remove(&worker_id);
                    }
                }

                match result {
                    // A sibling subtask won the worker; pick another
                    Err(OrchestratorError::AtCapacity { .. })
                        if std::time::Instant::now() < deadline =>
                    {
                        tokio::time::sleep(std::time::Duration::from_millis(WORKER_POLL_MS))
                            .await;
                    }
                    other => break other,
                }
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(err) => last_error = err.to_string(),
            }
        }
        Err(last_error)
    }

    /// Wait up to 30 s for the balancer to yield an available worker.
    async fn acquire_worker(&self, subtask_name: &str) -> OrchResult<Uuid> {
        let routing_task = Task::new(subtask_name, "swarm");
        let deadline = std::time::Instant::now()
            + std::time::Duration::from_millis(WORKER_WAIT_MS);

        loop {
            let agents = self.registry.available_agents().await;
            if let Some(worker_id) = self.balancer.select(&routing_task, &agents).await {
                return Ok(worker_id);
            }
            if std::time::Instant::now() >= deadline {
                return Err(OrchestratorError::AtCapacity {
                    limit: self.config.max_workers,
                });
            }
            tokio::time::sleep(std::time::Duration::from_millis(WORKER_POLL_MS)).await;
        }
    }

    // ------------------------------------------------------------------
    // Supervision loops
    // ------------------------------------------------------------------

    /// Auto-scaling loop: scale up under backlog pressure, remove workers
    /// idle past the threshold, never leaving the [min, max] band.
    pub fn run_autoscaler(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_millis(
                SUPERVISION_INTERVAL_MS,
            ));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if self.config.enable_auto_scaling {
                            self.autoscale_once().await;
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// One auto-scaling evaluation.
    pub async fn autoscale_once(self: &Arc<Self>) {
        let pending = self.graph.backlog().await;
        let mut total = self.worker_manager.worker_count().await;
        let idle = self
            .worker_manager
            .idle_workers(self.config.scale_down_threshold_ms)
            .await;

        // Lost workers are replaced up to the floor first
        while total < self.config.min_workers {
            match self
                .worker_manager
                .spawn_worker(DEFAULT_WORKER_TYPE, &[], None)
                .await
            {
                Ok(_) => total += 1,
                Err(err) => {
                    tracing::warn!(%err, "min-worker replacement failed");
                    break;
                }
            }
        }

        if pending > self.config.scale_up_threshold && total < self.config.max_workers {
            let want = pending
                .saturating_sub(idle.len())
                .min(self.config.max_workers - total);
            let mut added = 0;
            for _ in 0..want {
                match self
                    .worker_manager
                    .spawn_worker(DEFAULT_WORKER_TYPE, &[], None)
                    .await
                {
                    Ok(_) => added += 1,
                    Err(err) => {
                        tracing::warn!(%err, "auto-scale spawn failed");
                        break;
                    }
                }
            }
            if added > 0 {
                let total = self.worker_manager.worker_count().await;
                self.event_bus
                    .publish(EventPayload::PoolScaledUp { added, total })
                    .await;
            }
            return;
        }

        let mut removed = 0;
        let mut remaining = total;
        for worker_id in idle {
            if remaining <= self.config.min_workers {
                break;
            }
            if self.worker_manager.stop_worker(worker_id).await.is_ok() {
                removed += 1;
                remaining -= 1;
            }
        }
        if removed > 0 {
            self.event_bus
                .publish(EventPayload::PoolScaledDown {
                    removed,
                    total: remaining,
                })
                .await;
        }
    }

    /// Heartbeat loop: idle workers are refreshed, stale busy workers are
    /// flagged at 2x the interval and restarted at 4x.
    pub fn run_heartbeat_monitor(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let interval_ms = self.config.heartbeat_interval_ms.max(1000);
            let mut interval =
                tokio::time::interval(std::time::Duration::from_millis(interval_ms));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.heartbeat_scan().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// One heartbeat sweep over the pool.
    pub async fn heartbeat_scan(self: &Arc<Self>) {
        let interval_ms = self.config.heartbeat_interval_ms.max(1000) as i64;
        let now = chrono::Utc::now();

        for snapshot in self.worker_manager.list_workers().await {
            if snapshot.current_work.is_none() {
                // Idle workers are alive by construction; exits remove them
                self.registry.heartbeat(snapshot.worker_id).await;
                let idle_for = (now - snapshot.last_activity).num_milliseconds();
                if idle_for >= self.config.worker_idle_timeout_ms as i64 {
                    self.registry.mark_idle(snapshot.worker_id).await;
                }
                continue;
            }

            let Ok(agent) = self.registry.get(snapshot.worker_id).await else {
                continue;
            };
            let stale_ms = (now - agent.metrics.last_heartbeat).num_milliseconds();
            let missed = stale_ms / interval_ms;

            if missed >= 4 {
                tracing::warn!(worker_id = %snapshot.worker_id, "heartbeat missed 4x, restarting");
                self.event_bus
                    .publish(EventPayload::HeartbeatMissed {
                        worker_id: snapshot.worker_id,
                        missed_intervals: missed as u32,
                    })
                    .await;
                if let Err(err) = self.worker_manager.restart_worker(snapshot.worker_id).await {
                    tracing::warn!(%err, "heartbeat restart failed");
                }
            } else if missed >= 2 {
                self.event_bus
                    .publish(EventPayload::HeartbeatMissed {
                        worker_id: snapshot.worker_id,
                        missed_intervals: missed as u32,
                    })
                    .await;
                self.registry.mark_error(snapshot.worker_id).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reduce_integers_sum() {
        let value = SwarmCoordinator::reduce_values(vec![
            serde_json::json!(1),
            serde_json::json!(2),
            serde_json::json!(3),
        ]);
        assert_eq!(value, serde_json::json!(6));
    }

    #[test]
    fn test_reduce_floats_sum() {
        let value = SwarmCoordinator::reduce_values(vec![
            serde_json::json!(1.5),
            serde_json::json!(2.5),
        ]);
        assert_eq!(value, serde_json::json!(4.0));
    }

    #[test]
    fn test_reduce_objects_shallow_merge() {
        let value = SwarmCoordinator::reduce_values(vec![
            serde_json::json!({"a": 1, "b": 1}),
            serde_json::json!({"b": 2, "c": 3}),
        ]);
        assert_eq!(value, serde_json::json!({"a": 1, "b": 2, "c": 3}));
    }

    #[test]
    fn test_reduce_mixed_passthrough() {
        let value = SwarmCoordinator::reduce_values(vec![
            serde_json::json!(1),
            serde_json::json!("two"),
        ]);
        assert_eq!(value, serde_json::json!([1, "two"]));
    }

    #[test]
    fn test_reduce_empty() {
        assert_eq!(
            SwarmCoordinator::reduce_values(vec![]),
            serde_json::json!([])
        );
    }
}

//! Worker manager.
//!
//! Owns worker processes. Each worker pairs an agent record with one
//! terminal backend handle, a bounded command queue, and an output parser.
//! A single supervisor loop consumes terminal events, routes completion
//! markers to the task graph, and turns ERROR lines, stderr, and non-zero
//! exits into task failures with health bookkeeping.

use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use uuid::Uuid;

use crate::domain::error::{OrchResult, OrchestratorError};
use crate::domain::models::{AgentManifest, AgentStatus, Task};
use crate::domain::ports::{NoopAgentHandler, SpawnSpec, TerminalBackend, TerminalEvent};
use crate::infrastructure::terminal::{OutputParser, ParsedLine};
use crate::services::agent_registry::AgentRegistry;
use crate::services::circuit_breaker::{CircuitBreakerService, CircuitScope};
use crate::services::event_bus::{EventBus, EventPayload};
use crate::services::metrics::{names, MetricsRegistry};
use crate::services::resource_manager::ResourceManager;
use crate::services::task_graph::TaskGraph;

/// Commands queued per worker before backpressure kicks in.
const QUEUE_CAPACITY: usize = 32;

/// Recent output lines retained per worker.
const OUTPUT_TAIL: usize = 100;

/// Name fragments for generated worker names.
const ADJECTIVES: [&str; 12] = [
    "brisk", "calm", "deft", "eager", "fleet", "keen", "lucid", "nimble", "quiet", "sharp",
    "swift", "steady",
];
const NOUNS: [&str; 12] = [
    "otter", "falcon", "badger", "heron", "lynx", "marten", "osprey", "raven", "stoat", "tern",
    "vole", "wren",
];

/// A unit of work a worker executes.
enum WorkUnit {
    /// A graph task routed by the scheduler
    Graph {
        task_id: Uuid,
        command: String,
        lock_resource: Option<String>,
        timeout_ms: u64,
    },
    /// A direct command (swarm subtasks), answered over a oneshot
    Direct {
        work_id: Uuid,
        command: String,
        reply: oneshot::Sender<Result<Value, String>>,
    },
}

impl WorkUnit {
    fn command(&self) -> &str {
        match self {
            Self::Graph { command, .. } | Self::Direct { command, .. } => command,
        }
    }

    fn work_id(&self) -> Uuid {
        match self {
            Self::Graph { task_id, .. } => *task_id,
            Self::Direct { work_id, .. } => *work_id,
        }
    }
}

struct ActiveWork {
    unit: WorkUnit,
    started_at: Instant,
}

struct WorkerState {
    name: String,
    worker_type: String,
    terminal_id: Uuid,
    parser: OutputParser,
    current: Option<ActiveWork>,
    queue: VecDeque<WorkUnit>,
    recent_output: VecDeque<String>,
    paused: bool,
    spawned_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
}

/// Externally visible view of a worker.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkerSnapshot {
    pub worker_id: Uuid,
    pub name: String,
    pub worker_type: String,
    pub status: AgentStatus,
    pub current_work: Option<Uuid>,
    pub queued: usize,
    pub paused: bool,
    pub spawned_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// Worker pool lifecycle and output supervision.
pub struct WorkerManager {
    backend: Arc<dyn TerminalBackend>,
    registry: Arc<AgentRegistry>,
    graph: Arc<TaskGraph>,
    locks: Arc<ResourceManager>,
    event_bus: Arc<EventBus>,
    metrics: Arc<MetricsRegistry>,
    breaker: Arc<CircuitBreakerService>,
    spawn_spec: SpawnSpec,
    max_workers: usize,
    default_timeout_ms: u64,
    workers: RwLock<HashMap<Uuid, WorkerState>>,
    by_terminal: RwLock<HashMap<Uuid, Uuid>>,
    event_tx: mpsc::Sender<TerminalEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<TerminalEvent>>>,
}

impl WorkerManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        backend: Arc<dyn TerminalBackend>,
        registry: Arc<AgentRegistry>,
        graph: Arc<TaskGraph>,
        locks: Arc<ResourceManager>,
        event_bus: Arc<EventBus>,
        metrics: Arc<MetricsRegistry>,
        breaker: Arc<CircuitBreakerService>,
        spawn_spec: SpawnSpec,
        max_workers: usize,
        default_timeout_ms: u64,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(1024);
        Self {
            backend,
            registry,
            graph,
            locks,
            event_bus,
            metrics,
            breaker,
            spawn_spec,
            max_workers,
            default_timeout_ms,
            workers: RwLock::new(HashMap::new()),
            by_terminal: RwLock::new(HashMap::new()),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
        }
    }

    /// Start the supervisor loop consuming terminal events.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let rx = manager.event_rx.lock().await.take();
            let Some(mut rx) = rx else {
                return;
            };
            while let Some(event) = rx.recv().await {
                match event {
                    TerminalEvent::Output {
                        terminal_id,
                        chunk,
                        stderr,
                    } => {
                        manager.handle_output(terminal_id, &chunk, stderr).await;
                    }
                    TerminalEvent::Exit {
                        terminal_id,
                        exit_code,
                    } => {
                        manager.handle_exit(terminal_id, exit_code).await;
                    }
                }
            }
        })
    }

    /// Spawn a new worker of the given type. Extra capabilities beyond the
    /// type tag are added to its manifest.
    pub async fn spawn_worker(
        self: &Arc<Self>,
        worker_type: &str,
        extra_capabilities: &[String],
        name: Option<String>,
    ) -> OrchResult<WorkerSnapshot> {
        if self.workers.read().await.len() >= self.max_workers {
            self.metrics.incr(names::SWARM_WORKERS_CREATION_FAILED);
            return Err(OrchestratorError::AtCapacity {
                limit: self.max_workers,
            });
        }

        let scope = CircuitScope::backend(self.backend.kind().as_str());
        if !self.breaker.allows(&scope).await {
            self.metrics.incr(names::SWARM_WORKERS_CREATION_FAILED);
            return Err(OrchestratorError::CircuitOpen {
                scope: scope.to_string(),
                retry_after: "backend circuit open".to_string(),
            });
        }

        let spec = self.spawn_spec.clone();
        let events = self.event_tx.clone();
        let backend = Arc::clone(&self.backend);
        let spawn_result = backoff::future::retry(
            ExponentialBackoff {
                max_elapsed_time: Some(std::time::Duration::from_secs(10)),
                ..ExponentialBackoff::default()
            },
            || {
                let spec = spec.clone();
                let events = events.clone();
                let backend = Arc::clone(&backend);
                async move {
                    backend
                        .spawn(spec, events)
                        .await
                        .map_err(backoff::Error::transient)
                }
            },
        )
        .await;

        let terminal_id = match spawn_result {
            Ok(id) => {
                self.breaker.record_success(&scope).await;
                id
            }
            Err(err) => {
                self.breaker.record_failure(&scope).await;
                self.metrics.incr(names::SWARM_WORKERS_CREATION_FAILED);
                return Err(err);
            }
        };

        let mut manifest = AgentManifest::new(worker_type).with_capability(worker_type);
        for cap in extra_capabilities {
            if !manifest.has_capability(cap) {
                manifest = manifest.with_capability(cap.clone());
            }
        }

        let worker_id = match self
            .registry
            .register(manifest, Arc::new(NoopAgentHandler))
            .await
        {
            Ok(id) => id,
            Err(err) => {
                let _ = self.backend.kill(terminal_id).await;
                self.metrics.incr(names::SWARM_WORKERS_CREATION_FAILED);
                return Err(err);
            }
        };

        let name = match name {
            Some(name) => name,
            None => self.generate_name(worker_id).await,
        };
        let now = Utc::now();
        let state = WorkerState {
            name: name.clone(),
            worker_type: worker_type.to_string(),
            terminal_id,
            parser: OutputParser::new(),
            current: None,
            queue: VecDeque::new(),
            recent_output: VecDeque::new(),
            paused: false,
            spawned_at: now,
            last_activity: now,
        };

        self.workers.write().await.insert(worker_id, state);
        self.by_terminal
            .write()
            .await
            .insert(terminal_id, worker_id);

        self.metrics.incr(names::SWARM_WORKERS_CREATED);
        self.metrics.gauge(
            names::SWARM_WORKERS_ACTIVE,
            self.workers.read().await.len() as f64,
        );
        self.event_bus
            .publish(EventPayload::WorkerSpawned {
                worker_id,
                name: name.clone(),
                worker_type: worker_type.to_string(),
            })
            .await;
        tracing::info!(%worker_id, name = %name, worker_type, "worker spawned");

        self.snapshot(worker_id)
            .await
            .ok_or_else(|| OrchestratorError::WorkerNotFound(worker_id.to_string()))
    }

    /// Route a graph task to a worker. The scheduler has already assigned
    /// the agent and acquired any type lock.
    pub async fn dispatch(
        self: &Arc<Self>,
        task: &Task,
        worker_id: Uuid,
        lock_resource: Option<String>,
    ) -> OrchResult<()> {
        let timeout_ms = task.timeout_ms.unwrap_or(self.default_timeout_ms);
        let unit = WorkUnit::Graph {
            task_id: task.id,
            command: Self::build_command(task),
            lock_resource,
            timeout_ms,
        };
        self.enqueue(worker_id, unit).await?;

        // Per-task timeout raises a synthetic failure
        let manager = Arc::clone(self);
        let task_id = task.id;
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(timeout_ms)).await;
            manager.on_timeout(worker_id, task_id, timeout_ms).await;
        });
        Ok(())
    }

    /// Execute a direct command on a worker and await its completion
    /// marker, bounded by `timeout_ms`.
    pub async fn execute(
        self: &Arc<Self>,
        worker_id: Uuid,
        command: impl Into<String>,
        timeout_ms: u64,
    ) -> OrchResult<Value> {
        let work_id = Uuid::new_v4();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.registry.assign(worker_id, work_id).await?;

        let unit = WorkUnit::Direct {
            work_id,
            command: command.into(),
            reply: reply_tx,
        };
        if let Err(err) = self.enqueue(worker_id, unit).await {
            let _ = self.registry.release(worker_id, work_id).await;
            return Err(err);
        }

        match tokio::time::timeout(std::time::Duration::from_millis(timeout_ms), reply_rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(message))) => Err(OrchestratorError::WorkerFailed(message)),
            Ok(Err(_)) => Err(OrchestratorError::WorkerFailed(
                "worker went away before completing".to_string(),
            )),
            Err(_) => {
                self.abort_work(worker_id, work_id, "timed out").await;
                Err(OrchestratorError::TaskTimeout {
                    task_id: work_id,
                    timeout_ms,
                })
            }
        }
    }

    /// Write raw text to a worker's terminal.
    pub async fn send(&self, worker_id: Uuid, text: &str) -> OrchResult<()> {
        let terminal_id = {
            let workers = self.workers.read().await;
            workers
                .get(&worker_id)
                .map(|w| w.terminal_id)
                .ok_or_else(|| OrchestratorError::WorkerNotFound(worker_id.to_string()))?
        };
        self.backend.write(terminal_id, text.as_bytes()).await
    }

    /// Stop a worker: kill its terminal, fail in-flight work, drain the
    /// queue, and unregister the agent.
    pub async fn stop_worker(self: &Arc<Self>, worker_id: Uuid) -> OrchResult<()> {
        let state = {
            let mut workers = self.workers.write().await;
            workers
                .remove(&worker_id)
                .ok_or_else(|| OrchestratorError::WorkerNotFound(worker_id.to_string()))?
        };
        self.by_terminal.write().await.remove(&state.terminal_id);
        let _ = self.backend.kill(state.terminal_id).await;

        self.fail_abandoned_work(worker_id, state, "worker stopped")
            .await;
        let _ = self.registry.unregister(worker_id).await;
        self.breaker.remove(&CircuitScope::worker(worker_id)).await;

        self.metrics.incr(names::SWARM_WORKERS_REMOVED);
        self.metrics.gauge(
            names::SWARM_WORKERS_ACTIVE,
            self.workers.read().await.len() as f64,
        );
        self.event_bus
            .publish(EventPayload::WorkerStopped { worker_id })
            .await;
        tracing::info!(%worker_id, "worker stopped");
        Ok(())
    }

    /// Restart a worker: stop it and spawn a replacement of the same type,
    /// preserving the name.
    pub async fn restart_worker(self: &Arc<Self>, worker_id: Uuid) -> OrchResult<WorkerSnapshot> {
        let (name, worker_type) = {
            let workers = self.workers.read().await;
            let state = workers
                .get(&worker_id)
                .ok_or_else(|| OrchestratorError::WorkerNotFound(worker_id.to_string()))?;
            (state.name.clone(), state.worker_type.clone())
        };

        self.stop_worker(worker_id).await?;
        let replacement = self
            .spawn_worker(&worker_type, &[], Some(name))
            .await?;

        self.event_bus
            .publish(EventPayload::WorkerRestarted {
                old_worker_id: worker_id,
                new_worker_id: replacement.worker_id,
            })
            .await;
        Ok(replacement)
    }

    /// Pause a worker: it finishes current work but starts nothing new.
    pub async fn pause_worker(&self, worker_id: Uuid) -> OrchResult<()> {
        {
            let mut workers = self.workers.write().await;
            let state = workers
                .get_mut(&worker_id)
                .ok_or_else(|| OrchestratorError::WorkerNotFound(worker_id.to_string()))?;
            state.paused = true;
        }
        self.registry.set_paused(worker_id, true).await
    }

    /// Resume a paused worker and kick its queue.
    pub async fn resume_worker(self: &Arc<Self>, worker_id: Uuid) -> OrchResult<()> {
        {
            let mut workers = self.workers.write().await;
            let state = workers
                .get_mut(&worker_id)
                .ok_or_else(|| OrchestratorError::WorkerNotFound(worker_id.to_string()))?;
            state.paused = false;
        }
        self.registry.set_paused(worker_id, false).await?;
        self.start_next(worker_id).await;
        Ok(())
    }

    /// Number of live workers.
    pub async fn worker_count(&self) -> usize {
        self.workers.read().await.len()
    }

    /// Snapshot of one worker.
    pub async fn snapshot(&self, worker_id: Uuid) -> Option<WorkerSnapshot> {
        let status = self
            .registry
            .get(worker_id)
            .await
            .map(|a| a.status)
            .unwrap_or(AgentStatus::Terminated);
        let workers = self.workers.read().await;
        workers.get(&worker_id).map(|state| WorkerSnapshot {
            worker_id,
            name: state.name.clone(),
            worker_type: state.worker_type.clone(),
            status,
            current_work: state.current.as_ref().map(|a| a.unit.work_id()),
            queued: state.queue.len(),
            paused: state.paused,
            spawned_at: state.spawned_at,
            last_activity: state.last_activity,
        })
    }

    /// Snapshots of every worker, oldest first.
    pub async fn list_workers(&self) -> Vec<WorkerSnapshot> {
        let ids: Vec<Uuid> = self.workers.read().await.keys().copied().collect();
        let mut snapshots = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(snapshot) = self.snapshot(id).await {
                snapshots.push(snapshot);
            }
        }
        snapshots.sort_by_key(|s| s.spawned_at);
        snapshots
    }

    /// Workers idle (no current or queued work) since before `idle_ms` ago.
    pub async fn idle_workers(&self, idle_ms: u64) -> Vec<Uuid> {
        let cutoff = Utc::now() - chrono::Duration::milliseconds(idle_ms as i64);
        let workers = self.workers.read().await;
        workers
            .iter()
            .filter(|(_, state)| {
                state.current.is_none() && state.queue.is_empty() && state.last_activity < cutoff
            })
            .map(|(id, _)| *id)
            .collect()
    }

    /// Resolve a worker by exact name.
    pub async fn find_by_name(&self, name: &str) -> Option<Uuid> {
        let workers = self.workers.read().await;
        workers
            .iter()
            .find(|(_, state)| state.name == name)
            .map(|(id, _)| *id)
    }

    /// Fuzzy-resolve a worker by name or type; falls back to substring and
    /// token-overlap matching.
    pub async fn fuzzy_find(&self, target: &str) -> Option<Uuid> {
        let target_lower = target.to_lowercase();
        let workers = self.workers.read().await;

        if let Some((id, _)) = workers
            .iter()
            .find(|(_, s)| s.name.eq_ignore_ascii_case(target))
        {
            return Some(*id);
        }
        if let Some((id, _)) = workers.iter().find(|(_, s)| {
            s.name.to_lowercase().contains(&target_lower)
                || s.worker_type.to_lowercase().contains(&target_lower)
        }) {
            return Some(*id);
        }
        // Best token overlap above the similarity floor
        workers
            .iter()
            .map(|(id, s)| {
                (
                    *id,
                    crate::domain::models::jaccard_similarity(&s.name.replace('-', " "), &target_lower),
                )
            })
            .filter(|(_, score)| *score >= 0.5)
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(id, _)| id)
    }

    /// Worker names for nearest-match suggestions.
    pub async fn worker_names(&self) -> Vec<String> {
        let workers = self.workers.read().await;
        workers.values().map(|s| s.name.clone()).collect()
    }

    /// Recent output tail for a worker.
    pub async fn recent_output(&self, worker_id: Uuid, limit: usize) -> Vec<String> {
        let workers = self.workers.read().await;
        workers
            .get(&worker_id)
            .map(|state| {
                state
                    .recent_output
                    .iter()
                    .rev()
                    .take(limit)
                    .rev()
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn build_command(task: &Task) -> String {
        match &task.payload {
            Value::String(s) => s.clone(),
            Value::Null => task.name.clone(),
            other => other.to_string(),
        }
    }

    async fn generate_name(&self, worker_id: Uuid) -> String {
        let bytes = worker_id.as_bytes();
        let base = format!(
            "{}-{}",
            ADJECTIVES[bytes[0] as usize % ADJECTIVES.len()],
            NOUNS[bytes[1] as usize % NOUNS.len()]
        );
        let workers = self.workers.read().await;
        if workers.values().any(|s| s.name == base) {
            format!("{base}-{}", &worker_id.simple().to_string()[..4])
        } else {
            base
        }
    }

    async fn enqueue(self: &Arc<Self>, worker_id: Uuid, unit: WorkUnit) -> OrchResult<()> {
        {
            let mut workers = self.workers.write().await;
            let state = workers
                .get_mut(&worker_id)
                .ok_or_else(|| OrchestratorError::WorkerNotFound(worker_id.to_string()))?;
            if state.queue.len() >= QUEUE_CAPACITY {
                return Err(OrchestratorError::AtCapacity {
                    limit: QUEUE_CAPACITY,
                });
            }
            state.queue.push_back(unit);
        }
        self.start_next(worker_id).await;
        Ok(())
    }

    /// Begin the next queued unit if the worker is free and unpaused.
    async fn start_next(self: &Arc<Self>, worker_id: Uuid) {
        let started = {
            let mut workers = self.workers.write().await;
            let Some(state) = workers.get_mut(&worker_id) else {
                return;
            };
            if state.current.is_some() || state.paused {
                return;
            }
            let Some(unit) = state.queue.pop_front() else {
                return;
            };
            state.parser.reset();
            let command = unit.command().to_string();
            let terminal_id = state.terminal_id;
            state.current = Some(ActiveWork {
                unit,
                started_at: Instant::now(),
            });
            (terminal_id, command)
        };

        let (terminal_id, command) = started;
        let payload = format!("{command}\n");
        if let Err(err) = self.backend.write(terminal_id, payload.as_bytes()).await {
            tracing::warn!(%worker_id, %err, "failed to write command to worker");
            Box::pin(self.finish_current(worker_id, Err(format!("transport: {err}")))).await;
        }
    }

    async fn handle_output(self: &Arc<Self>, terminal_id: Uuid, chunk: &[u8], stderr: bool) {
        let Some(worker_id) = self.by_terminal.read().await.get(&terminal_id).copied() else {
            return;
        };
        self.registry.heartbeat(worker_id).await;

        let lines = {
            let mut workers = self.workers.write().await;
            let Some(state) = workers.get_mut(&worker_id) else {
                return;
            };
            state.last_activity = Utc::now();
            let parsed = state.parser.feed(chunk);
            for line in &parsed {
                if let ParsedLine::Output(text) | ParsedLine::Diagnostic(text) = line {
                    if state.recent_output.len() == OUTPUT_TAIL {
                        state.recent_output.pop_front();
                    }
                    state.recent_output.push_back(text.clone());
                }
            }
            parsed
        };

        for line in lines {
            match line {
                ParsedLine::Completion(value) => {
                    self.finish_current(worker_id, Ok(value)).await;
                }
                ParsedLine::Error(message) => {
                    self.finish_current(worker_id, Err(message)).await;
                }
                ParsedLine::Output(text) if stderr => {
                    // stderr output is a worker failure signal
                    self.finish_current(worker_id, Err(format!("stderr: {text}")))
                        .await;
                }
                ParsedLine::Output(_) | ParsedLine::Diagnostic(_) => {}
            }
        }
    }

    async fn handle_exit(self: &Arc<Self>, terminal_id: Uuid, exit_code: Option<i32>) {
        let Some(worker_id) = self.by_terminal.write().await.remove(&terminal_id) else {
            // Already stopped deliberately
            return;
        };

        let state = {
            let mut workers = self.workers.write().await;
            workers.remove(&worker_id)
        };
        let Some(state) = state else {
            return;
        };

        tracing::warn!(%worker_id, ?exit_code, "worker terminal exited unexpectedly");
        self.registry.mark_error(worker_id).await;
        self.breaker
            .record_failure(&CircuitScope::worker(worker_id))
            .await;
        self.event_bus
            .publish(EventPayload::WorkerErrored {
                worker_id,
                error: format!("terminal exited with {exit_code:?}"),
            })
            .await;

        let reason = match exit_code {
            Some(code) => format!("worker exited with code {code}"),
            None => "worker exited".to_string(),
        };
        self.fail_abandoned_work(worker_id, state, &reason).await;

        // The process is gone; drop the agent record so eligibility sets
        // and the pool floor see the loss
        let _ = self.registry.unregister(worker_id).await;
        self.breaker.remove(&CircuitScope::worker(worker_id)).await;

        self.metrics.incr(names::SWARM_WORKERS_REMOVED);
        self.metrics.gauge(
            names::SWARM_WORKERS_ACTIVE,
            self.workers.read().await.len() as f64,
        );
    }

    /// Resolve the worker's active unit with a result and start the next.
    async fn finish_current(self: &Arc<Self>, worker_id: Uuid, result: Result<Value, String>) {
        let active = {
            let mut workers = self.workers.write().await;
            let Some(state) = workers.get_mut(&worker_id) else {
                return;
            };
            let Some(active) = state.current.take() else {
                return;
            };
            state.parser.reset();
            active
        };

        let elapsed_ms = active.started_at.elapsed().as_secs_f64() * 1000.0;
        match active.unit {
            WorkUnit::Graph {
                task_id,
                lock_resource,
                ..
            } => {
                match &result {
                    Ok(value) => {
                        let _ = self.graph.on_complete(task_id, value.clone()).await;
                        self.registry.record_success(worker_id, elapsed_ms).await;
                        self.breaker
                            .record_success(&CircuitScope::worker(worker_id))
                            .await;
                    }
                    Err(message) => {
                        let _ = self.graph.on_fail(task_id, message.clone()).await;
                        self.registry.record_failure(worker_id).await;
                        self.breaker
                            .record_failure(&CircuitScope::worker(worker_id))
                            .await;
                    }
                }
                let _ = self.registry.release(worker_id, task_id).await;
                if let Some(resource) = lock_resource {
                    let _ = self.locks.release(&resource, &task_id.to_string()).await;
                }
            }
            WorkUnit::Direct { work_id, reply, .. } => {
                match &result {
                    Ok(_) => self.registry.record_success(worker_id, elapsed_ms).await,
                    Err(_) => self.registry.record_failure(worker_id).await,
                }
                let _ = self.registry.release(worker_id, work_id).await;
                let _ = reply.send(result);
            }
        }

        self.start_next(worker_id).await;
    }

    /// Synthetic failure when a graph task outlives its timeout, whether
    /// running or still queued behind other work.
    async fn on_timeout(self: &Arc<Self>, worker_id: Uuid, task_id: Uuid, timeout_ms: u64) {
        enum Where {
            Active,
            Queued(WorkUnit),
            Gone,
        }

        let location = {
            let mut workers = self.workers.write().await;
            match workers.get_mut(&worker_id) {
                Some(state)
                    if state
                        .current
                        .as_ref()
                        .is_some_and(|active| active.unit.work_id() == task_id) =>
                {
                    Where::Active
                }
                Some(state) => {
                    match state
                        .queue
                        .iter()
                        .position(|u| u.work_id() == task_id)
                        .and_then(|idx| state.queue.remove(idx))
                    {
                        Some(unit) => Where::Queued(unit),
                        None => Where::Gone,
                    }
                }
                None => Where::Gone,
            }
        };

        let reason = format!("task exceeded timeout of {timeout_ms}ms");
        match location {
            Where::Gone => return,
            Where::Active => {
                self.event_bus
                    .publish(EventPayload::TaskTimedOut {
                        task_id,
                        timeout_ms,
                    })
                    .await;
                self.finish_current(worker_id, Err(reason)).await;
            }
            Where::Queued(WorkUnit::Graph { lock_resource, .. }) => {
                self.event_bus
                    .publish(EventPayload::TaskTimedOut {
                        task_id,
                        timeout_ms,
                    })
                    .await;
                let _ = self.graph.on_fail(task_id, reason).await;
                let _ = self.registry.release(worker_id, task_id).await;
                if let Some(resource) = lock_resource {
                    let _ = self.locks.release(&resource, &task_id.to_string()).await;
                }
            }
            Where::Queued(WorkUnit::Direct { reply, .. }) => {
                let _ = self.registry.release(worker_id, task_id).await;
                let _ = reply.send(Err(reason));
            }
        }
    }

    /// Abort a specific active unit (direct work whose caller timed out).
    async fn abort_work(self: &Arc<Self>, worker_id: Uuid, work_id: Uuid, reason: &str) {
        let matches = {
            let workers = self.workers.read().await;
            workers
                .get(&worker_id)
                .and_then(|state| state.current.as_ref())
                .is_some_and(|active| active.unit.work_id() == work_id)
        };
        if matches {
            self.finish_current(worker_id, Err(reason.to_string())).await;
        }
    }

    /// Abort whatever a worker is doing, leaving it alive for reassignment.
    pub async fn abort_current(self: &Arc<Self>, worker_id: Uuid, reason: &str) {
        let has_current = {
            let workers = self.workers.read().await;
            workers
                .get(&worker_id)
                .is_some_and(|state| state.current.is_some())
        };
        if has_current {
            self.finish_current(worker_id, Err(reason.to_string())).await;
        }
    }

    /// Fail current and queued units for a worker that is going away.
    async fn fail_abandoned_work(self: &Arc<Self>, worker_id: Uuid, state: WorkerState, reason: &str) {
        let mut units: Vec<WorkUnit> = Vec::new();
        if let Some(active) = state.current {
            units.push(active.unit);
        }
        units.extend(state.queue);

        for unit in units {
            match unit {
                WorkUnit::Graph {
                    task_id,
                    lock_resource,
                    ..
                } => {
                    let _ = self.graph.on_fail(task_id, reason).await;
                    let _ = self.registry.release(worker_id, task_id).await;
                    if let Some(resource) = lock_resource {
                        let _ = self.locks.release(&resource, &task_id.to_string()).await;
                    }
                }
                WorkUnit::Direct { work_id, reply, .. } => {
                    let _ = self.registry.release(worker_id, work_id).await;
                    let _ = reply.send(Err(reason.to_string()));
                }
            }
        }
    }
}

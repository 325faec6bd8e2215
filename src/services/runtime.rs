//! Orchestration runtime: the composition root.
//!
//! Builds every component, wires them together, and supervises the
//! periodic loops (scheduler ticks, auto-scaling, heartbeats, store
//! cleanup). Also owns the quick-access key map handed to the tool-call
//! server.

use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::domain::error::{OrchResult, OrchestratorError};
use crate::domain::models::{Config, WorkerContext};
use crate::domain::ports::{MemoryStore, SpawnSpec, TerminalBackend};
use crate::infrastructure::store::SqliteStore;
use crate::infrastructure::terminal::backend_for;
use crate::services::agent_registry::AgentRegistry;
use crate::services::circuit_breaker::CircuitBreakerService;
use crate::services::event_bus::{EventBus, EventPayload};
use crate::services::load_balancer::LoadBalancer;
use crate::services::memory_service::MemoryService;
use crate::services::metrics::MetricsRegistry;
use crate::services::resource_manager::ResourceManager;
use crate::services::scheduler::Scheduler;
use crate::services::swarm_coordinator::SwarmCoordinator;
use crate::services::task_graph::TaskGraph;
use crate::services::worker_manager::{WorkerManager, WorkerSnapshot};

/// Cadence of store cleanup and metrics snapshots.
const MAINTENANCE_INTERVAL_S: u64 = 600;

/// Number of quick-access slots (keys 1..=9).
const QUICK_ACCESS_SLOTS: usize = 9;

/// The assembled engine.
pub struct OrchflowRuntime {
    pub config: Config,
    pub event_bus: Arc<EventBus>,
    pub metrics: Arc<MetricsRegistry>,
    pub breaker: Arc<CircuitBreakerService>,
    pub locks: Arc<ResourceManager>,
    pub graph: Arc<TaskGraph>,
    pub registry: Arc<AgentRegistry>,
    pub balancer: Arc<LoadBalancer>,
    pub worker_manager: Arc<WorkerManager>,
    pub scheduler: Arc<Scheduler>,
    pub swarm: Arc<SwarmCoordinator>,
    pub memory: Arc<MemoryService>,
    quick_access: Mutex<[Option<Uuid>; QUICK_ACCESS_SLOTS]>,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl OrchflowRuntime {
    /// Build the runtime with the configured SQLite store and terminal
    /// backend.
    pub async fn new(config: Config) -> OrchResult<Arc<Self>> {
        let store = Arc::new(
            SqliteStore::open(&config.database.path, config.database.max_connections).await?,
        );
        let backend = backend_for(config.terminal.kind);
        Ok(Self::assemble(config, store, backend))
    }

    /// Build the runtime over explicit store and backend implementations.
    pub fn assemble(
        config: Config,
        store: Arc<dyn MemoryStore>,
        backend: Arc<dyn TerminalBackend>,
    ) -> Arc<Self> {
        let event_bus = Arc::new(EventBus::with_defaults());
        let metrics = Arc::new(MetricsRegistry::new());
        let breaker = Arc::new(CircuitBreakerService::with_defaults());
        let locks = Arc::new(ResourceManager::new(
            config.locks.clone(),
            Arc::clone(&event_bus),
        ));
        let graph = Arc::new(TaskGraph::new(
            Arc::clone(&event_bus),
            Arc::clone(&metrics),
        ));
        let registry = Arc::new(AgentRegistry::new(Arc::clone(&metrics)));
        let balancer = Arc::new(LoadBalancer::new(
            config.load_balancer.discipline,
            Arc::clone(&metrics),
        ));

        let spawn_spec = SpawnSpec::new(&config.terminal.shell)
            .with_size(config.terminal.cols, config.terminal.rows);
        let worker_manager = Arc::new(WorkerManager::new(
            backend,
            Arc::clone(&registry),
            Arc::clone(&graph),
            Arc::clone(&locks),
            Arc::clone(&event_bus),
            Arc::clone(&metrics),
            Arc::clone(&breaker),
            spawn_spec,
            config.runtime.max_workers,
            config.runtime.task_timeout_ms,
        ));

        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&graph),
            Arc::clone(&registry),
            Arc::clone(&locks),
            Arc::clone(&worker_manager),
            Arc::clone(&breaker),
            Arc::clone(&metrics),
            config.scheduler.discipline,
            config.scheduler.tick_ms,
        ));

        let swarm = Arc::new(SwarmCoordinator::new(
            Arc::clone(&worker_manager),
            Arc::clone(&registry),
            Arc::clone(&balancer),
            Arc::clone(&graph),
            Arc::clone(&event_bus),
            Arc::clone(&metrics),
            config.runtime.clone(),
        ));

        let memory = Arc::new(MemoryService::new(
            store,
            Arc::clone(&breaker),
            config.memory.namespace.clone(),
            config.memory.default_ttl_s,
        ));

        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            config,
            event_bus,
            metrics,
            breaker,
            locks,
            graph,
            registry,
            balancer,
            worker_manager,
            scheduler,
            swarm,
            memory,
            quick_access: Mutex::new([None; QUICK_ACCESS_SLOTS]),
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Start supervision: the worker supervisor, scheduler loop,
    /// auto-scaler, heartbeat monitor, and maintenance loop. Reconciles
    /// orphaned tasks and brings the pool up to `min_workers`.
    pub async fn start(self: &Arc<Self>) -> OrchResult<()> {
        let shutdown_rx = self.shutdown_tx.subscribe();
        let mut handles = self.handles.lock().await;

        handles.push(self.worker_manager.start());
        handles.push(Arc::clone(&self.scheduler).run_loop(shutdown_rx.clone()));
        handles.push(Arc::clone(&self.swarm).run_autoscaler(shutdown_rx.clone()));
        handles.push(Arc::clone(&self.swarm).run_heartbeat_monitor(shutdown_rx.clone()));
        handles.push(self.run_maintenance(shutdown_rx.clone()));
        handles.push(self.run_quick_access_reaper());
        drop(handles);

        let reconciled = self
            .graph
            .reconcile_orphans(&self.registry.live_ids().await)
            .await;
        if reconciled > 0 {
            tracing::info!(reconciled, "reverted orphaned running tasks");
        }

        while self.worker_manager.worker_count().await < self.config.runtime.min_workers {
            let snapshot = self.worker_manager.spawn_worker("dev", &[], None).await?;
            self.assign_quick_key(snapshot.worker_id).await;
        }
        tracing::info!(
            workers = self.worker_manager.worker_count().await,
            "orchflow runtime started"
        );
        Ok(())
    }

    /// Stop loops, drain workers, and flush a final metrics snapshot.
    pub async fn shutdown(self: &Arc<Self>) {
        let _ = self.shutdown_tx.send(true);

        for snapshot in self.worker_manager.list_workers().await {
            let _ = self.worker_manager.stop_worker(snapshot.worker_id).await;
        }

        let metrics = serde_json::to_value(self.metrics.snapshot()).unwrap_or_default();
        let _ = self.memory.record_metrics_snapshot(&metrics).await;
        let _ = self.memory.cleanup().await;

        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            handle.abort();
        }
        tracing::info!("orchflow runtime stopped");
    }

    /// Spawn a worker, assign its quick-access key, and persist its
    /// initial context.
    pub async fn spawn_worker(
        self: &Arc<Self>,
        worker_type: &str,
        task_description: &str,
    ) -> OrchResult<(WorkerSnapshot, Option<u8>)> {
        let snapshot = self
            .worker_manager
            .spawn_worker(worker_type, &[], None)
            .await?;
        let key = self.assign_quick_key(snapshot.worker_id).await;

        let context = WorkerContext::new(
            snapshot.worker_id,
            snapshot.name.clone(),
            task_description,
        );
        let _ = self.memory.save_worker_context(&context).await;
        Ok((snapshot, key))
    }

    /// Cancel a task and signal whichever workers were running it; the
    /// workers survive for reassignment.
    pub async fn cancel_task(self: &Arc<Self>, task_id: Uuid) -> OrchResult<()> {
        let assigned = self.graph.cancel(task_id).await?;
        for worker_id in assigned {
            self.worker_manager
                .abort_current(worker_id, "task cancelled")
                .await;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Quick-access keys
    // ------------------------------------------------------------------

    /// Assign the first available key 1..=9; None when all are taken.
    pub async fn assign_quick_key(&self, worker_id: Uuid) -> Option<u8> {
        let mut slots = self.quick_access.lock().await;
        if slots.iter().flatten().any(|id| *id == worker_id) {
            return slots
                .iter()
                .position(|slot| *slot == Some(worker_id))
                .map(|i| i as u8 + 1);
        }
        let free = slots.iter().position(Option::is_none)?;
        slots[free] = Some(worker_id);
        Some(free as u8 + 1)
    }

    /// Reclaim a worker's key.
    pub async fn release_quick_key(&self, worker_id: Uuid) {
        let mut slots = self.quick_access.lock().await;
        for slot in slots.iter_mut() {
            if *slot == Some(worker_id) {
                *slot = None;
            }
        }
    }

    /// The key assigned to a worker, if any.
    pub async fn quick_key_for(&self, worker_id: Uuid) -> Option<u8> {
        let slots = self.quick_access.lock().await;
        slots
            .iter()
            .position(|slot| *slot == Some(worker_id))
            .map(|i| i as u8 + 1)
    }

    /// The worker mapped to a key.
    pub async fn worker_for_key(&self, key: u8) -> Option<Uuid> {
        if !(1..=QUICK_ACCESS_SLOTS as u8).contains(&key) {
            return None;
        }
        let slots = self.quick_access.lock().await;
        slots[key as usize - 1]
    }

    /// The full key map for session snapshots.
    pub async fn quick_access_map(&self) -> Vec<(u8, Uuid)> {
        let slots = self.quick_access.lock().await;
        slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.map(|id| (i as u8 + 1, id)))
            .collect()
    }

    /// Resolve a worker reference: a quick-access digit, a UUID, or a
    /// (fuzzy) name.
    pub async fn resolve_worker(&self, reference: &str) -> OrchResult<Uuid> {
        if let Ok(key) = reference.parse::<u8>() {
            if let Some(worker_id) = self.worker_for_key(key).await {
                return Ok(worker_id);
            }
        }
        if let Ok(worker_id) = Uuid::parse_str(reference) {
            if self.worker_manager.snapshot(worker_id).await.is_some() {
                return Ok(worker_id);
            }
        }
        if let Some(worker_id) = self.worker_manager.find_by_name(reference).await {
            return Ok(worker_id);
        }
        self.worker_manager
            .fuzzy_find(reference)
            .await
            .ok_or_else(|| OrchestratorError::WorkerNotFound(reference.to_string()))
    }

    // ------------------------------------------------------------------
    // Supervision internals
    // ------------------------------------------------------------------

    fn run_maintenance(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let runtime = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(
                MAINTENANCE_INTERVAL_S,
            ));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let _ = runtime.memory.cleanup().await;
                        let snapshot =
                            serde_json::to_value(runtime.metrics.snapshot()).unwrap_or_default();
                        let _ = runtime.memory.record_metrics_snapshot(&snapshot).await;
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

    /// Reclaims quick-access keys when workers go away.
    fn run_quick_access_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let runtime = Arc::clone(self);
        let mut rx = self.event_bus.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                match event.payload {
                    EventPayload::WorkerStopped { worker_id }
                    | EventPayload::WorkerErrored { worker_id, .. } => {
                        runtime.release_quick_key(worker_id).await;
                    }
                    _ => {}
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::store::InMemoryStore;
    use crate::infrastructure::terminal::ProcessBackend;

    fn runtime() -> Arc<OrchflowRuntime> {
        OrchflowRuntime::assemble(
            Config::default(),
            Arc::new(InMemoryStore::new()),
            Arc::new(ProcessBackend::new()),
        )
    }

    #[tokio::test]
    async fn test_quick_keys_first_available_order() {
        let runtime = runtime();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(runtime.assign_quick_key(a).await, Some(1));
        assert_eq!(runtime.assign_quick_key(b).await, Some(2));

        // Reassigning the same worker returns its existing key
        assert_eq!(runtime.assign_quick_key(a).await, Some(1));

        runtime.release_quick_key(a).await;
        let c = Uuid::new_v4();
        // Slot 1 is free again and handed out first
        assert_eq!(runtime.assign_quick_key(c).await, Some(1));
        assert_eq!(runtime.worker_for_key(1).await, Some(c));
        assert_eq!(runtime.worker_for_key(2).await, Some(b));
    }

    #[tokio::test]
    async fn test_quick_keys_exhaust() {
        let runtime = runtime();
        for i in 0..9 {
            assert_eq!(
                runtime.assign_quick_key(Uuid::new_v4()).await,
                Some(i + 1)
            );
        }
        assert_eq!(runtime.assign_quick_key(Uuid::new_v4()).await, None);
    }

    #[tokio::test]
    async fn test_worker_for_key_bounds() {
        let runtime = runtime();
        assert_eq!(runtime.worker_for_key(0).await, None);
        assert_eq!(runtime.worker_for_key(10).await, None);
    }
}

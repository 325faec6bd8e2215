//! Scheduler.
//!
//! Drains the graph's ready-set once per tick and pairs tasks with
//! eligible agents under the active discipline. Disciplines are a fixed
//! tagged set; switching is an atomic swap. Every discipline respects
//! capability matching, the health gate, and per-agent capacity.
//!
//! Type locks are acquired try-once per tick: a contended task simply
//! stays `scheduled` and is retried next tick, which never consumes its
//! retry budget.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use uuid::Uuid;

use crate::domain::error::OrchestratorError;
use crate::domain::models::{Agent, LockMode, SchedulingDiscipline, Task};
use crate::services::agent_registry::AgentRegistry;
use crate::services::circuit_breaker::{CircuitBreakerService, CircuitScope};
use crate::services::metrics::{names, MetricsRegistry};
use crate::services::resource_manager::ResourceManager;
use crate::services::task_graph::TaskGraph;
use crate::services::worker_manager::WorkerManager;

/// Pairs ready tasks with agents and hands them to the worker manager.
pub struct Scheduler {
    graph: Arc<TaskGraph>,
    registry: Arc<AgentRegistry>,
    locks: Arc<ResourceManager>,
    worker_manager: Arc<WorkerManager>,
    breaker: Arc<CircuitBreakerService>,
    metrics: Arc<MetricsRegistry>,
    discipline: RwLock<SchedulingDiscipline>,
    tick_ms: u64,
    rr_cursor: Mutex<usize>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        graph: Arc<TaskGraph>,
        registry: Arc<AgentRegistry>,
        locks: Arc<ResourceManager>,
        worker_manager: Arc<WorkerManager>,
        breaker: Arc<CircuitBreakerService>,
        metrics: Arc<MetricsRegistry>,
        discipline: SchedulingDiscipline,
        tick_ms: u64,
    ) -> Self {
        Self {
            graph,
            registry,
            locks,
            worker_manager,
            breaker,
            metrics,
            discipline: RwLock::new(discipline),
            tick_ms,
            rr_cursor: Mutex::new(0),
        }
    }

    /// The active discipline.
    pub async fn discipline(&self) -> SchedulingDiscipline {
        *self.discipline.read().await
    }

    /// Atomically switch disciplines.
    pub async fn set_discipline(&self, discipline: SchedulingDiscipline) {
        *self.discipline.write().await = discipline;
    }

    /// Run the periodic tick loop until `shutdown` flips to true.
    pub fn run_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_millis(self.tick_ms));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.tick().await;
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

    /// One scheduling pass. Returns the number of assignments made.
    /// A tick over unchanged state makes no assignments.
    pub async fn tick(&self) -> usize {
        let _timer = self.metrics.timer(names::SCHEDULE_TICK_TIME);

        let ready = self.graph.ready_set().await;
        if ready.is_empty() {
            return 0;
        }

        let mut agents = Vec::new();
        for agent in self.registry.available_agents().await {
            if self.breaker.allows(&CircuitScope::worker(agent.id)).await {
                agents.push(agent);
            }
        }
        if agents.is_empty() {
            return 0;
        }

        let discipline = *self.discipline.read().await;
        let pairs = match discipline {
            SchedulingDiscipline::Fifo => Self::schedule_fifo(&ready, &agents),
            SchedulingDiscipline::Priority => Self::schedule_priority(&ready, &agents),
            SchedulingDiscipline::RoundRobin => self.schedule_round_robin(&ready, &agents).await,
            SchedulingDiscipline::ShortestJobFirst => Self::schedule_sjf(&ready, &agents),
        };

        let mut assigned = 0;
        for (task, agent_id) in pairs {
            if self.assign_pair(&task, agent_id).await {
                assigned += 1;
            }
        }
        assigned
    }

    /// Agents able to take `task` given extra load assigned this tick.
    fn eligible<'a>(
        task: &Task,
        agents: &'a [Agent],
        extra_load: &HashMap<Uuid, usize>,
    ) -> Vec<&'a Agent> {
        agents
            .iter()
            .filter(|agent| {
                agent.can_execute(&task.task_type, &task.agent_requirements.capabilities)
            })
            .filter(|agent| {
                task.agent_requirements
                    .agent_type
                    .as_deref()
                    .is_none_or(|ty| agent.agent_type() == ty)
            })
            .filter(|agent| {
                let extra = extra_load.get(&agent.id).copied().unwrap_or(0);
                agent.current_tasks.len() + extra
                    < agent.manifest.resource_limits.max_concurrent_tasks
            })
            .collect()
    }

    /// Submission order; the first eligible unloaded agent wins.
    fn schedule_fifo(ready: &[Task], agents: &[Agent]) -> Vec<(Task, Uuid)> {
        let mut extra: HashMap<Uuid, usize> = HashMap::new();
        let mut pairs = Vec::new();
        for task in ready {
            let eligible = Self::eligible(task, agents, &extra);
            let idle = eligible.iter().find(|agent| {
                agent.current_tasks.len() + extra.get(&agent.id).copied().unwrap_or(0) == 0
            });
            if let Some(agent) = idle.or(eligible.first()) {
                *extra.entry(agent.id).or_insert(0) += 1;
                pairs.push((task.clone(), agent.id));
            }
        }
        pairs
    }

    /// Priority descending; agents scored on success, health, and speed.
    fn schedule_priority(ready: &[Task], agents: &[Agent]) -> Vec<(Task, Uuid)> {
        let mut ordered: Vec<&Task> = ready.iter().collect();
        ordered.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut extra: HashMap<Uuid, usize> = HashMap::new();
        let mut pairs = Vec::new();
        for task in ordered {
            let eligible = Self::eligible(task, agents, &extra);
            if eligible.is_empty() {
                continue;
            }

            let max_speed = eligible
                .iter()
                .map(|a| Self::speed(a))
                .fold(0.0_f64, f64::max);
            let best = eligible.iter().max_by(|a, b| {
                let score_a = Self::priority_score(a, max_speed);
                let score_b = Self::priority_score(b, max_speed);
                score_a
                    .partial_cmp(&score_b)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            if let Some(agent) = best {
                *extra.entry(agent.id).or_insert(0) += 1;
                pairs.push((task.clone(), agent.id));
            }
        }
        pairs
    }

    fn speed(agent: &Agent) -> f64 {
        let avg = agent.metrics.average_task_time_ms;
        if avg <= 0.0 {
            // No history yet: treated as fast as the fastest
            f64::INFINITY
        } else {
            1.0 / avg
        }
    }

    fn priority_score(agent: &Agent, max_speed: f64) -> f64 {
        let speed = Self::speed(agent);
        let speed_score = if max_speed <= 0.0 || !max_speed.is_finite() {
            if speed.is_finite() { 0.0 } else { 1.0 }
        } else if speed.is_finite() {
            speed / max_speed
        } else {
            1.0
        };
        0.4 * agent.metrics.success_rate()
            + 0.3 * (f64::from(agent.metrics.health) / 100.0)
            + 0.3 * speed_score
    }

    /// Rolling index across agents; advance until an eligible one is found.
    async fn schedule_round_robin(&self, ready: &[Task], agents: &[Agent]) -> Vec<(Task, Uuid)> {
        let mut cursor = self.rr_cursor.lock().await;
        let mut extra: HashMap<Uuid, usize> = HashMap::new();
        let mut pairs = Vec::new();

        for task in ready {
            let mut chosen = None;
            for offset in 0..agents.len() {
                let idx = (*cursor + offset) % agents.len();
                let agent = &agents[idx];
                let eligible = Self::eligible(task, std::slice::from_ref(agent), &extra);
                if !eligible.is_empty() {
                    chosen = Some((idx, agent.id));
                    break;
                }
            }
            if let Some((idx, agent_id)) = chosen {
                *cursor = (idx + 1) % agents.len();
                *extra.entry(agent_id).or_insert(0) += 1;
                pairs.push((task.clone(), agent_id));
            }
        }
        pairs
    }

    /// Shortest timeout first; the historically fastest agent wins.
    fn schedule_sjf(ready: &[Task], agents: &[Agent]) -> Vec<(Task, Uuid)> {
        let mut ordered: Vec<&Task> = ready.iter().collect();
        ordered.sort_by_key(|t| t.timeout_ms.unwrap_or(u64::MAX));

        let mut extra: HashMap<Uuid, usize> = HashMap::new();
        let mut pairs = Vec::new();
        for task in ordered {
            let eligible = Self::eligible(task, agents, &extra);
            let fastest = eligible.iter().min_by(|a, b| {
                a.metrics
                    .average_task_time_ms
                    .partial_cmp(&b.metrics.average_task_time_ms)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.id.cmp(&b.id))
            });
            if let Some(agent) = fastest {
                *extra.entry(agent.id).or_insert(0) += 1;
                pairs.push((task.clone(), agent.id));
            }
        }
        pairs
    }

    /// Acquire the type lock, transition the task, and hand off. Any step
    /// failing unwinds the previous ones so the task keeps its budget.
    async fn assign_pair(&self, task: &Task, agent_id: Uuid) -> bool {
        let lock_resource = task
            .agent_requirements
            .agent_type
            .as_ref()
            .map(|ty| format!("agent-type:{ty}"));
        let holder = task.id.to_string();

        if let Some(ref resource) = lock_resource {
            match self
                .locks
                .acquire(resource, &holder, LockMode::Exclusive, task.priority, Some(0))
                .await
            {
                Ok(()) => {}
                Err(OrchestratorError::LockTimeout { .. }) => {
                    // Contended: no progress this tick, not an error
                    return false;
                }
                Err(err) => {
                    tracing::warn!(task_id = %task.id, %err, "lock acquisition failed");
                    return false;
                }
            }
        }

        if let Err(err) = self.registry.assign(agent_id, task.id).await {
            tracing::debug!(task_id = %task.id, %agent_id, %err, "agent refused assignment");
            self.unwind_lock(&lock_resource, &holder).await;
            return false;
        }

        if let Err(err) = self.graph.mark_running(task.id, agent_id).await {
            tracing::debug!(task_id = %task.id, %err, "task no longer schedulable");
            let _ = self.registry.release(agent_id, task.id).await;
            self.unwind_lock(&lock_resource, &holder).await;
            return false;
        }

        if let Err(err) = self
            .worker_manager
            .dispatch(task, agent_id, lock_resource.clone())
            .await
        {
            tracing::warn!(task_id = %task.id, %agent_id, %err, "dispatch failed");
            let _ = self.registry.release(agent_id, task.id).await;
            let _ = self.graph.on_fail(task.id, format!("dispatch: {err}")).await;
            self.unwind_lock(&lock_resource, &holder).await;
            return false;
        }

        true
    }

    async fn unwind_lock(&self, lock_resource: &Option<String>, holder: &str) {
        if let Some(resource) = lock_resource {
            let _ = self.locks.release(resource, holder).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{AgentManifest, AgentStatus, TaskPriority};

    fn agent_with(name: &str, health: u8, avg_ms: f64, success: u64, failed: u64) -> Agent {
        let manifest = AgentManifest::new(name)
            .with_capability("code")
            .with_max_concurrent(4);
        let mut agent = Agent::from_manifest(manifest);
        agent.status = AgentStatus::Ready;
        agent.metrics.health = health;
        agent.metrics.average_task_time_ms = avg_ms;
        agent.metrics.completed = success;
        agent.metrics.failed = failed;
        agent
    }

    #[test]
    fn test_fifo_prefers_idle_agents() {
        let mut busy = agent_with("busy", 100, 100.0, 5, 0);
        busy.current_tasks.insert(Uuid::new_v4());
        let idle = agent_with("idle", 100, 100.0, 5, 0);

        let tasks = vec![Task::new("t", "code")];
        let pairs = Scheduler::schedule_fifo(&tasks, &[busy.clone(), idle.clone()]);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].1, idle.id);
    }

    #[test]
    fn test_priority_orders_critical_first() {
        let agent = agent_with("a", 100, 100.0, 5, 0);
        let normal = Task::new("normal", "code").with_priority(TaskPriority::Normal);
        let critical = Task::new("critical", "code").with_priority(TaskPriority::Critical);

        let pairs = Scheduler::schedule_priority(&[normal, critical.clone()], &[agent]);
        assert_eq!(pairs[0].0.id, critical.id);
    }

    #[test]
    fn test_priority_scores_prefer_healthy_successful() {
        let strong = agent_with("strong", 100, 100.0, 20, 0);
        let weak = agent_with("weak", 40, 100.0, 5, 15);
        let task = Task::new("t", "code").with_priority(TaskPriority::High);

        let pairs = Scheduler::schedule_priority(&[task], &[weak, strong.clone()]);
        assert_eq!(pairs[0].1, strong.id);
    }

    #[test]
    fn test_sjf_orders_by_timeout() {
        let agent = agent_with("a", 100, 100.0, 5, 0);
        let slow = Task::new("slow", "code").with_timeout_ms(60_000);
        let quick = Task::new("quick", "code").with_timeout_ms(1_000);
        let unbounded = Task::new("unbounded", "code");

        let pairs =
            Scheduler::schedule_sjf(&[unbounded.clone(), slow.clone(), quick.clone()], &[agent]);
        assert_eq!(pairs[0].0.id, quick.id);
        assert_eq!(pairs[1].0.id, slow.id);
        assert_eq!(pairs[2].0.id, unbounded.id);
    }

    #[test]
    fn test_sjf_picks_fastest_agent() {
        let fast = agent_with("fast", 100, 50.0, 10, 0);
        let slow = agent_with("slow", 100, 900.0, 10, 0);
        let task = Task::new("t", "code").with_timeout_ms(1000);

        let pairs = Scheduler::schedule_sjf(&[task], &[slow, fast.clone()]);
        assert_eq!(pairs[0].1, fast.id);
    }

    #[test]
    fn test_capacity_respected_within_tick() {
        let manifest = AgentManifest::new("code")
            .with_capability("code")
            .with_max_concurrent(1);
        let mut agent = Agent::from_manifest(manifest);
        agent.status = AgentStatus::Ready;

        let tasks = vec![Task::new("t1", "code"), Task::new("t2", "code")];
        let pairs = Scheduler::schedule_fifo(&tasks, &[agent]);
        // Only one assignment fits the agent's capacity
        assert_eq!(pairs.len(), 1);
    }

    #[test]
    fn test_capability_mismatch_skipped() {
        let agent = agent_with("a", 100, 100.0, 5, 0);
        let task = Task::new("t", "deploy");
        let pairs = Scheduler::schedule_fifo(&[task], &[agent]);
        assert!(pairs.is_empty());
    }
}

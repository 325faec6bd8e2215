//! Load balancer.
//!
//! Picks one agent for one task under a pluggable discipline. Disciplines
//! are a fixed tagged set; switching is an atomic swap through the runtime
//! rather than per-object mutation. The weighted round-robin variant keeps
//! smooth-selection state per agent.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::domain::models::{Agent, BalancingDiscipline, Task};
use crate::services::metrics::{names, MetricsRegistry};

/// Default response-time estimate for agents with no samples, in ms.
const DEFAULT_RESPONSE_MS: f64 = 1000.0;

/// Routes a single task to one of the eligible agents.
pub struct LoadBalancer {
    discipline: RwLock<BalancingDiscipline>,
    /// Smooth-WRR accumulated weight per agent
    wrr_current: Mutex<HashMap<Uuid, i64>>,
    metrics: Arc<MetricsRegistry>,
}

impl LoadBalancer {
    pub fn new(discipline: BalancingDiscipline, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            discipline: RwLock::new(discipline),
            wrr_current: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    /// The active discipline.
    pub async fn discipline(&self) -> BalancingDiscipline {
        *self.discipline.read().await
    }

    /// Atomically switch disciplines; smooth-WRR state resets.
    pub async fn set_discipline(&self, discipline: BalancingDiscipline) {
        *self.discipline.write().await = discipline;
        self.wrr_current.lock().await.clear();
    }

    /// Pick an agent for the task from an order-stable eligible list.
    pub async fn select(&self, task: &Task, eligible: &[Agent]) -> Option<Uuid> {
        if eligible.is_empty() {
            self.metrics.incr(names::LB_SELECTIONS_FAILED);
            return None;
        }

        let discipline = *self.discipline.read().await;
        let chosen = match discipline {
            BalancingDiscipline::LeastConnections => Self::least_connections(eligible),
            BalancingDiscipline::WeightedRoundRobin => {
                self.weighted_round_robin(eligible).await
            }
            BalancingDiscipline::ResponseTime => Self::response_time(eligible),
            BalancingDiscipline::ConsistentHash => Self::consistent_hash(task, eligible),
        };

        match chosen {
            Some(id) => {
                self.metrics.incr(names::LB_SELECTIONS_SUCCESS);
                if let Some(agent) = eligible.iter().find(|a| a.id == id) {
                    self.metrics.observe(
                        names::LB_RESPONSE_TIME,
                        agent.metrics.recent_mean_ms(DEFAULT_RESPONSE_MS),
                    );
                }
                Some(id)
            }
            None => {
                self.metrics.incr(names::LB_SELECTIONS_FAILED);
                None
            }
        }
    }

    /// Agent with the fewest current tasks; ties break on id for stability.
    fn least_connections(eligible: &[Agent]) -> Option<Uuid> {
        eligible
            .iter()
            .min_by_key(|a| (a.current_tasks.len(), a.id))
            .map(|a| a.id)
    }

    /// Static weight from health, success rate, and speed.
    fn wrr_weight(agent: &Agent) -> i64 {
        let health = f64::from(agent.metrics.health) / 100.0;
        let success = agent.metrics.success_rate();
        let avg = agent.metrics.average_task_time_ms;
        let speed = if avg <= 0.0 {
            1.0
        } else {
            (10_000.0 / avg).min(1.0)
        };
        let weight = (10.0 * (0.4 * health + 0.4 * success + 0.2 * speed)).round() as i64;
        weight.max(1)
    }

    /// Smooth weighted round-robin: accumulate each agent's weight, pick
    /// the largest accumulator, then charge it the total weight.
    async fn weighted_round_robin(&self, eligible: &[Agent]) -> Option<Uuid> {
        let mut current = self.wrr_current.lock().await;
        let mut total = 0i64;
        for agent in eligible {
            let weight = Self::wrr_weight(agent);
            total += weight;
            *current.entry(agent.id).or_insert(0) += weight;
        }

        let winner = eligible
            .iter()
            .max_by_key(|a| (current.get(&a.id).copied().unwrap_or(0), a.id))
            .map(|a| a.id)?;
        *current.entry(winner).or_insert(0) -= total;
        Some(winner)
    }

    /// Minimum mean over the recent response-time window.
    fn response_time(eligible: &[Agent]) -> Option<Uuid> {
        eligible
            .iter()
            .min_by(|a, b| {
                let ma = a.metrics.recent_mean_ms(DEFAULT_RESPONSE_MS);
                let mb = b.metrics.recent_mean_ms(DEFAULT_RESPONSE_MS);
                ma.partial_cmp(&mb)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.id.cmp(&b.id))
            })
            .map(|a| a.id)
    }

    /// Stable hash of the task name and type over the eligible list.
    fn consistent_hash(task: &Task, eligible: &[Agent]) -> Option<Uuid> {
        let mut hasher = DefaultHasher::new();
        task.name.hash(&mut hasher);
        task.task_type.hash(&mut hasher);
        let idx = (hasher.finish() % eligible.len() as u64) as usize;
        eligible.get(idx).map(|a| a.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{AgentManifest, AgentStatus};

    fn agent(name: &str, tasks: usize) -> Agent {
        let manifest = AgentManifest::new(name)
            .with_capability("code")
            .with_max_concurrent(10);
        let mut agent = Agent::from_manifest(manifest);
        agent.status = AgentStatus::Ready;
        for _ in 0..tasks {
            agent.current_tasks.insert(Uuid::new_v4());
        }
        agent
    }

    fn balancer(discipline: BalancingDiscipline) -> LoadBalancer {
        LoadBalancer::new(discipline, Arc::new(MetricsRegistry::new()))
    }

    #[tokio::test]
    async fn test_empty_eligible_returns_none() {
        let lb = balancer(BalancingDiscipline::LeastConnections);
        let task = Task::new("t", "code");
        assert!(lb.select(&task, &[]).await.is_none());
    }

    #[tokio::test]
    async fn test_least_connections() {
        let lb = balancer(BalancingDiscipline::LeastConnections);
        let busy = agent("a", 3);
        let idle = agent("b", 0);
        let task = Task::new("t", "code");

        let chosen = lb.select(&task, &[busy.clone(), idle.clone()]).await;
        assert_eq!(chosen, Some(idle.id));
    }

    #[tokio::test]
    async fn test_response_time_picks_fastest() {
        let lb = balancer(BalancingDiscipline::ResponseTime);
        let mut fast = agent("fast", 0);
        let mut slow = agent("slow", 0);
        for _ in 0..5 {
            fast.metrics.record_success(50.0);
            slow.metrics.record_success(800.0);
        }
        let task = Task::new("t", "code");
        let chosen = lb.select(&task, &[slow.clone(), fast.clone()]).await;
        assert_eq!(chosen, Some(fast.id));
    }

    #[tokio::test]
    async fn test_response_time_default_for_empty_window() {
        let lb = balancer(BalancingDiscipline::ResponseTime);
        let fresh = agent("fresh", 0);
        let mut slow = agent("slow", 0);
        for _ in 0..5 {
            slow.metrics.record_success(2000.0);
        }
        // Fresh agent gets the 1000ms default, beating the slow one
        let task = Task::new("t", "code");
        let chosen = lb.select(&task, &[slow.clone(), fresh.clone()]).await;
        assert_eq!(chosen, Some(fresh.id));
    }

    #[tokio::test]
    async fn test_consistent_hash_is_stable() {
        let lb = balancer(BalancingDiscipline::ConsistentHash);
        let mut agents = vec![agent("a", 0), agent("b", 0), agent("c", 0)];
        agents.sort_by_key(|a| a.id);
        let task = Task::new("same-name", "code");

        let first = lb.select(&task, &agents).await;
        for _ in 0..10 {
            assert_eq!(lb.select(&task, &agents).await, first);
        }
    }

    #[tokio::test]
    async fn test_wrr_favors_healthy_agents() {
        let lb = balancer(BalancingDiscipline::WeightedRoundRobin);
        let healthy = agent("healthy", 0);
        let mut sick = agent("sick", 0);
        for _ in 0..8 {
            sick.metrics.record_failure();
        }

        let eligible = vec![healthy.clone(), sick.clone()];
        let task = Task::new("t", "code");
        let mut healthy_picks = 0;
        for _ in 0..20 {
            if lb.select(&task, &eligible).await == Some(healthy.id) {
                healthy_picks += 1;
            }
        }
        // Healthy weight 10 vs sick weight ~3: healthy picked far more often
        assert!(healthy_picks > 12, "healthy picked {healthy_picks}/20");
    }

    #[tokio::test]
    async fn test_discipline_switch_is_atomic() {
        let lb = balancer(BalancingDiscipline::LeastConnections);
        assert_eq!(
            lb.discipline().await,
            BalancingDiscipline::LeastConnections
        );
        lb.set_discipline(BalancingDiscipline::ConsistentHash).await;
        assert_eq!(lb.discipline().await, BalancingDiscipline::ConsistentHash);
    }
}

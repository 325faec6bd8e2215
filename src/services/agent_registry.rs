//! Agent registry.
//!
//! Exclusive owner of agent records. Registration runs the handler's
//! `initialize` hook before the agent becomes visible; unregistration
//! drains current tasks before `shutdown`. A reverse capability index
//! gives constant-time eligibility lookup, and health bookkeeping gates
//! unhealthy agents out of scheduling.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::error::{OrchResult, OrchestratorError};
use crate::domain::models::{Agent, AgentManifest, AgentStatus, Task};
use crate::domain::ports::AgentHandler;
use crate::services::metrics::{names, MetricsRegistry};

struct RegistryState {
    agents: HashMap<Uuid, Agent>,
    /// capability -> agents carrying it
    by_capability: HashMap<String, HashSet<Uuid>>,
}

impl RegistryState {
    fn index(&mut self, agent: &Agent) {
        for cap in &agent.manifest.capabilities {
            self.by_capability
                .entry(cap.clone())
                .or_default()
                .insert(agent.id);
        }
    }

    fn unindex(&mut self, agent: &Agent) {
        for cap in &agent.manifest.capabilities {
            if let Some(set) = self.by_capability.get_mut(cap) {
                set.remove(&agent.id);
                if set.is_empty() {
                    self.by_capability.remove(cap);
                }
            }
        }
    }
}

/// Registry of live agents and their handlers.
pub struct AgentRegistry {
    state: RwLock<RegistryState>,
    handlers: RwLock<HashMap<Uuid, Arc<dyn AgentHandler>>>,
    metrics: Arc<MetricsRegistry>,
}

impl AgentRegistry {
    pub fn new(metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            state: RwLock::new(RegistryState {
                agents: HashMap::new(),
                by_capability: HashMap::new(),
            }),
            handlers: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    /// Register an agent. The handler's `initialize` runs first; on failure
    /// the error is surfaced and the agent is not added.
    pub async fn register(
        &self,
        manifest: AgentManifest,
        handler: Arc<dyn AgentHandler>,
    ) -> OrchResult<Uuid> {
        manifest
            .validate()
            .map_err(|msg| OrchestratorError::invalid_argument("manifest", msg))?;

        handler.initialize().await?;

        let mut agent = Agent::from_manifest(manifest);
        agent.status = AgentStatus::Ready;
        let id = agent.id;

        {
            let mut state = self.state.write().await;
            state.index(&agent);
            state.agents.insert(id, agent);
            self.metrics
                .gauge(names::AGENTS_TOTAL, state.agents.len() as f64);
        }
        self.handlers.write().await.insert(id, handler);
        Ok(id)
    }

    /// Unregister an agent. With tasks in flight it drains first; the
    /// handler's `shutdown` runs once the last task releases.
    pub async fn unregister(&self, agent_id: Uuid) -> OrchResult<()> {
        let drained = {
            let mut state = self.state.write().await;
            let agent = state
                .agents
                .get_mut(&agent_id)
                .ok_or(OrchestratorError::AgentNotFound(agent_id))?;
            agent.status = AgentStatus::ShuttingDown;
            agent.current_tasks.is_empty()
        };

        if drained {
            self.finalize(agent_id).await?;
        }
        Ok(())
    }

    /// Complete a shutdown: run the handler hook and drop the record.
    async fn finalize(&self, agent_id: Uuid) -> OrchResult<()> {
        let handler = self.handlers.write().await.remove(&agent_id);
        if let Some(handler) = handler {
            handler.shutdown().await?;
        }
        let mut state = self.state.write().await;
        if let Some(mut agent) = state.agents.remove(&agent_id) {
            agent.status = AgentStatus::Terminated;
            state.unindex(&agent);
        }
        self.metrics
            .gauge(names::AGENTS_TOTAL, state.agents.len() as f64);
        Ok(())
    }

    /// Agents able to run `task` right now: capability match, spare
    /// capacity, and the health gate.
    pub async fn eligible_for(&self, task: &Task) -> Vec<Agent> {
        let state = self.state.read().await;
        let candidates: Vec<Uuid> = state
            .by_capability
            .get(&task.task_type)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();

        let mut eligible: Vec<Agent> = candidates
            .into_iter()
            .filter_map(|id| state.agents.get(&id))
            .filter(|agent| agent.is_available())
            .filter(|agent| {
                agent.can_execute(&task.task_type, &task.agent_requirements.capabilities)
            })
            .filter(|agent| {
                task.agent_requirements
                    .agent_type
                    .as_deref()
                    .is_none_or(|ty| agent.agent_type() == ty)
            })
            .cloned()
            .collect();
        // Order-stable for consistent-hash routing
        eligible.sort_by_key(|a| a.id);
        eligible
    }

    /// All agents currently available for new work.
    pub async fn available_agents(&self) -> Vec<Agent> {
        let state = self.state.read().await;
        let mut agents: Vec<Agent> = state
            .agents
            .values()
            .filter(|a| a.is_available())
            .cloned()
            .collect();
        agents.sort_by_key(|a| a.id);
        agents
    }

    /// Assign a task to an agent, enforcing the capacity bound.
    pub async fn assign(&self, agent_id: Uuid, task_id: Uuid) -> OrchResult<()> {
        let mut state = self.state.write().await;
        let agent = state
            .agents
            .get_mut(&agent_id)
            .ok_or(OrchestratorError::AgentNotFound(agent_id))?;
        if !agent.status.accepts_work() {
            return Err(OrchestratorError::invalid_argument(
                "agent_id",
                format!("agent is {}", agent.status),
            ));
        }
        if !agent.has_capacity() {
            return Err(OrchestratorError::AtCapacity {
                limit: agent.manifest.resource_limits.max_concurrent_tasks,
            });
        }
        agent.assign(task_id);
        Ok(())
    }

    /// Release a task from an agent; finishes a pending shutdown if this
    /// was its last task.
    pub async fn release(&self, agent_id: Uuid, task_id: Uuid) -> OrchResult<()> {
        let finalize = {
            let mut state = self.state.write().await;
            let agent = state
                .agents
                .get_mut(&agent_id)
                .ok_or(OrchestratorError::AgentNotFound(agent_id))?;
            agent.release(task_id);
            agent.status == AgentStatus::ShuttingDown && agent.current_tasks.is_empty()
        };
        if finalize {
            self.finalize(agent_id).await?;
        }
        Ok(())
    }

    /// Record a completed task for metrics and health restoration.
    pub async fn record_success(&self, agent_id: Uuid, duration_ms: f64) {
        let mut state = self.state.write().await;
        if let Some(agent) = state.agents.get_mut(&agent_id) {
            agent.metrics.record_success(duration_ms);
        }
    }

    /// Record a failed task: health drops by 10.
    pub async fn record_failure(&self, agent_id: Uuid) {
        let mut state = self.state.write().await;
        if let Some(agent) = state.agents.get_mut(&agent_id) {
            agent.metrics.record_failure();
        }
    }

    /// Refresh an agent's heartbeat timestamp.
    pub async fn heartbeat(&self, agent_id: Uuid) {
        let mut state = self.state.write().await;
        if let Some(agent) = state.agents.get_mut(&agent_id) {
            agent.metrics.last_heartbeat = chrono::Utc::now();
        }
    }

    /// Mark an agent errored; it leaves every eligibility set until
    /// restarted.
    pub async fn mark_error(&self, agent_id: Uuid) {
        let mut state = self.state.write().await;
        if let Some(agent) = state.agents.get_mut(&agent_id) {
            agent.status = AgentStatus::Error;
        }
    }

    /// Mark an agent with no work as idle.
    pub async fn mark_idle(&self, agent_id: Uuid) {
        let mut state = self.state.write().await;
        if let Some(agent) = state.agents.get_mut(&agent_id) {
            if agent.status == AgentStatus::Ready && agent.current_tasks.is_empty() {
                agent.status = AgentStatus::Idle;
            }
        }
    }

    /// Pause or resume an agent without unregistering it.
    pub async fn set_paused(&self, agent_id: Uuid, paused: bool) -> OrchResult<()> {
        let mut state = self.state.write().await;
        let agent = state
            .agents
            .get_mut(&agent_id)
            .ok_or(OrchestratorError::AgentNotFound(agent_id))?;
        agent.paused = paused;
        Ok(())
    }

    /// Fetch an agent by id.
    pub async fn get(&self, agent_id: Uuid) -> OrchResult<Agent> {
        self.state
            .read()
            .await
            .agents
            .get(&agent_id)
            .cloned()
            .ok_or(OrchestratorError::AgentNotFound(agent_id))
    }

    /// All registered agents.
    pub async fn list(&self) -> Vec<Agent> {
        let state = self.state.read().await;
        let mut agents: Vec<Agent> = state.agents.values().cloned().collect();
        agents.sort_by_key(|a| a.registered_at);
        agents
    }

    /// Ids of every live agent.
    pub async fn live_ids(&self) -> HashSet<Uuid> {
        self.state.read().await.agents.keys().copied().collect()
    }

    /// Registered agent count.
    pub async fn count(&self) -> usize {
        self.state.read().await.agents.len()
    }

    /// Agents carrying a capability (the reverse index).
    pub async fn with_capability(&self, capability: &str) -> HashSet<Uuid> {
        self.state
            .read()
            .await
            .by_capability
            .get(capability)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::NoopAgentHandler;
    use async_trait::async_trait;

    struct FailingHandler;

    #[async_trait]
    impl AgentHandler for FailingHandler {
        async fn initialize(&self) -> OrchResult<()> {
            Err(OrchestratorError::WorkerFailed("init failed".into()))
        }

        async fn shutdown(&self) -> OrchResult<()> {
            Ok(())
        }
    }

    fn registry() -> AgentRegistry {
        AgentRegistry::new(Arc::new(MetricsRegistry::new()))
    }

    fn code_manifest() -> AgentManifest {
        AgentManifest::new("code").with_capability("code")
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = registry();
        let id = registry
            .register(code_manifest(), Arc::new(NoopAgentHandler))
            .await
            .unwrap();

        let agent = registry.get(id).await.unwrap();
        assert_eq!(agent.status, AgentStatus::Ready);
        assert!(registry.with_capability("code").await.contains(&id));
    }

    #[tokio::test]
    async fn test_failed_initialize_not_added() {
        let registry = registry();
        let result = registry
            .register(code_manifest(), Arc::new(FailingHandler))
            .await;
        assert!(result.is_err());
        assert_eq!(registry.count().await, 0);
        assert!(registry.with_capability("code").await.is_empty());
    }

    #[tokio::test]
    async fn test_unregister_restores_index() {
        let registry = registry();
        let id = registry
            .register(code_manifest(), Arc::new(NoopAgentHandler))
            .await
            .unwrap();
        registry.unregister(id).await.unwrap();

        assert_eq!(registry.count().await, 0);
        assert!(registry.with_capability("code").await.is_empty());
        assert!(registry.get(id).await.is_err());
    }

    #[tokio::test]
    async fn test_unregister_waits_for_drain() {
        let registry = registry();
        let id = registry
            .register(code_manifest(), Arc::new(NoopAgentHandler))
            .await
            .unwrap();
        let task_id = Uuid::new_v4();
        registry.assign(id, task_id).await.unwrap();

        registry.unregister(id).await.unwrap();
        // Still present while draining
        assert_eq!(
            registry.get(id).await.unwrap().status,
            AgentStatus::ShuttingDown
        );

        registry.release(id, task_id).await.unwrap();
        assert!(registry.get(id).await.is_err());
    }

    #[tokio::test]
    async fn test_capacity_enforced() {
        let registry = registry();
        let manifest = code_manifest().with_max_concurrent(1);
        let id = registry
            .register(manifest, Arc::new(NoopAgentHandler))
            .await
            .unwrap();

        registry.assign(id, Uuid::new_v4()).await.unwrap();
        let err = registry.assign(id, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::AtCapacity { .. }));
    }

    #[tokio::test]
    async fn test_eligibility_health_gate() {
        let registry = registry();
        let id = registry
            .register(code_manifest(), Arc::new(NoopAgentHandler))
            .await
            .unwrap();

        let task = Task::new("t", "code");
        assert_eq!(registry.eligible_for(&task).await.len(), 1);

        // Nine failures: health 10, below the gate
        for _ in 0..9 {
            registry.record_failure(id).await;
        }
        assert!(registry.eligible_for(&task).await.is_empty());
    }

    #[tokio::test]
    async fn test_eligibility_capability_and_type() {
        let registry = registry();
        registry
            .register(code_manifest(), Arc::new(NoopAgentHandler))
            .await
            .unwrap();
        registry
            .register(
                AgentManifest::new("test").with_capability("test"),
                Arc::new(NoopAgentHandler),
            )
            .await
            .unwrap();

        let task = Task::new("t", "code");
        let eligible = registry.eligible_for(&task).await;
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].agent_type(), "code");

        // Requiring a specific type filters further
        let task = Task::new("t", "code").with_agent_type("other");
        assert!(registry.eligible_for(&task).await.is_empty());
    }

    #[tokio::test]
    async fn test_errored_agent_excluded() {
        let registry = registry();
        let id = registry
            .register(code_manifest(), Arc::new(NoopAgentHandler))
            .await
            .unwrap();
        registry.mark_error(id).await;

        let task = Task::new("t", "code");
        assert!(registry.eligible_for(&task).await.is_empty());
    }
}

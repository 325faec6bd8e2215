//! Agent domain model.
//!
//! Agents (interchangeably "workers") are long-running processes that accept
//! commands and emit output. Their manifests declare capabilities and
//! resource limits; the registry tracks live status and rolling metrics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use uuid::Uuid;

/// Status of a live agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Handler initialization in progress
    Initializing,
    /// Available for new work
    Ready,
    /// Executing at least one task
    Busy,
    /// Alive with no work for a while
    Idle,
    /// Backend or handler failure, awaiting restart
    Error,
    /// Unregistering, draining current tasks
    ShuttingDown,
    /// Gone; must never appear in eligibility sets
    Terminated,
}

impl Default for AgentStatus {
    fn default() -> Self {
        Self::Initializing
    }
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Idle => "idle",
            Self::Error => "error",
            Self::ShuttingDown => "shutting_down",
            Self::Terminated => "terminated",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "initializing" => Some(Self::Initializing),
            "ready" => Some(Self::Ready),
            "busy" => Some(Self::Busy),
            "idle" => Some(Self::Idle),
            "error" => Some(Self::Error),
            "shutting_down" => Some(Self::ShuttingDown),
            "terminated" => Some(Self::Terminated),
            _ => None,
        }
    }

    /// Whether an agent in this status may accept new work at all.
    pub fn accepts_work(&self) -> bool {
        matches!(self, Self::Ready | Self::Busy | Self::Idle)
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource limits declared in an agent manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Maximum resident memory in megabytes
    pub max_memory_mb: u64,
    /// Maximum CPU utilization percentage
    pub max_cpu_pct: u8,
    /// Maximum execution time per task in milliseconds
    pub max_exec_time_ms: u64,
    /// Maximum tasks held concurrently
    pub max_concurrent_tasks: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_mb: 512,
            max_cpu_pct: 80,
            max_exec_time_ms: 300_000,
            max_concurrent_tasks: 1,
        }
    }
}

/// Declared identity and capabilities of an agent type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentManifest {
    /// Unique identifier of the manifest
    pub id: Uuid,
    /// Agent type name (e.g., "code", "test", "research")
    pub name: String,
    /// Manifest version
    pub version: String,
    /// Capability tags matched against task types
    pub capabilities: Vec<String>,
    /// Permissions the agent needs from its environment
    pub required_permissions: Vec<String>,
    /// Resource limits
    pub resource_limits: ResourceLimits,
}

impl AgentManifest {
    /// Create a manifest for the given agent type.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            version: "1.0.0".to_string(),
            capabilities: Vec::new(),
            required_permissions: Vec::new(),
            resource_limits: ResourceLimits::default(),
        }
    }

    /// Add a capability tag.
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    /// Set resource limits.
    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.resource_limits = limits;
        self
    }

    /// Set the maximum concurrent task count.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.resource_limits.max_concurrent_tasks = max;
        self
    }

    /// Check if the manifest carries a capability.
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }

    /// Validate manifest invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("Agent name cannot be empty".to_string());
        }
        if self.resource_limits.max_concurrent_tasks == 0 {
            return Err("max_concurrent_tasks must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Health floor below which an agent is excluded from scheduling.
pub const HEALTH_GATE: u8 = 20;

/// Completions required for one point of health restoration.
pub const HEALTH_RESTORE_EVERY: u32 = 3;

/// Rolling execution metrics for an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMetrics {
    /// Tasks completed successfully
    pub completed: u64,
    /// Tasks failed
    pub failed: u64,
    /// Running mean of task execution time
    pub average_task_time_ms: f64,
    /// Health score 0..=100
    pub health: u8,
    /// Last heartbeat observed
    pub last_heartbeat: DateTime<Utc>,
    /// Consecutive completions since the last failure
    pub success_streak: u32,
    /// Sliding window of recent task times (load balancer input)
    pub recent_task_times_ms: VecDeque<f64>,
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self {
            completed: 0,
            failed: 0,
            average_task_time_ms: 0.0,
            health: 100,
            last_heartbeat: Utc::now(),
            success_streak: 0,
            recent_task_times_ms: VecDeque::new(),
        }
    }
}

impl AgentMetrics {
    /// Window size for the recent-task-time samples.
    pub const RESPONSE_WINDOW: usize = 10;

    /// Record a completed task and restore health on sustained success.
    pub fn record_success(&mut self, duration_ms: f64) {
        self.completed += 1;
        let n = self.completed as f64;
        self.average_task_time_ms += (duration_ms - self.average_task_time_ms) / n;

        self.recent_task_times_ms.push_back(duration_ms);
        while self.recent_task_times_ms.len() > Self::RESPONSE_WINDOW {
            self.recent_task_times_ms.pop_front();
        }

        self.success_streak += 1;
        if self.success_streak % HEALTH_RESTORE_EVERY == 0 {
            self.health = (self.health + 1).min(100);
        }
    }

    /// Record a failed task: health drops by 10 with a floor of 0.
    pub fn record_failure(&mut self) {
        self.failed += 1;
        self.success_streak = 0;
        self.health = self.health.saturating_sub(10);
    }

    /// Fraction of tasks that completed successfully (1.0 with no history).
    pub fn success_rate(&self) -> f64 {
        let total = self.completed + self.failed;
        if total == 0 {
            1.0
        } else {
            self.completed as f64 / total as f64
        }
    }

    /// Mean of the recent task-time window (default when empty).
    pub fn recent_mean_ms(&self, default_ms: f64) -> f64 {
        if self.recent_task_times_ms.is_empty() {
            default_ms
        } else {
            self.recent_task_times_ms.iter().sum::<f64>() / self.recent_task_times_ms.len() as f64
        }
    }
}

/// A registered agent with live status and metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    /// Instance identifier
    pub id: Uuid,
    /// Manifest this agent was registered with
    pub manifest: AgentManifest,
    /// Current status
    pub status: AgentStatus,
    /// Paused agents stay registered but take no new work
    pub paused: bool,
    /// Tasks currently assigned
    pub current_tasks: HashSet<Uuid>,
    /// Rolling metrics
    pub metrics: AgentMetrics,
    /// When registered
    pub registered_at: DateTime<Utc>,
}

impl Agent {
    /// Create a new agent from a manifest.
    pub fn from_manifest(manifest: AgentManifest) -> Self {
        Self {
            id: Uuid::new_v4(),
            manifest,
            status: AgentStatus::Initializing,
            paused: false,
            current_tasks: HashSet::new(),
            metrics: AgentMetrics::default(),
            registered_at: Utc::now(),
        }
    }

    /// The agent type (manifest name).
    pub fn agent_type(&self) -> &str {
        &self.manifest.name
    }

    /// Whether the agent has spare task capacity.
    pub fn has_capacity(&self) -> bool {
        self.current_tasks.len() < self.manifest.resource_limits.max_concurrent_tasks
    }

    /// Whether the agent passes the scheduling health gate.
    pub fn passes_health_gate(&self) -> bool {
        self.metrics.health >= HEALTH_GATE
    }

    /// Whether the agent may be handed a new task right now.
    pub fn is_available(&self) -> bool {
        !self.paused && self.status.accepts_work() && self.has_capacity() && self.passes_health_gate()
    }

    /// Whether the agent can execute a task of the given type with the
    /// given extra capability requirements.
    pub fn can_execute(&self, task_type: &str, required: &[String]) -> bool {
        self.manifest.has_capability(task_type)
            && required.iter().all(|c| self.manifest.has_capability(c))
    }

    /// Assign a task, flipping status to busy.
    pub fn assign(&mut self, task_id: Uuid) {
        self.current_tasks.insert(task_id);
        if self.status.accepts_work() {
            self.status = AgentStatus::Busy;
        }
    }

    /// Release a task; an agent with no work becomes idle.
    pub fn release(&mut self, task_id: Uuid) {
        self.current_tasks.remove(&task_id);
        if self.current_tasks.is_empty() && self.status == AgentStatus::Busy {
            self.status = AgentStatus::Idle;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_builder() {
        let manifest = AgentManifest::new("code")
            .with_capability("code")
            .with_capability("refactor")
            .with_max_concurrent(2);
        assert!(manifest.has_capability("code"));
        assert!(manifest.has_capability("refactor"));
        assert!(!manifest.has_capability("deploy"));
        assert_eq!(manifest.resource_limits.max_concurrent_tasks, 2);
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_manifest_validation() {
        assert!(AgentManifest::new("").validate().is_err());
        let manifest = AgentManifest::new("x").with_max_concurrent(0);
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_capacity_bound() {
        let manifest = AgentManifest::new("code")
            .with_capability("code")
            .with_max_concurrent(1);
        let mut agent = Agent::from_manifest(manifest);
        agent.status = AgentStatus::Ready;

        assert!(agent.has_capacity());
        agent.assign(Uuid::new_v4());
        assert!(!agent.has_capacity());
        assert!(!agent.is_available());
        assert_eq!(agent.status, AgentStatus::Busy);
    }

    #[test]
    fn test_release_returns_to_idle() {
        let mut agent = Agent::from_manifest(AgentManifest::new("code"));
        agent.status = AgentStatus::Ready;
        let task = Uuid::new_v4();
        agent.assign(task);
        agent.release(task);
        assert_eq!(agent.status, AgentStatus::Idle);
        assert!(agent.is_available());
    }

    #[test]
    fn test_health_decrement_and_gate() {
        let mut metrics = AgentMetrics::default();
        for _ in 0..9 {
            metrics.record_failure();
        }
        assert_eq!(metrics.health, 10);

        let mut agent = Agent::from_manifest(AgentManifest::new("code"));
        agent.status = AgentStatus::Ready;
        agent.metrics = metrics;
        assert!(!agent.passes_health_gate());
        assert!(!agent.is_available());
    }

    #[test]
    fn test_health_floor() {
        let mut metrics = AgentMetrics::default();
        for _ in 0..20 {
            metrics.record_failure();
        }
        assert_eq!(metrics.health, 0);
    }

    #[test]
    fn test_health_restoration() {
        let mut metrics = AgentMetrics::default();
        metrics.record_failure();
        assert_eq!(metrics.health, 90);

        for _ in 0..HEALTH_RESTORE_EVERY {
            metrics.record_success(100.0);
        }
        assert_eq!(metrics.health, 91);
    }

    #[test]
    fn test_success_rate_and_average() {
        let mut metrics = AgentMetrics::default();
        assert!((metrics.success_rate() - 1.0).abs() < f64::EPSILON);

        metrics.record_success(100.0);
        metrics.record_success(200.0);
        metrics.record_failure();
        assert!((metrics.success_rate() - 2.0 / 3.0).abs() < 1e-9);
        assert!((metrics.average_task_time_ms - 150.0).abs() < 1e-9);
    }

    #[test]
    fn test_response_window_cap() {
        let mut metrics = AgentMetrics::default();
        for i in 0..15 {
            metrics.record_success(f64::from(i));
        }
        assert_eq!(
            metrics.recent_task_times_ms.len(),
            AgentMetrics::RESPONSE_WINDOW
        );
        assert!((metrics.recent_mean_ms(0.0) - 9.5).abs() < 1e-9);
    }

    #[test]
    fn test_capability_matching() {
        let manifest = AgentManifest::new("code")
            .with_capability("code")
            .with_capability("lint");
        let agent = Agent::from_manifest(manifest);
        assert!(agent.can_execute("code", &[]));
        assert!(agent.can_execute("code", &["lint".to_string()]));
        assert!(!agent.can_execute("code", &["deploy".to_string()]));
        assert!(!agent.can_execute("test", &[]));
    }
}

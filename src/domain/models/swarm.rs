//! Composite (swarm) task domain model.
//!
//! A swarm task groups subtasks under one of five execution shapes. The
//! coordinator materializes each subtask as an individual unit of work
//! routed to an available worker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Execution shape of a composite task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwarmShape {
    /// Fan out in chunks of `max_concurrency`
    Parallel,
    /// Strictly ordered; first failure aborts unless retryable
    Sequential,
    /// Parallel over subtasks, then an implicit reduce of the outputs
    Map,
    /// Single-subtask finalization over collected inputs
    Reduce,
    /// Sequential with each result injected into the next command
    Pipeline,
}

impl SwarmShape {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parallel => "parallel",
            Self::Sequential => "sequential",
            Self::Map => "map",
            Self::Reduce => "reduce",
            Self::Pipeline => "pipeline",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "parallel" => Some(Self::Parallel),
            "sequential" => Some(Self::Sequential),
            "map" => Some(Self::Map),
            "reduce" => Some(Self::Reduce),
            "pipeline" => Some(Self::Pipeline),
            _ => None,
        }
    }
}

/// Status of a swarm task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwarmStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl Default for SwarmStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl SwarmStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One subtask inside a swarm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtaskSpec {
    /// Caller-chosen identifier, unique within the swarm
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Command handed to the worker
    pub command: String,
    /// Subtask ids this one waits for (advisory for parallel shapes)
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Relative weight for capacity accounting
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Whether a failure re-invokes the subtask
    #[serde(default)]
    pub retryable: bool,
}

fn default_weight() -> u32 {
    1
}

impl SubtaskSpec {
    pub fn new(id: impl Into<String>, name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            command: command.into(),
            dependencies: Vec::new(),
            weight: 1,
            retryable: false,
        }
    }

    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }
}

/// Execution parameters for a swarm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwarmTaskConfig {
    /// Subtasks in flight at once for parallel shapes
    pub max_concurrency: usize,
    /// Per-subtask timeout
    pub timeout_ms: Option<u64>,
    /// Re-invocations per retryable subtask
    pub retry_attempts: u32,
    /// Failure percentage above which the whole swarm fails
    pub failure_threshold_pct: Option<f64>,
}

impl Default for SwarmTaskConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            timeout_ms: None,
            retry_attempts: 1,
            failure_threshold_pct: None,
        }
    }
}

/// A composite task: subtasks under an execution shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwarmTask {
    /// Unique identifier
    pub id: uuid::Uuid,
    /// Human-readable name
    pub name: String,
    /// Execution shape
    pub shape: SwarmShape,
    /// Subtasks
    pub subtasks: Vec<SubtaskSpec>,
    /// Execution parameters
    pub config: SwarmTaskConfig,
    /// Current status
    pub status: SwarmStatus,
    /// Per-subtask results keyed by subtask id
    pub results: HashMap<String, serde_json::Value>,
    /// Per-subtask errors keyed by subtask id
    pub errors: HashMap<String, String>,
    /// When created
    pub created_at: DateTime<Utc>,
    /// When execution started
    pub started_at: Option<DateTime<Utc>>,
    /// When execution finished
    pub completed_at: Option<DateTime<Utc>>,
}

impl SwarmTask {
    /// Create a new swarm with the given shape.
    pub fn new(name: impl Into<String>, shape: SwarmShape, subtasks: Vec<SubtaskSpec>) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            name: name.into(),
            shape,
            subtasks,
            config: SwarmTaskConfig::default(),
            status: SwarmStatus::Pending,
            results: HashMap::new(),
            errors: HashMap::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Set execution parameters.
    pub fn with_config(mut self, config: SwarmTaskConfig) -> Self {
        self.config = config;
        self
    }

    /// Percentage of subtasks that failed.
    pub fn failure_pct(&self) -> f64 {
        if self.subtasks.is_empty() {
            0.0
        } else {
            self.errors.len() as f64 / self.subtasks.len() as f64 * 100.0
        }
    }

    /// Whether recorded failures exceed the configured threshold.
    pub fn over_failure_threshold(&self) -> bool {
        self.config
            .failure_threshold_pct
            .is_some_and(|pct| self.failure_pct() > pct)
    }

    /// Validate the swarm prior to execution.
    pub fn validate(&self) -> Result<(), String> {
        let mut seen = std::collections::HashSet::new();
        for sub in &self.subtasks {
            if sub.id.trim().is_empty() {
                return Err("Subtask id cannot be empty".to_string());
            }
            if !seen.insert(sub.id.as_str()) {
                return Err(format!("Duplicate subtask id: {}", sub.id));
            }
        }
        if self.config.max_concurrency == 0 {
            return Err("max_concurrency must be at least 1".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subtasks(n: usize) -> Vec<SubtaskSpec> {
        (0..n)
            .map(|i| SubtaskSpec::new(format!("s{i}"), format!("sub {i}"), "echo hi"))
            .collect()
    }

    #[test]
    fn test_swarm_creation() {
        let swarm = SwarmTask::new("build", SwarmShape::Parallel, subtasks(3));
        assert_eq!(swarm.status, SwarmStatus::Pending);
        assert_eq!(swarm.subtasks.len(), 3);
        assert!(swarm.validate().is_ok());
    }

    #[test]
    fn test_duplicate_subtask_id_rejected() {
        let mut subs = subtasks(2);
        subs[1].id = "s0".to_string();
        let swarm = SwarmTask::new("dup", SwarmShape::Sequential, subs);
        assert!(swarm.validate().is_err());
    }

    #[test]
    fn test_failure_pct() {
        let mut swarm = SwarmTask::new("p", SwarmShape::Parallel, subtasks(4));
        swarm.errors.insert("s0".into(), "boom".into());
        assert!((swarm.failure_pct() - 25.0).abs() < f64::EPSILON);

        swarm.config.failure_threshold_pct = Some(50.0);
        assert!(!swarm.over_failure_threshold());

        swarm.errors.insert("s1".into(), "boom".into());
        swarm.errors.insert("s2".into(), "boom".into());
        assert!(swarm.over_failure_threshold());
    }

    #[test]
    fn test_empty_swarm_failure_pct() {
        let swarm = SwarmTask::new("empty", SwarmShape::Parallel, vec![]);
        assert!((swarm.failure_pct() - 0.0).abs() < f64::EPSILON);
        assert!(!swarm.over_failure_threshold());
    }

    #[test]
    fn test_shape_parsing() {
        assert_eq!(SwarmShape::from_str("parallel"), Some(SwarmShape::Parallel));
        assert_eq!(SwarmShape::from_str("PIPELINE"), Some(SwarmShape::Pipeline));
        assert_eq!(SwarmShape::from_str("fanout"), None);
    }
}

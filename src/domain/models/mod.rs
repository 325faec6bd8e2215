//! Domain models
//!
//! Pure domain entities with business logic and validation rules.
//! These models are framework-agnostic and contain no infrastructure concerns.

pub mod agent;
pub mod config;
pub mod lock;
pub mod memory;
pub mod swarm;
pub mod task;

pub use agent::{
    Agent, AgentManifest, AgentMetrics, AgentStatus, ResourceLimits, HEALTH_GATE,
    HEALTH_RESTORE_EVERY,
};
pub use config::{
    BalancingDiscipline, Config, DatabaseConfig, LockConfig, LoadBalancerConfig, LoggingConfig,
    MemoryConfig, RuntimeConfig, SchedulerConfig, SchedulingDiscipline, ServerConfig,
    TerminalConfig, TerminalKind,
};
pub use lock::{LockMode, ResourceLock};
pub use memory::{
    jaccard_similarity, keys, normalize_pattern, ttl, CommandPattern, MemoryEntry,
    TaskHistoryEntry, WorkerContext, SIMILARITY_THRESHOLD,
};
pub use swarm::{SubtaskSpec, SwarmShape, SwarmStatus, SwarmTask, SwarmTaskConfig};
pub use task::{AgentRequirements, Task, TaskPriority, TaskStatus};

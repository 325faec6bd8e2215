//! Runtime configuration model.
//!
//! The full configuration tree with programmatic defaults. Loading and
//! validation live in `infrastructure::config`.

use serde::{Deserialize, Serialize};

use super::task::TaskPriority;

/// Scheduling discipline selected for the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingDiscipline {
    /// Submission order, first eligible idle agent wins
    Fifo,
    /// Priority descending with a weighted agent score
    Priority,
    /// Rolling index across agents
    RoundRobin,
    /// Shortest timeout first, fastest agent wins
    ShortestJobFirst,
}

impl Default for SchedulingDiscipline {
    fn default() -> Self {
        Self::Fifo
    }
}

impl SchedulingDiscipline {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fifo => "fifo",
            Self::Priority => "priority",
            Self::RoundRobin => "round_robin",
            Self::ShortestJobFirst => "shortest_job_first",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "fifo" => Some(Self::Fifo),
            "priority" => Some(Self::Priority),
            "round_robin" | "roundrobin" => Some(Self::RoundRobin),
            "shortest_job_first" | "shortestjobfirst" | "sjf" => Some(Self::ShortestJobFirst),
            _ => None,
        }
    }
}

/// Load-balancing discipline for single-task routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancingDiscipline {
    /// Agent with the fewest current tasks
    LeastConnections,
    /// Smooth weighted round-robin over health/success/speed weights
    WeightedRoundRobin,
    /// Minimum mean of the recent response-time window
    ResponseTime,
    /// Stable hash of the task name and type
    ConsistentHash,
}

impl Default for BalancingDiscipline {
    fn default() -> Self {
        Self::LeastConnections
    }
}

impl BalancingDiscipline {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LeastConnections => "least_connections",
            Self::WeightedRoundRobin => "weighted_round_robin",
            Self::ResponseTime => "response_time",
            Self::ConsistentHash => "consistent_hash",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "least_connections" | "leastconnections" => Some(Self::LeastConnections),
            "weighted_round_robin" | "weightedroundrobin" => Some(Self::WeightedRoundRobin),
            "response_time" | "responsetime" => Some(Self::ResponseTime),
            "consistent_hash" | "consistenthash" => Some(Self::ConsistentHash),
            _ => None,
        }
    }
}

/// Worker pool and supervision parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub max_workers: usize,
    pub min_workers: usize,
    pub worker_idle_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub task_timeout_ms: u64,
    pub enable_auto_scaling: bool,
    /// Pending tasks above which the pool scales up
    pub scale_up_threshold: usize,
    /// Idle time after which a surplus worker is removed
    pub scale_down_threshold_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_workers: 6,
            min_workers: 1,
            worker_idle_timeout_ms: 300_000,
            heartbeat_interval_ms: 30_000,
            task_timeout_ms: 300_000,
            enable_auto_scaling: true,
            scale_up_threshold: 3,
            scale_down_threshold_ms: 120_000,
        }
    }
}

/// Scheduler parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub discipline: SchedulingDiscipline,
    pub tick_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            discipline: SchedulingDiscipline::default(),
            tick_ms: 100,
        }
    }
}

/// Load balancer parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LoadBalancerConfig {
    pub discipline: BalancingDiscipline,
}

/// Memory store parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Namespace prefix for all keys
    pub namespace: String,
    pub default_ttl_s: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            namespace: "orchflow".to_string(),
            default_ttl_s: 86_400,
        }
    }
}

/// Resource lock parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub default_priority: TaskPriority,
    pub default_timeout_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_priority: TaskPriority::Normal,
            default_timeout_ms: 30_000,
        }
    }
}

/// SQLite store parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: ".orchflow/orchflow.db".to_string(),
            max_connections: 5,
        }
    }
}

/// Logging parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// "json" or "pretty"
    pub format: String,
    /// Optional log file directory for rolling output
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file: None,
        }
    }
}

/// Tool-call server bind parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7070,
        }
    }
}

/// Terminal backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalKind {
    /// Pseudo-terminal pair
    Pty,
    /// tmux pane driven over the tmux CLI
    TmuxPane,
    /// Plain child process with piped stdio
    Process,
}

impl Default for TerminalKind {
    fn default() -> Self {
        Self::Process
    }
}

impl TerminalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pty => "pty",
            Self::TmuxPane => "tmux_pane",
            Self::Process => "process",
        }
    }
}

/// Terminal backend parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    pub kind: TerminalKind,
    pub shell: String,
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            kind: TerminalKind::default(),
            shell: "/bin/sh".to_string(),
            cols: 120,
            rows: 40,
        }
    }
}

/// Top-level configuration tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub runtime: RuntimeConfig,
    pub scheduler: SchedulerConfig,
    pub load_balancer: LoadBalancerConfig,
    pub memory: MemoryConfig,
    pub locks: LockConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub terminal: TerminalConfig,
}

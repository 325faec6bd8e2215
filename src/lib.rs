//! OrchFlow - orchestration engine for pools of long-running workers.
//!
//! The core runtime spawns, schedules, and supervises worker processes
//! executing development tasks, and exposes the capability to an upstream
//! conversation driver through a tool-call protocol:
//! - Task graph with dependencies, cycle detection, and a ready-set
//! - Agent registry and worker pool with capability routing and health
//! - Pluggable scheduler and load balancer disciplines
//! - Swarm coordinator for composite execution shapes with auto-scaling
//! - Resource lock manager with priority and timeout
//! - Terminal backends (pty, tmux pane, child process) with completion
//!   marker parsing
//! - Persistent context/memory store with TTLs and learned patterns

pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export key types for convenience
pub use domain::{ErrorKind, OrchResult, OrchestratorError};
pub use services::OrchflowRuntime;

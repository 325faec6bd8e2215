//! Application services for the OrchFlow engine.

pub mod agent_registry;
pub mod circuit_breaker;
pub mod event_bus;
pub mod load_balancer;
pub mod memory_service;
pub mod metrics;
pub mod resource_manager;
pub mod runtime;
pub mod scheduler;
pub mod swarm_coordinator;
pub mod task_graph;
pub mod worker_manager;

pub use agent_registry::AgentRegistry;
pub use circuit_breaker::{
    CircuitBreakerConfig, CircuitBreakerService, CircuitScope, CircuitState, CircuitStats,
};
pub use event_bus::{
    EventBus, EventBusConfig, EventId, EventPayload, OrchEvent, SequenceNumber,
};
pub use load_balancer::LoadBalancer;
pub use memory_service::{CommandSuggestion, MemoryService};
pub use metrics::{names as metric_names, HistogramSummary, MetricsRegistry, MetricsSnapshot};
pub use resource_manager::{ResourceManager, ResourceStats};
pub use runtime::OrchflowRuntime;
pub use scheduler::Scheduler;
pub use swarm_coordinator::SwarmCoordinator;
pub use task_graph::{GraphCounts, TaskFilter, TaskGraph, DEFAULT_HISTORY_CAP};
pub use worker_manager::{WorkerManager, WorkerSnapshot};

//! Domain error types for the OrchFlow orchestration engine.
//!
//! A single error enum covers the whole engine; every variant maps onto one
//! of the coarse kinds surfaced to tool-call clients.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Coarse error classification carried in tool-call error replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed argument, unknown operation, or bad configuration value.
    Validation,
    /// Unknown worker, task, swarm, or session.
    NotFound,
    /// Worker pool saturated and `max_workers` reached.
    AtCapacity,
    /// Task submission rejected because it would close a cycle.
    DependencyCycle,
    /// Resource contention exceeded the acquire timeout.
    LockTimeout,
    /// Task execution exceeded its timeout.
    TaskTimeout,
    /// stderr/ERROR output or non-zero exit from a worker.
    WorkerError,
    /// Terminal backend read/write/spawn failure.
    TransportError,
    /// Memory store backend unavailable or failing.
    StoreError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::AtCapacity => "at_capacity",
            Self::DependencyCycle => "dependency_cycle",
            Self::LockTimeout => "lock_timeout",
            Self::TaskTimeout => "task_timeout",
            Self::WorkerError => "worker_error",
            Self::TransportError => "transport_error",
            Self::StoreError => "store_error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by the orchestration engine.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// A tool-call or API argument failed validation.
    #[error("Invalid argument '{field}': {message}")]
    InvalidArgument { field: String, message: String },

    /// An unknown tool-call operation was requested.
    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    /// A configuration value is out of range or malformed.
    #[error("Invalid configuration value for {field}: {message}")]
    InvalidConfig { field: String, message: String },

    /// An invalid task status transition was attempted.
    #[error("Invalid status transition from {from} to {to}")]
    InvalidStatusTransition { from: String, to: String },

    /// Worker with the given id or name was not found.
    #[error("Worker not found: {0}")]
    WorkerNotFound(String),

    /// Task with the given id was not found.
    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    /// Swarm with the given id was not found.
    #[error("Swarm not found: {0}")]
    SwarmNotFound(Uuid),

    /// Agent with the given id was not registered.
    #[error("Agent not found: {0}")]
    AgentNotFound(Uuid),

    /// Named session was not found in the store.
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Worker pool is saturated.
    #[error("Worker pool at capacity ({limit} workers)")]
    AtCapacity { limit: usize },

    /// Submission would close a dependency cycle; the graph is unchanged.
    #[error("Submitting task {task_id} would create a dependency cycle")]
    DependencyCycle { task_id: Uuid },

    /// Lock acquisition timed out.
    #[error("Timed out acquiring lock '{resource}' after {timeout_ms}ms")]
    LockTimeout { resource: String, timeout_ms: u64 },

    /// A lock release was attempted by something that does not hold it.
    #[error("Lock '{resource}' is not held by '{holder}'")]
    UnknownHolder { resource: String, holder: String },

    /// Task execution exceeded its timeout.
    #[error("Task {task_id} exceeded its timeout of {timeout_ms}ms")]
    TaskTimeout { task_id: Uuid, timeout_ms: u64 },

    /// A worker reported a failure (ERROR line, stderr, non-zero exit).
    #[error("Worker error: {0}")]
    WorkerFailed(String),

    /// Terminal backend failed to spawn, read, or write.
    #[error("Terminal backend error: {0}")]
    Transport(String),

    /// Write to a terminal whose process has already exited.
    #[error("Terminal is closed: {0}")]
    TerminalClosed(Uuid),

    /// The memory store backend failed.
    #[error("Memory store error: {0}")]
    Store(String),

    /// A circuit breaker is open for the named scope.
    #[error("Circuit open for {scope}, retry after {retry_after}")]
    CircuitOpen { scope: String, retry_after: String },
}

impl OrchestratorError {
    /// The coarse kind surfaced to tool-call clients.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument { .. }
            | Self::UnknownOperation(_)
            | Self::InvalidConfig { .. }
            | Self::InvalidStatusTransition { .. } => ErrorKind::Validation,
            Self::WorkerNotFound(_)
            | Self::TaskNotFound(_)
            | Self::SwarmNotFound(_)
            | Self::AgentNotFound(_)
            | Self::SessionNotFound(_) => ErrorKind::NotFound,
            Self::AtCapacity { .. } => ErrorKind::AtCapacity,
            Self::DependencyCycle { .. } => ErrorKind::DependencyCycle,
            Self::LockTimeout { .. } | Self::UnknownHolder { .. } => ErrorKind::LockTimeout,
            Self::TaskTimeout { .. } => ErrorKind::TaskTimeout,
            Self::WorkerFailed(_) | Self::CircuitOpen { .. } => ErrorKind::WorkerError,
            Self::Transport(_) | Self::TerminalClosed(_) => ErrorKind::TransportError,
            Self::Store(_) => ErrorKind::StoreError,
        }
    }

    /// Returns true if this error could succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::LockTimeout { .. }
                | Self::TaskTimeout { .. }
                | Self::WorkerFailed(_)
                | Self::Transport(_)
                | Self::Store(_)
                | Self::CircuitOpen { .. }
        )
    }

    /// Returns true if this error represents a permanent failure.
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }

    /// Shorthand for an invalid-argument error.
    pub fn invalid_argument(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl From<sqlx::Error> for OrchestratorError {
    fn from(err: sqlx::Error) -> Self {
        Self::Store(err.to_string())
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        Self::Store(format!("serialization: {err}"))
    }
}

/// Result alias used throughout the engine.
pub type OrchResult<T> = Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            OrchestratorError::UnknownOperation("x".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            OrchestratorError::WorkerNotFound("w1".into()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            OrchestratorError::AtCapacity { limit: 6 }.kind(),
            ErrorKind::AtCapacity
        );
        assert_eq!(
            OrchestratorError::DependencyCycle {
                task_id: Uuid::new_v4()
            }
            .kind(),
            ErrorKind::DependencyCycle
        );
        assert_eq!(
            OrchestratorError::LockTimeout {
                resource: "agent-type:code".into(),
                timeout_ms: 100
            }
            .kind(),
            ErrorKind::LockTimeout
        );
        assert_eq!(
            OrchestratorError::Store("down".into()).kind(),
            ErrorKind::StoreError
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(OrchestratorError::LockTimeout {
            resource: "r".into(),
            timeout_ms: 0
        }
        .is_transient());
        assert!(OrchestratorError::WorkerFailed("boom".into()).is_transient());
        assert!(OrchestratorError::DependencyCycle {
            task_id: Uuid::new_v4()
        }
        .is_permanent());
        assert!(OrchestratorError::UnknownOperation("op".into()).is_permanent());
    }

    #[test]
    fn test_display() {
        let err = OrchestratorError::LockTimeout {
            resource: "agent-type:code".into(),
            timeout_ms: 5000,
        };
        assert_eq!(
            err.to_string(),
            "Timed out acquiring lock 'agent-type:code' after 5000ms"
        );
    }
}

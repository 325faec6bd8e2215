//! Circuit breaker for external dependencies.
//!
//! Tracks failures within a sliding window per scope and blocks calls once
//! a threshold is crossed, probing recovery through a half-open state.
//! Breakers wrap terminal backend spawns, memory store operations, and
//! individual workers.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Configuration for circuit breakers.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures within the window before opening the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before probing.
    pub open_timeout: Duration,
    /// Successful probes in half-open state required to close.
    pub success_threshold: u32,
    /// Window for counting failures; older failures are forgotten.
    pub failure_window: Duration,
    /// Whether breakers are enforced at all.
    pub enabled: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::minutes(2),
            success_threshold: 2,
            failure_window: Duration::minutes(5),
            enabled: true,
        }
    }
}

/// State of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally
    Closed,
    /// Calls are blocked
    Open,
    /// Probing whether the dependency recovered
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// What a circuit protects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitScope {
    /// A single worker process
    Worker(Uuid),
    /// A terminal backend variant (by kind name)
    Backend(String),
    /// The memory store
    Store,
    /// An arbitrary named operation
    Operation(String),
}

impl CircuitScope {
    pub fn worker(id: Uuid) -> Self {
        Self::Worker(id)
    }

    pub fn backend(kind: impl Into<String>) -> Self {
        Self::Backend(kind.into())
    }

    pub fn operation(name: impl Into<String>) -> Self {
        Self::Operation(name.into())
    }
}

impl std::fmt::Display for CircuitScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Worker(id) => write!(f, "worker:{id}"),
            Self::Backend(kind) => write!(f, "backend:{kind}"),
            Self::Store => write!(f, "store"),
            Self::Operation(name) => write!(f, "operation:{name}"),
        }
    }
}

/// Per-scope breaker state.
#[derive(Debug, Clone)]
struct Circuit {
    state: CircuitState,
    failures: Vec<DateTime<Utc>>,
    half_open_successes: u32,
    opened_at: Option<DateTime<Utc>>,
    open_count: u32,
}

impl Circuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: Vec::new(),
            half_open_successes: 0,
            opened_at: None,
            open_count: 0,
        }
    }

    fn record_failure(&mut self, config: &CircuitBreakerConfig) -> bool {
        self.failures.push(Utc::now());
        let cutoff = Utc::now() - config.failure_window;
        self.failures.retain(|t| *t > cutoff);

        let should_open = match self.state {
            CircuitState::Closed => self.failures.len() as u32 >= config.failure_threshold,
            // Any failure while probing reopens
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };
        if should_open {
            self.open();
        }
        should_open
    }

    fn record_success(&mut self, config: &CircuitBreakerConfig) -> bool {
        if self.state == CircuitState::HalfOpen {
            self.half_open_successes += 1;
            if self.half_open_successes >= config.success_threshold {
                self.close();
                return true;
            }
        }
        false
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Utc::now());
        self.half_open_successes = 0;
        self.open_count += 1;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.opened_at = None;
        self.half_open_successes = 0;
        self.failures.clear();
    }

    fn allows(&mut self, config: &CircuitBreakerConfig) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => match self.opened_at {
                Some(opened_at) if Utc::now() > opened_at + config.open_timeout => {
                    self.state = CircuitState::HalfOpen;
                    self.half_open_successes = 0;
                    true
                }
                _ => false,
            },
        }
    }
}

/// Snapshot of one circuit for the status view.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStats {
    pub scope: String,
    pub state: CircuitState,
    pub recent_failures: usize,
    pub open_count: u32,
}

/// Service owning all circuits, keyed by scope.
pub struct CircuitBreakerService {
    config: CircuitBreakerConfig,
    circuits: RwLock<HashMap<CircuitScope, Circuit>>,
}

impl CircuitBreakerService {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            circuits: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }

    /// Whether a call under this scope is currently allowed.
    pub async fn allows(&self, scope: &CircuitScope) -> bool {
        if !self.config.enabled {
            return true;
        }
        let mut circuits = self.circuits.write().await;
        circuits
            .entry(scope.clone())
            .or_insert_with(Circuit::new)
            .allows(&self.config)
    }

    /// Record a failure; returns true if the circuit opened on this call.
    pub async fn record_failure(&self, scope: &CircuitScope) -> bool {
        if !self.config.enabled {
            return false;
        }
        let mut circuits = self.circuits.write().await;
        let opened = circuits
            .entry(scope.clone())
            .or_insert_with(Circuit::new)
            .record_failure(&self.config);
        if opened {
            tracing::warn!(scope = %scope, "circuit opened");
        }
        opened
    }

    /// Record a success; returns true if the circuit closed on this call.
    pub async fn record_success(&self, scope: &CircuitScope) -> bool {
        if !self.config.enabled {
            return false;
        }
        let mut circuits = self.circuits.write().await;
        let closed = circuits
            .entry(scope.clone())
            .or_insert_with(Circuit::new)
            .record_success(&self.config);
        if closed {
            tracing::info!(scope = %scope, "circuit closed after recovery");
        }
        closed
    }

    /// Current state of a scope's circuit, if one exists.
    pub async fn state(&self, scope: &CircuitScope) -> Option<CircuitState> {
        self.circuits.read().await.get(scope).map(|c| c.state)
    }

    /// Drop a circuit, e.g. when its worker is removed.
    pub async fn remove(&self, scope: &CircuitScope) {
        self.circuits.write().await.remove(scope);
    }

    /// Reset a circuit to closed.
    pub async fn reset(&self, scope: &CircuitScope) {
        if let Some(circuit) = self.circuits.write().await.get_mut(scope) {
            circuit.close();
            circuit.open_count = 0;
        }
    }

    /// Stats for every known circuit.
    pub async fn stats(&self) -> Vec<CircuitStats> {
        let circuits = self.circuits.read().await;
        let cutoff = Utc::now() - self.config.failure_window;
        circuits
            .iter()
            .map(|(scope, circuit)| CircuitStats {
                scope: scope.to_string(),
                state: circuit.state,
                recent_failures: circuit.failures.iter().filter(|t| **t > cutoff).count(),
                open_count: circuit.open_count,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            open_timeout: Duration::milliseconds(50),
            success_threshold: 2,
            failure_window: Duration::minutes(1),
            enabled: true,
        }
    }

    #[tokio::test]
    async fn test_opens_after_threshold() {
        let service = CircuitBreakerService::new(fast_config());
        let scope = CircuitScope::Store;

        assert!(service.allows(&scope).await);
        assert!(!service.record_failure(&scope).await);
        assert!(!service.record_failure(&scope).await);
        assert!(service.record_failure(&scope).await);
        assert!(!service.allows(&scope).await);
        assert_eq!(service.state(&scope).await, Some(CircuitState::Open));
    }

    #[tokio::test]
    async fn test_half_open_probe_and_close() {
        let service = CircuitBreakerService::new(fast_config());
        let scope = CircuitScope::backend("process");

        for _ in 0..3 {
            service.record_failure(&scope).await;
        }
        assert!(!service.allows(&scope).await);

        tokio::time::sleep(std::time::Duration::from_millis(60)).await;
        // Probe allowed after the open timeout
        assert!(service.allows(&scope).await);
        assert_eq!(service.state(&scope).await, Some(CircuitState::HalfOpen));

        service.record_success(&scope).await;
        assert!(service.record_success(&scope).await);
        assert_eq!(service.state(&scope).await, Some(CircuitState::Closed));
    }

    #[tokio::test]
    async fn test_failure_in_half_open_reopens() {
        let service = CircuitBreakerService::new(fast_config());
        let scope = CircuitScope::worker(Uuid::new_v4());

        for _ in 0..3 {
            service.record_failure(&scope).await;
        }
        tokio::time::sleep(std::time::Duration::from_millis(60)).await;
        assert!(service.allows(&scope).await);

        assert!(service.record_failure(&scope).await);
        assert_eq!(service.state(&scope).await, Some(CircuitState::Open));
    }

    #[tokio::test]
    async fn test_disabled_never_blocks() {
        let mut config = fast_config();
        config.enabled = false;
        let service = CircuitBreakerService::new(config);
        let scope = CircuitScope::Store;

        for _ in 0..10 {
            service.record_failure(&scope).await;
        }
        assert!(service.allows(&scope).await);
    }
}

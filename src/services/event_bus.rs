//! Typed event bus for in-process pub/sub.
//!
//! Broadcast-based distribution with sequence numbering and a bounded
//! history ring kept for diagnostics and the rich status view. Delivery is
//! per-subscriber FIFO.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonically increasing sequence number assigned at publish time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SequenceNumber(pub u64);

impl std::fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The fixed event catalogue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum EventPayload {
    // Task lifecycle
    TaskSubmitted {
        task_id: Uuid,
        name: String,
        task_type: String,
    },
    TaskScheduled {
        task_id: Uuid,
    },
    TaskStarted {
        task_id: Uuid,
        agent_id: Uuid,
    },
    TaskCompleted {
        task_id: Uuid,
        duration_ms: u64,
    },
    TaskFailed {
        task_id: Uuid,
        error: String,
        retries: u32,
    },
    TaskRetrying {
        task_id: Uuid,
        attempt: u32,
        max_attempts: u32,
    },
    TaskCancelled {
        task_id: Uuid,
    },
    TaskTimedOut {
        task_id: Uuid,
        timeout_ms: u64,
    },

    // Worker lifecycle
    WorkerSpawned {
        worker_id: Uuid,
        name: String,
        worker_type: String,
    },
    WorkerStopped {
        worker_id: Uuid,
    },
    WorkerRestarted {
        old_worker_id: Uuid,
        new_worker_id: Uuid,
    },
    WorkerErrored {
        worker_id: Uuid,
        error: String,
    },
    HeartbeatMissed {
        worker_id: Uuid,
        missed_intervals: u32,
    },

    // Swarm lifecycle
    SwarmStarted {
        swarm_id: Uuid,
        shape: String,
        subtask_count: usize,
    },
    SwarmCompleted {
        swarm_id: Uuid,
        succeeded: usize,
        failed: usize,
    },
    SwarmFailed {
        swarm_id: Uuid,
        reason: String,
    },
    SwarmCancelled {
        swarm_id: Uuid,
    },
    PoolScaledUp {
        added: usize,
        total: usize,
    },
    PoolScaledDown {
        removed: usize,
        total: usize,
    },

    // Locks and protection
    LockGranted {
        resource: String,
        holder_id: String,
        mode: String,
    },
    LockReleased {
        resource: String,
        holder_id: String,
    },
    CircuitOpened {
        scope: String,
    },
    CircuitClosed {
        scope: String,
    },
}

impl EventPayload {
    /// Stable type tag for filtering and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TaskSubmitted { .. } => "task_submitted",
            Self::TaskScheduled { .. } => "task_scheduled",
            Self::TaskStarted { .. } => "task_started",
            Self::TaskCompleted { .. } => "task_completed",
            Self::TaskFailed { .. } => "task_failed",
            Self::TaskRetrying { .. } => "task_retrying",
            Self::TaskCancelled { .. } => "task_cancelled",
            Self::TaskTimedOut { .. } => "task_timed_out",
            Self::WorkerSpawned { .. } => "worker_spawned",
            Self::WorkerStopped { .. } => "worker_stopped",
            Self::WorkerRestarted { .. } => "worker_restarted",
            Self::WorkerErrored { .. } => "worker_errored",
            Self::HeartbeatMissed { .. } => "heartbeat_missed",
            Self::SwarmStarted { .. } => "swarm_started",
            Self::SwarmCompleted { .. } => "swarm_completed",
            Self::SwarmFailed { .. } => "swarm_failed",
            Self::SwarmCancelled { .. } => "swarm_cancelled",
            Self::PoolScaledUp { .. } => "pool_scaled_up",
            Self::PoolScaledDown { .. } => "pool_scaled_down",
            Self::LockGranted { .. } => "lock_granted",
            Self::LockReleased { .. } => "lock_released",
            Self::CircuitOpened { .. } => "circuit_opened",
            Self::CircuitClosed { .. } => "circuit_closed",
        }
    }
}

/// Event envelope with sequencing metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchEvent {
    pub id: EventId,
    pub sequence: SequenceNumber,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

/// Configuration for the event bus.
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Broadcast channel capacity; slow subscribers observe lag
    pub channel_capacity: usize,
    /// Recent events retained for diagnostics
    pub history_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            history_capacity: 1000,
        }
    }
}

/// Broadcast event bus with sequence numbering and history.
pub struct EventBus {
    tx: broadcast::Sender<OrchEvent>,
    sequence: AtomicU64,
    history: RwLock<VecDeque<OrchEvent>>,
    history_capacity: usize,
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Self {
        let (tx, _) = broadcast::channel(config.channel_capacity);
        Self {
            tx,
            sequence: AtomicU64::new(0),
            history: RwLock::new(VecDeque::with_capacity(config.history_capacity)),
            history_capacity: config.history_capacity,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(EventBusConfig::default())
    }

    /// Subscribe to all subsequent events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchEvent> {
        self.tx.subscribe()
    }

    /// Publish an event, assigning its sequence number.
    pub async fn publish(&self, payload: EventPayload) -> SequenceNumber {
        let sequence = SequenceNumber(self.sequence.fetch_add(1, Ordering::SeqCst));
        let event = OrchEvent {
            id: EventId::new(),
            sequence,
            timestamp: Utc::now(),
            payload,
        };

        {
            let mut history = self.history.write().await;
            if history.len() == self.history_capacity {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        // A send error only means no subscriber is currently attached
        let _ = self.tx.send(event);
        sequence
    }

    /// Most recent events, oldest first, capped at `limit`.
    pub async fn recent(&self, limit: usize) -> Vec<OrchEvent> {
        let history = self.history.read().await;
        history
            .iter()
            .rev()
            .take(limit)
            .rev()
            .cloned()
            .collect()
    }

    /// Number of subscribers currently attached.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_assigns_increasing_sequence() {
        let bus = EventBus::with_defaults();
        let s1 = bus
            .publish(EventPayload::TaskScheduled {
                task_id: Uuid::new_v4(),
            })
            .await;
        let s2 = bus
            .publish(EventPayload::TaskScheduled {
                task_id: Uuid::new_v4(),
            })
            .await;
        assert!(s2 > s1);
    }

    #[tokio::test]
    async fn test_subscriber_receives_in_order() {
        let bus = EventBus::with_defaults();
        let mut rx = bus.subscribe();

        let id = Uuid::new_v4();
        bus.publish(EventPayload::TaskSubmitted {
            task_id: id,
            name: "a".into(),
            task_type: "code".into(),
        })
        .await;
        bus.publish(EventPayload::TaskScheduled { task_id: id }).await;

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.payload.kind(), "task_submitted");
        assert_eq!(second.payload.kind(), "task_scheduled");
        assert!(second.sequence > first.sequence);
    }

    #[tokio::test]
    async fn test_history_ring_bounded() {
        let bus = EventBus::new(EventBusConfig {
            channel_capacity: 16,
            history_capacity: 3,
        });
        for _ in 0..5 {
            bus.publish(EventPayload::TaskScheduled {
                task_id: Uuid::new_v4(),
            })
            .await;
        }
        let recent = bus.recent(10).await;
        assert_eq!(recent.len(), 3);
        // Oldest retained event is sequence 2
        assert_eq!(recent[0].sequence, SequenceNumber(2));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = EventBus::with_defaults();
        // Should not error
        bus.publish(EventPayload::PoolScaledUp { added: 1, total: 2 })
            .await;
        assert_eq!(bus.subscriber_count(), 0);
    }
}

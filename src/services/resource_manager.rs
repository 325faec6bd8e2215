//! Resource lock manager.
//!
//! Exclusive and shared locks over caller-named resources, with a wait
//! queue ordered by priority then enqueue time, acquire timeouts, lease
//! expiry, and auto-release when a holder terminates. On release, as many
//! compatible waiters as possible are granted so shared storms coalesce.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};

use crate::domain::error::{OrchResult, OrchestratorError};
use crate::domain::models::{LockConfig, LockMode, ResourceLock, TaskPriority};
use crate::services::event_bus::{EventBus, EventPayload};

struct Waiter {
    holder_id: String,
    mode: LockMode,
    priority: TaskPriority,
    enqueued_at: DateTime<Utc>,
    seq: u64,
    grant_tx: oneshot::Sender<()>,
}

#[derive(Default)]
struct ResourceState {
    holders: Vec<ResourceLock>,
    waiters: Vec<Waiter>,
}

impl ResourceState {
    fn prune_expired(&mut self) {
        self.holders.retain(|lock| !lock.is_expired());
    }

    fn compatible(&self, mode: LockMode) -> bool {
        self.holders.iter().all(|held| held.mode.compatible_with(mode))
    }
}

#[derive(Default)]
struct ManagerState {
    resources: HashMap<String, ResourceState>,
    next_seq: u64,
}

/// Snapshot of one resource's lock state.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ResourceStats {
    pub resource: String,
    pub holders: Vec<ResourceLock>,
    pub waiter_count: usize,
}

/// Lock manager over named resources.
pub struct ResourceManager {
    config: LockConfig,
    /// Lease applied to every granted lock; `None` disables expiry.
    lease_ms: Option<u64>,
    state: Mutex<ManagerState>,
    event_bus: Arc<EventBus>,
}

impl ResourceManager {
    pub fn new(config: LockConfig, event_bus: Arc<EventBus>) -> Self {
        Self {
            config,
            lease_ms: None,
            state: Mutex::new(ManagerState::default()),
            event_bus,
        }
    }

    /// Apply a lease to every granted lock; expired leases are reclaimed
    /// lazily and the holder must reacquire.
    pub fn with_lease_ms(mut self, lease_ms: u64) -> Self {
        self.lease_ms = Some(lease_ms);
        self
    }

    /// Acquire a lock on `resource`.
    ///
    /// Waits up to `timeout_ms` (the configured default when `None`);
    /// `timeout_ms = 0` never waits. Timing out yields `LockTimeout`.
    pub async fn acquire(
        &self,
        resource: &str,
        holder_id: &str,
        mode: LockMode,
        priority: TaskPriority,
        timeout_ms: Option<u64>,
    ) -> OrchResult<()> {
        let timeout_ms = timeout_ms.unwrap_or(self.config.default_timeout_ms);

        let (seq, grant_rx) = {
            let mut state = self.state.lock().await;
            let seq = state.next_seq;
            state.next_seq += 1;
            let entry = state.resources.entry(resource.to_string()).or_default();
            entry.prune_expired();

            // Immediate grant only when nothing is queued ahead
            if entry.waiters.is_empty() && entry.compatible(mode) {
                entry.holders.push(ResourceLock::new(
                    resource,
                    mode,
                    holder_id,
                    priority,
                    self.lease_ms,
                ));
                drop(state);
                self.emit_granted(resource, holder_id, mode).await;
                return Ok(());
            }

            if timeout_ms == 0 {
                return Err(OrchestratorError::LockTimeout {
                    resource: resource.to_string(),
                    timeout_ms: 0,
                });
            }

            let (grant_tx, grant_rx) = oneshot::channel();
            entry.waiters.push(Waiter {
                holder_id: holder_id.to_string(),
                mode,
                priority,
                enqueued_at: Utc::now(),
                seq,
                grant_tx,
            });
            (seq, grant_rx)
        };

        let wait = tokio::time::timeout(std::time::Duration::from_millis(timeout_ms), grant_rx);
        match wait.await {
            Ok(Ok(())) => {
                self.emit_granted(resource, holder_id, mode).await;
                Ok(())
            }
            // Sender dropped or timeout: withdraw from the queue if still
            // queued; a missing waiter means we were granted concurrently.
            _ => {
                let mut state = self.state.lock().await;
                if let Some(entry) = state.resources.get_mut(resource) {
                    let before = entry.waiters.len();
                    entry.waiters.retain(|w| w.seq != seq);
                    if entry.waiters.len() == before {
                        drop(state);
                        self.emit_granted(resource, holder_id, mode).await;
                        return Ok(());
                    }
                }
                Err(OrchestratorError::LockTimeout {
                    resource: resource.to_string(),
                    timeout_ms,
                })
            }
        }
    }

    /// Release a lock held on `resource` by `holder_id`.
    pub async fn release(&self, resource: &str, holder_id: &str) -> OrchResult<()> {
        {
            let mut state = self.state.lock().await;
            let entry = state
                .resources
                .get_mut(resource)
                .ok_or_else(|| OrchestratorError::UnknownHolder {
                    resource: resource.to_string(),
                    holder: holder_id.to_string(),
                })?;
            entry.prune_expired();

            let before = entry.holders.len();
            entry.holders.retain(|lock| lock.holder_id != holder_id);
            if entry.holders.len() == before {
                return Err(OrchestratorError::UnknownHolder {
                    resource: resource.to_string(),
                    holder: holder_id.to_string(),
                });
            }

            Self::grant_waiters(entry, resource, self.lease_ms);
            if entry.holders.is_empty() && entry.waiters.is_empty() {
                state.resources.remove(resource);
            }
        }

        self.event_bus
            .publish(EventPayload::LockReleased {
                resource: resource.to_string(),
                holder_id: holder_id.to_string(),
            })
            .await;
        Ok(())
    }

    /// Release every lock held by `holder_id`, e.g. on worker termination.
    pub async fn release_all(&self, holder_id: &str) -> usize {
        let mut released = 0;
        let mut state = self.state.lock().await;
        let resources: Vec<String> = state.resources.keys().cloned().collect();
        for resource in resources {
            if let Some(entry) = state.resources.get_mut(&resource) {
                let before = entry.holders.len();
                entry.holders.retain(|lock| lock.holder_id != holder_id);
                if entry.holders.len() < before {
                    released += before - entry.holders.len();
                    Self::grant_waiters(entry, &resource, self.lease_ms);
                }
                if entry.holders.is_empty() && entry.waiters.is_empty() {
                    state.resources.remove(&resource);
                }
            }
        }
        released
    }

    /// Current holders of a resource.
    pub async fn holders(&self, resource: &str) -> Vec<ResourceLock> {
        let mut state = self.state.lock().await;
        state
            .resources
            .get_mut(resource)
            .map(|entry| {
                entry.prune_expired();
                entry.holders.clone()
            })
            .unwrap_or_default()
    }

    /// Stats for all resources with holders or waiters.
    pub async fn stats(&self) -> Vec<ResourceStats> {
        let mut state = self.state.lock().await;
        state
            .resources
            .iter_mut()
            .map(|(resource, entry)| {
                entry.prune_expired();
                ResourceStats {
                    resource: resource.clone(),
                    holders: entry.holders.clone(),
                    waiter_count: entry.waiters.len(),
                }
            })
            .collect()
    }

    /// Grant as many queued waiters as compatibility allows, in
    /// (priority desc, enqueue asc) order.
    fn grant_waiters(entry: &mut ResourceState, resource: &str, lease_ms: Option<u64>) {
        entry
            .waiters
            .sort_by(|a, b| b.priority.cmp(&a.priority).then(a.enqueued_at.cmp(&b.enqueued_at)));

        while let Some(head) = entry.waiters.first() {
            if !entry.compatible(head.mode) {
                break;
            }
            let waiter = entry.waiters.remove(0);
            entry.holders.push(ResourceLock::new(
                resource,
                waiter.mode,
                waiter.holder_id.clone(),
                waiter.priority,
                lease_ms,
            ));
            // A dropped receiver is reclaimed by the waiter's timeout path
            let _ = waiter.grant_tx.send(());
        }
    }

    async fn emit_granted(&self, resource: &str, holder_id: &str, mode: LockMode) {
        self.event_bus
            .publish(EventPayload::LockGranted {
                resource: resource.to_string(),
                holder_id: holder_id.to_string(),
                mode: mode.as_str().to_string(),
            })
            .await;
    }
}

//! Resource lock domain model.
//!
//! Named resources are locked in exclusive or shared mode with priority
//! ordering and lease expiry. The resource manager owns these records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::TaskPriority;

/// Access mode for a resource lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// At most one holder, incompatible with any other holder
    Exclusive,
    /// Compatible with other shared holders
    Shared,
}

impl LockMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exclusive => "exclusive",
            Self::Shared => "shared",
        }
    }

    /// Shared is compatible with shared; exclusive with nothing.
    pub fn compatible_with(&self, other: Self) -> bool {
        matches!((self, other), (Self::Shared, Self::Shared))
    }
}

/// A granted lock on a named resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLock {
    /// Resource name (caller-chosen, e.g. `agent-type:code`)
    pub resource: String,
    /// Access mode
    pub mode: LockMode,
    /// Holder identity
    pub holder_id: String,
    /// Priority the lock was acquired with
    pub priority: TaskPriority,
    /// When granted
    pub acquired_at: DateTime<Utc>,
    /// Lease expiry; the holder must reacquire after this instant
    pub expires_at: Option<DateTime<Utc>>,
}

impl ResourceLock {
    pub fn new(
        resource: impl Into<String>,
        mode: LockMode,
        holder_id: impl Into<String>,
        priority: TaskPriority,
        lease_ms: Option<u64>,
    ) -> Self {
        let acquired_at = Utc::now();
        Self {
            resource: resource.into(),
            mode,
            holder_id: holder_id.into(),
            priority,
            acquired_at,
            expires_at: lease_ms
                .map(|ms| acquired_at + chrono::Duration::milliseconds(ms as i64)),
        }
    }

    /// Whether the lease has lapsed.
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|t| Utc::now() > t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compatibility() {
        assert!(LockMode::Shared.compatible_with(LockMode::Shared));
        assert!(!LockMode::Shared.compatible_with(LockMode::Exclusive));
        assert!(!LockMode::Exclusive.compatible_with(LockMode::Shared));
        assert!(!LockMode::Exclusive.compatible_with(LockMode::Exclusive));
    }

    #[test]
    fn test_lease_expiry() {
        let lock = ResourceLock::new(
            "agent-type:code",
            LockMode::Exclusive,
            "task-1",
            TaskPriority::Normal,
            Some(0),
        );
        // Zero-length lease lapses immediately
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(lock.is_expired());

        let lock = ResourceLock::new(
            "agent-type:code",
            LockMode::Exclusive,
            "task-1",
            TaskPriority::Normal,
            None,
        );
        assert!(!lock.is_expired());
    }
}

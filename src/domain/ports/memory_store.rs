//! Memory store port.
//!
//! A key/value layer with advisory TTLs and a wildcard search. Keys are
//! hierarchical under a namespace prefix; values are UTF-8 JSON. Expired
//! keys are never returned. Writes are idempotent at the key level with
//! last-write-wins semantics.

use async_trait::async_trait;

use crate::domain::error::OrchResult;
use crate::domain::models::MemoryEntry;

/// Persistence backend for contexts, histories, patterns, and sessions.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Write a value under a key, replacing any previous value.
    async fn store(
        &self,
        key: &str,
        value: &serde_json::Value,
        ttl_s: Option<u64>,
    ) -> OrchResult<()>;

    /// Read a key; `None` if absent or expired.
    async fn retrieve(&self, key: &str) -> OrchResult<Option<MemoryEntry>>;

    /// Delete a key; returns whether it existed.
    async fn delete(&self, key: &str) -> OrchResult<bool>;

    /// Search keys by pattern, `*` matching any run of characters.
    /// Results are newest-first, capped at `limit`, expired keys excluded.
    async fn search(&self, pattern: &str, limit: usize) -> OrchResult<Vec<MemoryEntry>>;

    /// Drop expired entries; returns how many were removed.
    async fn cleanup_expired(&self) -> OrchResult<u64>;
}

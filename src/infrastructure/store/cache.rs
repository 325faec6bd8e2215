//! In-memory implementation of the MemoryStore.
//!
//! Backs tests and serves as the read-through fallback while the
//! persistent store is unavailable.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::domain::error::OrchResult;
use crate::domain::models::MemoryEntry;
use crate::domain::ports::MemoryStore;

/// Match a `*`-wildcard pattern against a key.
pub fn wildcard_match(pattern: &str, key: &str) -> bool {
    let segments: Vec<&str> = pattern.split('*').collect();
    if segments.len() == 1 {
        return pattern == key;
    }

    let mut remainder = key;
    for (i, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            continue;
        }
        if i == 0 {
            match remainder.strip_prefix(segment) {
                Some(rest) => remainder = rest,
                None => return false,
            }
        } else if i == segments.len() - 1 {
            return remainder.ends_with(segment);
        } else {
            match remainder.find(segment) {
                Some(pos) => remainder = &remainder[pos + segment.len()..],
                None => return false,
            }
        }
    }
    true
}

/// Volatile key/value store.
#[derive(Default)]
pub struct InMemoryStore {
    entries: RwLock<HashMap<String, MemoryEntry>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) entries.
    pub async fn len(&self) -> usize {
        let entries = self.entries.read().await;
        entries.values().filter(|e| !e.is_expired()).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn store(
        &self,
        key: &str,
        value: &serde_json::Value,
        ttl_s: Option<u64>,
    ) -> OrchResult<()> {
        let entry = MemoryEntry::new(key, value.clone(), ttl_s);
        self.entries.write().await.insert(key.to_string(), entry);
        Ok(())
    }

    async fn retrieve(&self, key: &str) -> OrchResult<Option<MemoryEntry>> {
        let entries = self.entries.read().await;
        Ok(entries.get(key).filter(|e| !e.is_expired()).cloned())
    }

    async fn delete(&self, key: &str) -> OrchResult<bool> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn search(&self, pattern: &str, limit: usize) -> OrchResult<Vec<MemoryEntry>> {
        let entries = self.entries.read().await;
        let mut hits: Vec<MemoryEntry> = entries
            .values()
            .filter(|e| !e.is_expired() && wildcard_match(pattern, &e.key))
            .cloned()
            .collect();
        hits.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn cleanup_expired(&self) -> OrchResult<u64> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired());
        Ok((before - entries.len()) as u64)
    }
}

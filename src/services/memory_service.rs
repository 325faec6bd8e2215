//! Memory service.
//!
//! The namespaced TTL key/value API over the store port, plus the record
//! families built on it: worker contexts and decisions, task history,
//! learned command patterns, metrics snapshots, and saved sessions.
//!
//! The persistent store failing is non-fatal: writes and reads fall back
//! to an in-memory cache behind a circuit breaker, and persistence errors
//! surface only through the explicitly-persisted read path.

use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::error::{OrchResult, OrchestratorError};
use crate::domain::models::{
    jaccard_similarity, keys, normalize_pattern, ttl, CommandPattern, MemoryEntry,
    TaskHistoryEntry, WorkerContext, SIMILARITY_THRESHOLD,
};
use crate::domain::ports::MemoryStore;
use crate::infrastructure::store::InMemoryStore;
use crate::services::circuit_breaker::{CircuitBreakerService, CircuitScope};

/// A suggested command from similar prior inputs.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct CommandSuggestion {
    pub command: String,
    pub similarity: f64,
    pub source_input: String,
}

/// Namespaced persistence with an in-memory fallback.
pub struct MemoryService {
    store: Arc<dyn MemoryStore>,
    cache: InMemoryStore,
    breaker: Arc<CircuitBreakerService>,
    namespace: String,
    default_ttl_s: u64,
}

impl MemoryService {
    pub fn new(
        store: Arc<dyn MemoryStore>,
        breaker: Arc<CircuitBreakerService>,
        namespace: impl Into<String>,
        default_ttl_s: u64,
    ) -> Self {
        Self {
            store,
            cache: InMemoryStore::new(),
            breaker,
            namespace: namespace.into(),
            default_ttl_s,
        }
    }

    /// The configured namespace prefix.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    // ------------------------------------------------------------------
    // Raw key/value layer
    // ------------------------------------------------------------------

    /// Write a value. Store failure is logged and absorbed; the cache
    /// keeps serving.
    pub async fn store(&self, key: &str, value: &Value, ttl_s: Option<u64>) -> OrchResult<()> {
        let ttl_s = ttl_s.or(Some(self.default_ttl_s));
        let _ = self.cache.store(key, value, ttl_s).await;

        if !self.breaker.allows(&CircuitScope::Store).await {
            tracing::debug!(key, "store circuit open, cached only");
            return Ok(());
        }
        match self.store.store(key, value, ttl_s).await {
            Ok(()) => {
                self.breaker.record_success(&CircuitScope::Store).await;
                Ok(())
            }
            Err(err) => {
                self.breaker.record_failure(&CircuitScope::Store).await;
                tracing::warn!(key, %err, "memory store write failed, serving from cache");
                Ok(())
            }
        }
    }

    /// Read a key, falling back to the cache when the store fails.
    pub async fn retrieve(&self, key: &str) -> OrchResult<Option<MemoryEntry>> {
        if self.breaker.allows(&CircuitScope::Store).await {
            match self.store.retrieve(key).await {
                Ok(found) => {
                    self.breaker.record_success(&CircuitScope::Store).await;
                    if found.is_some() {
                        return Ok(found);
                    }
                }
                Err(err) => {
                    self.breaker.record_failure(&CircuitScope::Store).await;
                    tracing::warn!(key, %err, "memory store read failed, trying cache");
                }
            }
        }
        self.cache.retrieve(key).await
    }

    /// Read a key from the persistent store only; failures surface.
    pub async fn retrieve_persisted(&self, key: &str) -> OrchResult<Option<MemoryEntry>> {
        self.store.retrieve(key).await
    }

    /// Delete a key everywhere.
    pub async fn delete(&self, key: &str) -> OrchResult<bool> {
        let cached = self.cache.delete(key).await.unwrap_or(false);
        match self.store.delete(key).await {
            Ok(stored) => Ok(stored || cached),
            Err(err) => {
                tracing::warn!(key, %err, "memory store delete failed");
                Ok(cached)
            }
        }
    }

    /// Wildcard search, newest first.
    pub async fn search(&self, pattern: &str, limit: usize) -> OrchResult<Vec<MemoryEntry>> {
        if self.breaker.allows(&CircuitScope::Store).await {
            match self.store.search(pattern, limit).await {
                Ok(hits) => {
                    self.breaker.record_success(&CircuitScope::Store).await;
                    return Ok(hits);
                }
                Err(err) => {
                    self.breaker.record_failure(&CircuitScope::Store).await;
                    tracing::warn!(pattern, %err, "memory store search failed, trying cache");
                }
            }
        }
        self.cache.search(pattern, limit).await
    }

    /// Reap expired entries in both layers.
    pub async fn cleanup(&self) -> OrchResult<u64> {
        let cached = self.cache.cleanup_expired().await.unwrap_or(0);
        match self.store.cleanup_expired().await {
            Ok(stored) => Ok(stored + cached),
            Err(_) => Ok(cached),
        }
    }

    // ------------------------------------------------------------------
    // Worker context
    // ------------------------------------------------------------------

    pub async fn save_worker_context(&self, context: &WorkerContext) -> OrchResult<()> {
        let key = keys::worker_context(&self.namespace, context.worker_id);
        self.store(&key, &serde_json::to_value(context)?, Some(ttl::WORKER_CONTEXT_S))
            .await
    }

    pub async fn load_worker_context(&self, worker_id: Uuid) -> OrchResult<Option<WorkerContext>> {
        let key = keys::worker_context(&self.namespace, worker_id);
        let entry = self.retrieve(&key).await?;
        entry
            .map(|e| serde_json::from_value(e.value).map_err(Into::into))
            .transpose()
    }

    pub async fn record_decision(&self, worker_id: Uuid, decision: &str) -> OrchResult<()> {
        let key = keys::worker_decision(&self.namespace, worker_id, Utc::now().timestamp_millis());
        self.store(
            &key,
            &serde_json::json!({ "decision": decision }),
            Some(ttl::WORKER_DECISION_S),
        )
        .await
    }

    pub async fn worker_decisions(&self, worker_id: Uuid, limit: usize) -> OrchResult<Vec<String>> {
        let pattern = format!("{}/workers/{}/decisions/*", self.namespace, worker_id);
        let hits = self.search(&pattern, limit).await?;
        Ok(hits
            .into_iter()
            .filter_map(|e| {
                e.value
                    .get("decision")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .collect())
    }

    // ------------------------------------------------------------------
    // Task history and learned patterns
    // ------------------------------------------------------------------

    /// Persist one executed task; successful runs also update the learned
    /// pattern for the normalized input.
    pub async fn record_task_history(&self, entry: &TaskHistoryEntry) -> OrchResult<()> {
        let key = keys::task_history(&self.namespace, entry.task_id);
        self.store(&key, &serde_json::to_value(entry)?, Some(ttl::TASK_HISTORY_S))
            .await?;

        if entry.success {
            self.learn_pattern(&entry.input, entry.duration_ms as f64)
                .await?;
        }
        Ok(())
    }

    /// Merge a successful observation into the pattern for this input.
    pub async fn learn_pattern(&self, input: &str, response_time_ms: f64) -> OrchResult<()> {
        let normalized = normalize_pattern(input);
        if normalized.is_empty() {
            return Ok(());
        }
        let key = keys::pattern(&self.namespace, &normalized);

        let pattern = match self.retrieve(&key).await? {
            Some(entry) => {
                let mut pattern: CommandPattern = serde_json::from_value(entry.value)?;
                pattern.merge_success(response_time_ms);
                pattern
            }
            None => CommandPattern::first(normalized, response_time_ms),
        };
        self.store(&key, &serde_json::to_value(&pattern)?, Some(ttl::PATTERN_S))
            .await
    }

    /// The learned pattern for an input, if any.
    pub async fn get_pattern(&self, input: &str) -> OrchResult<Option<CommandPattern>> {
        let key = keys::pattern(&self.namespace, &normalize_pattern(input));
        self.retrieve(&key)
            .await?
            .map(|e| serde_json::from_value(e.value).map_err(Into::into))
            .transpose()
    }

    /// Task history entries, newest first.
    pub async fn task_history(&self, limit: usize) -> OrchResult<Vec<TaskHistoryEntry>> {
        let pattern = format!("{}/tasks/*", self.namespace);
        let hits = self.search(&pattern, limit).await?;
        Ok(hits
            .into_iter()
            .filter_map(|e| serde_json::from_value(e.value).ok())
            .collect())
    }

    /// Commands that worked for similar prior inputs: Jaccard >= 0.6 over
    /// the input text, deduplicated, best match first, top `limit`.
    pub async fn suggest_commands(
        &self,
        input: &str,
        limit: usize,
    ) -> OrchResult<Vec<CommandSuggestion>> {
        let history = self.task_history(500).await?;
        let mut suggestions: Vec<CommandSuggestion> = Vec::new();

        for entry in history {
            if !entry.success {
                continue;
            }
            let Some(command) = entry.successful_command else {
                continue;
            };
            let similarity = jaccard_similarity(input, &entry.input);
            if similarity < SIMILARITY_THRESHOLD {
                continue;
            }
            if suggestions.iter().any(|s| s.command == command) {
                continue;
            }
            suggestions.push(CommandSuggestion {
                command,
                similarity,
                source_input: entry.input,
            });
        }

        suggestions.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        suggestions.truncate(limit);
        Ok(suggestions)
    }

    // ------------------------------------------------------------------
    // Sessions and metrics snapshots
    // ------------------------------------------------------------------

    pub async fn save_session(&self, name: &str, value: &Value) -> OrchResult<()> {
        let key = keys::session(&self.namespace, name);
        self.store(&key, value, Some(ttl::SESSION_S)).await
    }

    pub async fn load_session(&self, name: &str) -> OrchResult<Value> {
        let key = keys::session(&self.namespace, name);
        self.retrieve(&key)
            .await?
            .map(|e| e.value)
            .ok_or_else(|| OrchestratorError::SessionNotFound(name.to_string()))
    }

    pub async fn record_metrics_snapshot(&self, snapshot: &Value) -> OrchResult<()> {
        let key = keys::metrics(&self.namespace, Utc::now().timestamp_millis());
        self.store(&key, snapshot, Some(ttl::METRICS_S)).await
    }
}

//! SQLite implementation of the MemoryStore.
//!
//! A single `memory_entries` table under WAL mode. Keys are hierarchical
//! strings; values are JSON text. Expired rows are filtered on read and
//! reaped by `cleanup_expired`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;

use crate::domain::error::{OrchResult, OrchestratorError};
use crate::domain::models::MemoryEntry;
use crate::domain::ports::MemoryStore;

/// Persistent key/value store over SQLite.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct EntryRow {
    key: String,
    value: String,
    created_at: String,
    expires_at: Option<String>,
}

impl TryFrom<EntryRow> for MemoryEntry {
    type Error = OrchestratorError;

    fn try_from(row: EntryRow) -> Result<Self, Self::Error> {
        let value = serde_json::from_str(&row.value)?;
        let timestamp = DateTime::parse_from_rfc3339(&row.created_at)
            .map_err(|e| OrchestratorError::Store(format!("bad timestamp: {e}")))?
            .with_timezone(&Utc);
        let expires_at = row
            .expires_at
            .map(|s| {
                DateTime::parse_from_rfc3339(&s)
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|e| OrchestratorError::Store(format!("bad expiry: {e}")))
            })
            .transpose()?;
        Ok(MemoryEntry {
            key: row.key,
            value,
            timestamp,
            expires_at,
        })
    }
}

impl SqliteStore {
    /// Open (or create) the database at `path` and run the migration.
    pub async fn open(path: &str, max_connections: u32) -> OrchResult<Self> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| OrchestratorError::Store(format!("create {parent:?}: {e}")))?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{path}"))
            .map_err(|e| OrchestratorError::Store(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Build a store over an existing pool (tests).
    pub async fn from_pool(pool: SqlitePool) -> OrchResult<Self> {
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> OrchResult<()> {
        sqlx::query(
            r"CREATE TABLE IF NOT EXISTS memory_entries (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_memory_entries_expires ON memory_entries (expires_at)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn like_pattern(pattern: &str) -> String {
        pattern
            .replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_")
            .replace('*', "%")
    }
}

#[async_trait]
impl MemoryStore for SqliteStore {
    async fn store(
        &self,
        key: &str,
        value: &serde_json::Value,
        ttl_s: Option<u64>,
    ) -> OrchResult<()> {
        let entry = MemoryEntry::new(key, value.clone(), ttl_s);
        sqlx::query(
            r"INSERT INTO memory_entries (key, value, created_at, expires_at)
              VALUES (?, ?, ?, ?)
              ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                created_at = excluded.created_at,
                expires_at = excluded.expires_at",
        )
        .bind(key)
        .bind(serde_json::to_string(value)?)
        .bind(entry.timestamp.to_rfc3339())
        .bind(entry.expires_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn retrieve(&self, key: &str) -> OrchResult<Option<MemoryEntry>> {
        let row: Option<EntryRow> = sqlx::query_as(
            "SELECT key, value, created_at, expires_at FROM memory_entries WHERE key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let entry = MemoryEntry::try_from(row)?;
                if entry.is_expired() {
                    let _ = self.delete(key).await;
                    Ok(None)
                } else {
                    Ok(Some(entry))
                }
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> OrchResult<bool> {
        let result = sqlx::query("DELETE FROM memory_entries WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn search(&self, pattern: &str, limit: usize) -> OrchResult<Vec<MemoryEntry>> {
        let rows: Vec<EntryRow> = sqlx::query_as(
            r"SELECT key, value, created_at, expires_at FROM memory_entries
              WHERE key LIKE ? ESCAPE '\'
                AND (expires_at IS NULL OR expires_at > ?)
              ORDER BY created_at DESC
              LIMIT ?",
        )
        .bind(Self::like_pattern(pattern))
        .bind(Utc::now().to_rfc3339())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(MemoryEntry::try_from).collect()
    }

    async fn cleanup_expired(&self) -> OrchResult<u64> {
        let result = sqlx::query(
            "DELETE FROM memory_entries WHERE expires_at IS NOT NULL AND expires_at <= ?",
        )
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> SqliteStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        SqliteStore::from_pool(pool).await.unwrap()
    }

    #[tokio::test]
    async fn test_roundtrip() {
        let store = memory_store().await;
        let value = serde_json::json!({"worker": "brisk-otter", "progress": 40});
        store
            .store("orchflow/workers/w1/context", &value, Some(3600))
            .await
            .unwrap();

        let entry = store
            .retrieve("orchflow/workers/w1/context")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.value, value);
    }

    #[tokio::test]
    async fn test_overwrite_last_write_wins() {
        let store = memory_store().await;
        store.store("k", &serde_json::json!(1), None).await.unwrap();
        store.store("k", &serde_json::json!(2), None).await.unwrap();
        assert_eq!(
            store.retrieve("k").await.unwrap().unwrap().value,
            serde_json::json!(2)
        );
    }

    #[tokio::test]
    async fn test_expired_key_absent() {
        let store = memory_store().await;
        store
            .store("short", &serde_json::json!("x"), Some(0))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        assert!(store.retrieve("short").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_search_wildcard() {
        let store = memory_store().await;
        store
            .store("ns/tasks/1", &serde_json::json!(1), None)
            .await
            .unwrap();
        store
            .store("ns/tasks/2", &serde_json::json!(2), None)
            .await
            .unwrap();
        store
            .store("ns/patterns/p", &serde_json::json!("p"), None)
            .await
            .unwrap();

        let hits = store.search("ns/tasks/*", 10).await.unwrap();
        assert_eq!(hits.len(), 2);

        let hits = store.search("ns/*", 10).await.unwrap();
        assert_eq!(hits.len(), 3);
    }

    #[tokio::test]
    async fn test_delete_reports_existence() {
        let store = memory_store().await;
        store.store("k", &serde_json::json!(1), None).await.unwrap();
        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
    }
}

//! Memory store backends: SQLite persistence and the in-memory fallback.

pub mod cache;
pub mod sqlite;

pub use cache::{wildcard_match, InMemoryStore};
pub use sqlite::SqliteStore;

//! Persisted memory domain models.
//!
//! Entries live under hierarchical keys beneath a namespace prefix, with
//! advisory TTLs. The store never returns expired keys.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Advisory TTLs per record family, in seconds.
pub mod ttl {
    /// Worker context records
    pub const WORKER_CONTEXT_S: u64 = 8 * 3600;
    /// Worker decision records
    pub const WORKER_DECISION_S: u64 = 12 * 3600;
    /// Task history records
    pub const TASK_HISTORY_S: u64 = 24 * 3600;
    /// Learned command patterns
    pub const PATTERN_S: u64 = 48 * 3600;
    /// Metrics snapshots
    pub const METRICS_S: u64 = 48 * 3600;
    /// Saved sessions
    pub const SESSION_S: u64 = 7 * 24 * 3600;
}

/// Key layout helpers for the hierarchical store.
pub mod keys {
    use uuid::Uuid;

    pub fn worker_context(ns: &str, worker_id: Uuid) -> String {
        format!("{ns}/workers/{worker_id}/context")
    }

    pub fn worker_decision(ns: &str, worker_id: Uuid, ts_millis: i64) -> String {
        format!("{ns}/workers/{worker_id}/decisions/{ts_millis}")
    }

    pub fn task_history(ns: &str, task_id: Uuid) -> String {
        format!("{ns}/tasks/{task_id}")
    }

    pub fn pattern(ns: &str, normalized: &str) -> String {
        format!("{ns}/patterns/{normalized}")
    }

    pub fn metrics(ns: &str, ts_millis: i64) -> String {
        format!("{ns}/metrics/{ts_millis}")
    }

    pub fn session(ns: &str, name: &str) -> String {
        format!("{ns}/sessions/{name}")
    }
}

/// A raw key/value record in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    /// Full hierarchical key
    pub key: String,
    /// UTF-8 JSON value
    pub value: serde_json::Value,
    /// When written
    pub timestamp: DateTime<Utc>,
    /// Advisory expiry; expired entries are never returned
    pub expires_at: Option<DateTime<Utc>>,
}

impl MemoryEntry {
    pub fn new(key: impl Into<String>, value: serde_json::Value, ttl_s: Option<u64>) -> Self {
        let timestamp = Utc::now();
        Self {
            key: key.into(),
            value,
            timestamp,
            expires_at: ttl_s.map(|s| timestamp + chrono::Duration::seconds(s as i64)),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|t| Utc::now() > t)
    }
}

/// Persisted state of a worker, restored across sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerContext {
    pub worker_id: Uuid,
    pub worker_name: String,
    pub task_description: String,
    /// Progress 0..=100
    pub progress: u8,
    pub start_time: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    /// Notable decisions taken while working
    pub decisions: Vec<String>,
    pub current_focus: String,
    pub dependencies: Vec<String>,
    pub completed_milestones: Vec<String>,
}

impl WorkerContext {
    pub fn new(worker_id: Uuid, worker_name: impl Into<String>, task: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            worker_id,
            worker_name: worker_name.into(),
            task_description: task.into(),
            progress: 0,
            start_time: now,
            last_update: now,
            decisions: Vec::new(),
            current_focus: String::new(),
            dependencies: Vec::new(),
            completed_milestones: Vec::new(),
        }
    }

    /// Record a decision and refresh the update timestamp.
    pub fn record_decision(&mut self, decision: impl Into<String>) {
        self.decisions.push(decision.into());
        self.last_update = Utc::now();
    }

    /// Update progress, clamped to 100.
    pub fn set_progress(&mut self, progress: u8) {
        self.progress = progress.min(100);
        self.last_update = Utc::now();
    }
}

/// One executed task, persisted as history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskHistoryEntry {
    pub task_id: Uuid,
    /// The natural-language input that produced the task
    pub input: String,
    pub task_type: String,
    pub worker_id: Uuid,
    pub worker_name: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    /// The command that worked, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successful_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// A learned, normalized command pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandPattern {
    /// Normalized input with placeholders
    pub pattern: String,
    pub frequency: u32,
    pub success_rate: f64,
    pub avg_response_time_ms: f64,
    pub last_used: DateTime<Utc>,
}

impl CommandPattern {
    /// First observation of a pattern.
    pub fn first(pattern: impl Into<String>, response_time_ms: f64) -> Self {
        Self {
            pattern: pattern.into(),
            frequency: 1,
            success_rate: 1.0,
            avg_response_time_ms: response_time_ms,
            last_used: Utc::now(),
        }
    }

    /// Merge a repeated successful observation into the pattern.
    pub fn merge_success(&mut self, response_time_ms: f64) {
        self.frequency += 1;
        self.success_rate = (self.success_rate + 1.0) / 2.0;
        self.avg_response_time_ms = (self.avg_response_time_ms + response_time_ms) / 2.0;
        self.last_used = Utc::now();
    }
}

/// File extensions collapsed to `[FILE]` during normalization.
const FILE_EXTENSIONS: [&str; 5] = [".js", ".ts", ".py", ".java", ".cpp"];

/// Normalize a natural-language input into a pattern key.
///
/// Consecutive capitalized word pairs become `[NAME]`, integers become
/// `[NUMBER]`, recognized source filenames become `[FILE]`, everything
/// else is lowercased.
pub fn normalize_pattern(input: &str) -> String {
    let tokens: Vec<&str> = input.split_whitespace().collect();
    let mut out: Vec<String> = Vec::with_capacity(tokens.len());
    let mut i = 0;

    while i < tokens.len() {
        let token = tokens[i];
        if i + 1 < tokens.len() && is_capitalized(token) && is_capitalized(tokens[i + 1]) {
            out.push("[NAME]".to_string());
            i += 2;
            continue;
        }
        if token.parse::<i64>().is_ok() {
            out.push("[NUMBER]".to_string());
        } else if FILE_EXTENSIONS
            .iter()
            .any(|ext| token.to_lowercase().ends_with(ext))
        {
            out.push("[FILE]".to_string());
        } else {
            out.push(token.to_lowercase());
        }
        i += 1;
    }

    out.join(" ")
}

fn is_capitalized(token: &str) -> bool {
    let mut chars = token.chars();
    chars
        .next()
        .is_some_and(|c| c.is_alphabetic() && c.is_uppercase())
        && chars.all(char::is_alphanumeric)
}

/// Jaccard similarity over whitespace-tokenized lowercase words.
pub fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let set_a: std::collections::HashSet<String> =
        a.split_whitespace().map(str::to_lowercase).collect();
    let set_b: std::collections::HashSet<String> =
        b.split_whitespace().map(str::to_lowercase).collect();

    if set_a.is_empty() && set_b.is_empty() {
        return 1.0;
    }

    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    intersection as f64 / union as f64
}

/// Threshold above which two inputs are considered similar.
pub const SIMILARITY_THRESHOLD: f64 = 0.6;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_expiry() {
        let entry = MemoryEntry::new("k", serde_json::json!(1), Some(3600));
        assert!(!entry.is_expired());

        let mut entry = MemoryEntry::new("k", serde_json::json!(1), Some(0));
        entry.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        assert!(entry.is_expired());
    }

    #[test]
    fn test_key_layout() {
        let id = Uuid::nil();
        assert_eq!(
            keys::worker_context("orchflow", id),
            format!("orchflow/workers/{id}/context")
        );
        assert_eq!(
            keys::pattern("orchflow", "fix the [FILE]"),
            "orchflow/patterns/fix the [FILE]"
        );
        assert_eq!(keys::session("orchflow", "friday"), "orchflow/sessions/friday");
    }

    #[test]
    fn test_normalize_numbers_and_files() {
        assert_eq!(
            normalize_pattern("Fix 3 bugs in auth.ts"),
            "fix [NUMBER] bugs in [FILE]"
        );
        assert_eq!(normalize_pattern("run Main.java now"), "run [FILE] now");
    }

    #[test]
    fn test_normalize_proper_noun_pairs() {
        assert_eq!(
            normalize_pattern("ask Jane Doe to review"),
            "ask [NAME] to review"
        );
        // A single capitalized word is not a name pair
        assert_eq!(normalize_pattern("Deploy the service"), "deploy the service");
    }

    #[test]
    fn test_pattern_merge_algebra() {
        let mut pattern = CommandPattern::first("fix the [FILE]", 100.0);
        assert_eq!(pattern.frequency, 1);
        assert!((pattern.success_rate - 1.0).abs() < f64::EPSILON);

        // k successful merges keep the running mean at 1.0 and halve toward
        // the newest response time
        pattern.merge_success(200.0);
        pattern.merge_success(200.0);
        assert_eq!(pattern.frequency, 3);
        assert!((pattern.success_rate - 1.0).abs() < f64::EPSILON);
        assert!((pattern.avg_response_time_ms - 175.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_jaccard() {
        assert!((jaccard_similarity("fix the bug", "fix the bug") - 1.0).abs() < f64::EPSILON);
        let sim = jaccard_similarity("fix the login bug", "fix the logout bug");
        assert!(sim >= 0.5 && sim < 1.0);
        assert!((jaccard_similarity("alpha", "beta") - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_worker_context_progress_clamped() {
        let mut ctx = WorkerContext::new(Uuid::new_v4(), "brisk-otter", "build feature");
        ctx.set_progress(150);
        assert_eq!(ctx.progress, 100);
        ctx.record_decision("used sqlite");
        assert_eq!(ctx.decisions.len(), 1);
    }
}

//! QueueEntry: one (task, branch) pair awaiting integration.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use taskstore::{IndexValue, Record, generate_id, now_ms};

/// Default mergeability-UNKNOWN retry bound, used when no explicit limit is
/// passed in (kept for callers/tests that don't care about the configured
/// value — `Config::review.unknown_retry_limit` is the one the daemon
/// actually runs with).
pub const UNKNOWN_RETRY_LIMIT: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Queued,
    Merging,
    PendingReview,
    Merged,
    Excluded,
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Merging => "merging",
            Self::PendingReview => "pending_review",
            Self::Merged => "merged",
            Self::Excluded => "excluded",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: String,
    pub task_id: String,
    pub branch: String,
    pub repo_path: String,
    pub status: QueueStatus,

    #[serde(default)]
    pub failure_reason: Option<String>,

    /// Consecutive-UNKNOWN-mergeability counter; reset whenever the branch is
    /// freshly (re)pushed.
    #[serde(default)]
    pub unknown_retries: u32,

    pub created_at: i64,
    pub updated_at: i64,
}

impl QueueEntry {
    pub fn new(task_id: impl Into<String>, branch: impl Into<String>, repo_path: impl Into<String>) -> Self {
        let task_id = task_id.into();
        let now = now_ms();
        Self {
            id: generate_id("queue", &task_id),
            task_id,
            branch: branch.into(),
            repo_path: repo_path.into(),
            status: QueueStatus::Queued,
            failure_reason: None,
            unknown_retries: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_status(&mut self, status: QueueStatus) {
        self.status = status;
        self.updated_at = now_ms();
    }

    pub fn exclude(&mut self, reason: impl Into<String>) {
        self.status = QueueStatus::Excluded;
        self.failure_reason = Some(reason.into());
        self.updated_at = now_ms();
    }

    /// Reset the unknown-mergeability counter (called on fresh push).
    pub fn reset_unknown_retries(&mut self) {
        self.unknown_retries = 0;
        self.updated_at = now_ms();
    }

    /// Increment the counter, returning `true` once `limit` is exceeded
    /// (caller should force a merge attempt anyway).
    pub fn bump_unknown_retries(&mut self, limit: u32) -> bool {
        self.unknown_retries += 1;
        self.updated_at = now_ms();
        self.unknown_retries > limit
    }

    pub fn is_active(&self) -> bool {
        matches!(self.status, QueueStatus::Queued | QueueStatus::Merging | QueueStatus::PendingReview)
    }
}

impl Record for QueueEntry {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "queue_entries"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("status".to_string(), IndexValue::String(self.status.to_string()));
        fields.insert("task_id".to_string(), IndexValue::String(self.task_id.clone()));
        fields.insert("repo_path".to_string(), IndexValue::String(self.repo_path.clone()));
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_entry_is_queued_with_zero_retries() {
        let entry = QueueEntry::new("task-1", "task-1-branch", "/repo");
        assert_eq!(entry.status, QueueStatus::Queued);
        assert_eq!(entry.unknown_retries, 0);
        assert!(entry.is_active());
    }

    #[test]
    fn exclude_sets_reason_and_status() {
        let mut entry = QueueEntry::new("task-1", "b", "/repo");
        entry.exclude("branch not rebased on main");
        assert_eq!(entry.status, QueueStatus::Excluded);
        assert_eq!(entry.failure_reason.as_deref(), Some("branch not rebased on main"));
        assert!(!entry.is_active());
    }

    #[test]
    fn unknown_retries_force_after_limit() {
        let mut entry = QueueEntry::new("task-1", "b", "/repo");
        for _ in 0..UNKNOWN_RETRY_LIMIT {
            assert!(!entry.bump_unknown_retries(UNKNOWN_RETRY_LIMIT));
        }
        // The (N+1)th bump crosses the threshold.
        assert!(entry.bump_unknown_retries(UNKNOWN_RETRY_LIMIT));
        assert_eq!(entry.unknown_retries, UNKNOWN_RETRY_LIMIT + 1);
    }

    #[test]
    fn reset_clears_counter() {
        let mut entry = QueueEntry::new("task-1", "b", "/repo");
        entry.bump_unknown_retries(UNKNOWN_RETRY_LIMIT);
        entry.bump_unknown_retries(UNKNOWN_RETRY_LIMIT);
        entry.reset_unknown_retries();
        assert_eq!(entry.unknown_retries, 0);
    }
}

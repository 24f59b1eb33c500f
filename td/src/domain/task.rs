//! Task: the primary scheduler entity.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use taskstore::{IndexValue, Record, generate_id, now_ms};

/// Byte budget for `last_error`; matches the truncation rule in §5.
pub const LAST_ERROR_BUDGET: usize = 8_000;

/// Reserved status values outside any mode's own phase names.
pub const STATUS_BACKLOG: &str = "backlog";
pub const STATUS_DONE: &str = "done";
pub const STATUS_MERGED: &str = "merged";
pub const STATUS_FAILED: &str = "failed";
pub const STATUS_REBASE: &str = "rebase";

/// A code-change task advancing through its mode's phase graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    pub repo_path: String,
    pub mode: String,

    /// Current phase name, or one of the reserved terminal/recovery states
    /// (`done`, `merged`, `failed`, `rebase`).
    pub status: String,

    /// Branch name once the setup phase has run; empty before that.
    #[serde(default)]
    pub branch: String,

    /// Opaque agent-runner resume token.
    #[serde(default)]
    pub session_id: Option<String>,

    pub attempt: u32,
    pub max_attempts: u32,

    #[serde(default)]
    pub last_error: Option<String>,

    #[serde(default)]
    pub notify_chat: Option<String>,

    /// Non-null iff a worker currently owns this task. The exactly-once dispatch
    /// lock, stored as a Unix-millisecond timestamp of the claim.
    #[serde(default)]
    pub dispatched_at: Option<i64>,

    pub created_at: i64,
    pub updated_at: i64,
}

impl Task {
    pub fn new(title: impl Into<String>, description: impl Into<String>, repo_path: impl Into<String>, mode: impl Into<String>, max_attempts: u32) -> Self {
        let title = title.into();
        let now = now_ms();
        Self {
            id: generate_id("task", &title),
            title,
            description: description.into(),
            repo_path: repo_path.into(),
            mode: mode.into(),
            status: STATUS_BACKLOG.to_string(),
            branch: String::new(),
            session_id: None,
            attempt: 0,
            max_attempts,
            last_error: None,
            notify_chat: None,
            dispatched_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status.as_str(), STATUS_MERGED | STATUS_FAILED)
    }

    pub fn is_dispatched(&self) -> bool {
        self.dispatched_at.is_some()
    }

    pub fn set_status(&mut self, status: impl Into<String>) {
        self.status = status.into();
        self.updated_at = now_ms();
    }

    pub fn set_branch(&mut self, branch: impl Into<String>) {
        self.branch = branch.into();
        self.updated_at = now_ms();
    }

    pub fn set_session_id(&mut self, session_id: impl Into<String>) {
        self.session_id = Some(session_id.into());
        self.updated_at = now_ms();
    }

    /// Store a diagnostic, truncated to `LAST_ERROR_BUDGET` bytes (tail kept —
    /// the most recent lines of a test failure matter more than the first).
    pub fn set_last_error(&mut self, error: impl AsRef<str>) {
        self.last_error = Some(truncate_tail(error.as_ref(), LAST_ERROR_BUDGET));
        self.updated_at = now_ms();
    }

    pub fn clear_last_error(&mut self) {
        self.last_error = None;
        self.updated_at = now_ms();
    }

    /// Bump the retry counter. Returns `true` if the budget is now exhausted
    /// (caller should transition to `failed`).
    pub fn bump_attempt(&mut self) -> bool {
        self.attempt += 1;
        self.updated_at = now_ms();
        self.attempt >= self.max_attempts
    }

    pub fn mark_dispatched(&mut self) {
        self.dispatched_at = Some(now_ms());
        self.updated_at = now_ms();
    }

    pub fn clear_dispatch(&mut self) {
        self.dispatched_at = None;
        self.updated_at = now_ms();
    }
}

/// Truncate to at most `budget` bytes, keeping the tail (on a char boundary).
pub fn truncate_tail(s: &str, budget: usize) -> String {
    if s.len() <= budget {
        return s.to_string();
    }
    let start = s.len() - budget;
    let mut start = start;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].to_string()
}

impl Record for Task {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "tasks"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("status".to_string(), IndexValue::String(self.status.clone()));
        fields.insert("repo_path".to_string(), IndexValue::String(self.repo_path.clone()));
        fields.insert("mode".to_string(), IndexValue::String(self.mode.clone()));
        fields.insert("dispatched".to_string(), IndexValue::Bool(self.dispatched_at.is_some()));
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_task_starts_in_backlog_undispatched() {
        let task = Task::new("Add helper", "desc", "/repo", "spec-qa-impl", 3);
        assert_eq!(task.status, STATUS_BACKLOG);
        assert!(!task.is_dispatched());
        assert!(!task.is_terminal());
        assert_eq!(task.attempt, 0);
    }

    #[test]
    fn bump_attempt_reports_exhaustion_at_max() {
        let mut task = Task::new("t", "d", "/repo", "m", 3);
        assert!(!task.bump_attempt());
        assert!(!task.bump_attempt());
        assert!(task.bump_attempt());
        assert_eq!(task.attempt, 3);
    }

    #[test]
    fn dispatch_lock_round_trips() {
        let mut task = Task::new("t", "d", "/repo", "m", 3);
        task.mark_dispatched();
        assert!(task.is_dispatched());
        task.clear_dispatch();
        assert!(!task.is_dispatched());
    }

    #[test]
    fn last_error_truncates_to_tail() {
        let mut task = Task::new("t", "d", "/repo", "m", 3);
        let long = "x".repeat(LAST_ERROR_BUDGET + 500);
        task.set_last_error(&long);
        assert_eq!(task.last_error.as_ref().unwrap().len(), LAST_ERROR_BUDGET);
    }

    #[test]
    fn last_error_exactly_at_budget_is_preserved() {
        let mut task = Task::new("t", "d", "/repo", "m", 3);
        let exact = "y".repeat(LAST_ERROR_BUDGET);
        task.set_last_error(&exact);
        assert_eq!(task.last_error.as_ref().unwrap().len(), LAST_ERROR_BUDGET);
        assert_eq!(task.last_error.unwrap(), exact);
    }

    #[test]
    fn terminal_states_are_merged_and_failed_only() {
        let mut task = Task::new("t", "d", "/repo", "m", 3);
        task.set_status(STATUS_REBASE);
        assert!(!task.is_terminal());
        task.set_status(STATUS_MERGED);
        assert!(task.is_terminal());
    }
}

//! TaskOutput: append-only log of each phase's agent text and event stream.
//!
//! Observability only — the scheduler itself never reads these rows back to
//! decide anything. Written once per agent invocation by the Phase
//! Executor, truncated to a bounded size.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use taskstore::{IndexValue, Record, generate_id, now_ms};

use super::task::truncate_tail;

/// Byte budget for a persisted phase output row.
pub const OUTPUT_BUDGET: usize = 64_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutput {
    pub id: String,
    pub task_id: String,
    pub phase_name: String,

    /// The agent's final accumulated text result.
    pub final_text: String,

    /// The raw newline-delimited event stream, truncated to `OUTPUT_BUDGET`.
    pub event_log: String,

    /// Unified diff produced by this phase's commit step, if it committed.
    /// Empty for phases that don't commit, or when the commit step hasn't
    /// run yet.
    #[serde(default)]
    pub diff: String,

    pub created_at: i64,
    pub updated_at: i64,
}

impl TaskOutput {
    pub fn new(task_id: impl Into<String>, phase_name: impl Into<String>, final_text: impl Into<String>, event_log: impl AsRef<str>) -> Self {
        let task_id = task_id.into();
        let phase_name = phase_name.into();
        let now = now_ms();
        Self {
            id: generate_id("output", &format!("{task_id}-{phase_name}")),
            task_id,
            phase_name,
            final_text: final_text.into(),
            event_log: truncate_tail(event_log.as_ref(), OUTPUT_BUDGET),
            diff: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Attach the diff captured after a successful commit step.
    pub fn set_diff(&mut self, diff: impl AsRef<str>) {
        self.diff = truncate_tail(diff.as_ref(), OUTPUT_BUDGET);
        self.updated_at = now_ms();
    }
}

impl Record for TaskOutput {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "task_outputs"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("task_id".to_string(), IndexValue::String(self.task_id.clone()));
        fields.insert("phase_name".to_string(), IndexValue::String(self.phase_name.clone()));
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_log_truncates_to_budget() {
        let long = "e".repeat(OUTPUT_BUDGET + 1000);
        let output = TaskOutput::new("task-1", "impl", "done", &long);
        assert_eq!(output.event_log.len(), OUTPUT_BUDGET);
    }

    #[test]
    fn short_event_log_is_preserved_verbatim() {
        let output = TaskOutput::new("task-1", "impl", "done", "short log");
        assert_eq!(output.event_log, "short log");
    }

    #[test]
    fn new_output_has_no_diff_until_set() {
        let output = TaskOutput::new("task-1", "impl", "done", "log");
        assert!(output.diff.is_empty());
    }

    #[test]
    fn set_diff_truncates_to_budget() {
        let mut output = TaskOutput::new("task-1", "impl", "done", "log");
        let long = "d".repeat(OUTPUT_BUDGET + 1000);
        output.set_diff(&long);
        assert_eq!(output.diff.len(), OUTPUT_BUDGET);
    }
}

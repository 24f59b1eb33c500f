//! Proposal: a candidate future task surfaced by repository seeding.
//!
//! Consumed by triage/auto-promotion, both best-effort background jobs, not
//! by the core scheduler — the Phase Executor and Integration Coordinator
//! never read this type.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use taskstore::{IndexValue, Record, generate_id, now_ms};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    #[default]
    Proposed,
    Approved,
    AutoDismissed,
}

impl std::fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Proposed => "proposed",
            Self::Approved => "approved",
            Self::AutoDismissed => "auto_dismissed",
        };
        write!(f, "{s}")
    }
}

/// Scored dimensions a triage pass weighs when deciding to auto-promote or
/// auto-dismiss a proposal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProposalDimensions {
    pub impact: f64,
    pub effort: f64,
    pub risk: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub id: String,
    pub repo_path: String,
    pub title: String,
    pub description: String,
    pub score: f64,
    pub dimensions: ProposalDimensions,
    pub status: ProposalStatus,

    /// Id of the task created once this proposal is promoted.
    #[serde(default)]
    pub promoted_task_id: Option<String>,

    pub created_at: i64,
    pub updated_at: i64,
}

impl Proposal {
    pub fn new(repo_path: impl Into<String>, title: impl Into<String>, description: impl Into<String>, score: f64, dimensions: ProposalDimensions) -> Self {
        let title = title.into();
        let now = now_ms();
        Self {
            id: generate_id("proposal", &title),
            repo_path: repo_path.into(),
            title,
            description: description.into(),
            score,
            dimensions,
            status: ProposalStatus::Proposed,
            promoted_task_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn approve(&mut self, task_id: impl Into<String>) {
        self.status = ProposalStatus::Approved;
        self.promoted_task_id = Some(task_id.into());
        self.updated_at = now_ms();
    }

    pub fn auto_dismiss(&mut self) {
        self.status = ProposalStatus::AutoDismissed;
        self.updated_at = now_ms();
    }
}

impl Record for Proposal {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "proposals"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("status".to_string(), IndexValue::String(self.status.to_string()));
        fields.insert("repo_path".to_string(), IndexValue::String(self.repo_path.clone()));
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approve_records_promoted_task() {
        let mut p = Proposal::new("/repo", "Add caching", "desc", 0.8, ProposalDimensions::default());
        p.approve("task-99");
        assert_eq!(p.status, ProposalStatus::Approved);
        assert_eq!(p.promoted_task_id.as_deref(), Some("task-99"));
    }

    #[test]
    fn auto_dismiss_leaves_no_promoted_task() {
        let mut p = Proposal::new("/repo", "t", "d", 0.1, ProposalDimensions::default());
        p.auto_dismiss();
        assert_eq!(p.status, ProposalStatus::AutoDismissed);
        assert!(p.promoted_task_id.is_none());
    }
}

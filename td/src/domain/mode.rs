//! Mode and Phase: in-memory workflow definitions loaded from YAML configuration.
//!
//! A `Mode` is a named workflow (`spec-qa-impl`, `rebase`, ...); a `Phase` is one
//! step in that workflow. Unlike `Task`/`QueueEntry`, these are never persisted as
//! `Record`s — they are static configuration, reloaded from disk at startup.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// What kind of work a phase performs. Dispatch in the Phase Executor switches on
/// this, never on the phase's `name` string (see `PhaseExecutor::run`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    Setup,
    Agent,
    Rebase,
}

/// How a mode's completed work reaches the base repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationStyle {
    /// Push branch, open/track a PR, drive it through the Integration Coordinator.
    #[default]
    GitPr,
    /// No integration step; the phase graph terminates without queuing anything.
    None,
}

/// Per-phase behavior flags. Every flag defaults to `false` so a minimal YAML
/// phase definition (just `name`/`type`/`next`) is valid.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseFlags {
    pub use_docker: bool,
    pub runs_tests: bool,
    pub commits: bool,
    pub fresh_session: bool,
    pub include_task_context: bool,
    pub include_file_listing: bool,
    pub has_qa_fix_routing: bool,
    pub allow_no_changes: bool,
}

/// One step of a `Mode`'s workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    /// Matches the `status` value a `Task` carries while on this phase.
    pub name: String,

    #[serde(rename = "type")]
    pub kind: PhaseKind,

    /// Phase name to transition to on success. `"done"` is the reserved sentinel
    /// meaning "leave the mode's phase graph and enqueue for integration".
    pub next: String,

    /// Agent instruction body (phase type `agent`) or resolution instructions
    /// (phase type `rebase`). Ignored for `setup`.
    #[serde(default)]
    pub instruction: String,

    /// Template appended to the instruction when the task carries a `last_error`.
    /// `{{ERROR}}` is replaced with the truncated error tail.
    #[serde(default)]
    pub error_instruction: Option<String>,

    /// Rebase-phase-only: instructions for the one-shot test-fix agent.
    #[serde(default)]
    pub fix_instruction: Option<String>,

    /// Rebase-phase-only: error template for the fix agent, `{{ERROR}}` is the
    /// failing test output.
    #[serde(default)]
    pub fix_error_instruction: Option<String>,

    #[serde(default)]
    pub system_prompt: String,

    #[serde(default)]
    pub allowed_tools: Vec<String>,

    #[serde(default)]
    pub flags: PhaseFlags,

    /// A file whose presence in the worktree after the agent runs is required
    /// for the phase to be considered successful (e.g. `SPEC.md`).
    #[serde(default)]
    pub artifact: Option<String>,

    /// Commit message used when `flags.commits` is set.
    #[serde(default)]
    pub commit_message: Option<String>,
}

impl Phase {
    pub fn commit_message(&self) -> String {
        self.commit_message
            .clone()
            .unwrap_or_else(|| format!("{}: automated commit", self.name))
    }
}

/// A named workflow: an ordered phase graph plus policy flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mode {
    pub name: String,

    /// The phase a freshly created task starts in (usually `"backlog"` or the
    /// first setup phase's name).
    pub initial_phase: String,

    pub phases: Vec<Phase>,

    #[serde(default)]
    pub uses_worktrees: bool,

    #[serde(default)]
    pub test_command: Option<String>,

    #[serde(default)]
    pub integration: IntegrationStyle,

    /// Sub-mode names this mode's seeding job may spawn tasks under.
    #[serde(default)]
    pub seed_modes: Vec<String>,
}

impl Mode {
    pub fn phase(&self, name: &str) -> Option<&Phase> {
        self.phases.iter().find(|p| p.name == name)
    }

    pub fn uses_test_command(&self) -> bool {
        self.test_command.is_some()
    }
}

/// The full set of modes loaded from configuration, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct ModeTable {
    modes: HashMap<String, Mode>,
}

impl ModeTable {
    pub fn new(modes: Vec<Mode>) -> Self {
        Self {
            modes: modes.into_iter().map(|m| (m.name.clone(), m)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Mode> {
        self.modes.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.modes.keys().map(String::as_str).collect()
    }

    /// Load from a YAML file (a top-level list of `Mode`s).
    fn load_from_file(path: &std::path::Path) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| eyre::eyre!("failed to read {}: {e}", path.display()))?;
        let modes: Vec<Mode> = serde_yaml::from_str(&content).map_err(|e| eyre::eyre!("failed to parse {}: {e}", path.display()))?;
        tracing::info!(path = %path.display(), count = modes.len(), "ModeTable::load_from_file: loaded modes");
        Ok(Self::new(modes))
    }

    /// Load the mode table following the same fallback chain as `Config::load`:
    /// explicit path, project-local `.taskdaemon/modes.yml`, user config dir,
    /// then the compiled-in default mode.
    pub fn load(explicit: Option<&std::path::Path>) -> eyre::Result<Self> {
        if let Some(path) = explicit {
            return Self::load_from_file(path);
        }

        let local = std::path::PathBuf::from(".taskdaemon").join("modes.yml");
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(table) => return Ok(table),
                Err(e) => tracing::warn!(error = %e, "ModeTable::load: failed to load project-local modes.yml"),
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user = config_dir.join("taskdaemon").join("modes.yml");
            if user.exists() {
                match Self::load_from_file(&user) {
                    Ok(table) => return Ok(table),
                    Err(e) => tracing::warn!(error = %e, "ModeTable::load: failed to load user modes.yml"),
                }
            }
        }

        tracing::info!("ModeTable::load: no modes.yml found, using compiled-in default mode");
        Ok(Self::new(vec![default_mode()]))
    }
}

/// The compiled-in fallback mode, used when no `modes.yml` is configured:
/// backlog (setup) -> spec -> qa -> impl (tests) -> done, matching the
/// canonical spec/qa/impl workflow.
pub fn default_mode() -> Mode {
    Mode {
        name: "spec-qa-impl".to_string(),
        initial_phase: "backlog".to_string(),
        phases: vec![
            Phase {
                name: "backlog".to_string(),
                kind: PhaseKind::Setup,
                next: "spec".to_string(),
                instruction: String::new(),
                error_instruction: None,
                fix_instruction: None,
                fix_error_instruction: None,
                system_prompt: String::new(),
                allowed_tools: vec![],
                flags: PhaseFlags::default(),
                artifact: None,
                commit_message: None,
            },
            Phase {
                name: "spec".to_string(),
                kind: PhaseKind::Agent,
                next: "qa".to_string(),
                instruction: "Write a short SPEC.md describing the change to make.".to_string(),
                error_instruction: Some("The previous attempt failed: {{ERROR}}\n\nWrite SPEC.md again.".to_string()),
                fix_instruction: None,
                fix_error_instruction: None,
                system_prompt: String::new(),
                allowed_tools: vec![],
                flags: PhaseFlags {
                    commits: true,
                    include_task_context: true,
                    ..Default::default()
                },
                artifact: Some("SPEC.md".to_string()),
                commit_message: Some("spec: describe the change".to_string()),
            },
            Phase {
                name: "qa".to_string(),
                kind: PhaseKind::Agent,
                next: "impl".to_string(),
                instruction: "Write failing tests for the change described in SPEC.md.".to_string(),
                error_instruction: Some("The previous attempt failed: {{ERROR}}\n\nWrite the tests again.".to_string()),
                fix_instruction: None,
                fix_error_instruction: None,
                system_prompt: String::new(),
                allowed_tools: vec![],
                flags: PhaseFlags {
                    commits: true,
                    include_task_context: true,
                    ..Default::default()
                },
                artifact: None,
                commit_message: Some("qa: add failing tests".to_string()),
            },
            Phase {
                name: "impl".to_string(),
                kind: PhaseKind::Agent,
                next: "done".to_string(),
                instruction: "Implement the change described in SPEC.md until the tests pass.".to_string(),
                error_instruction: Some("The previous attempt failed: {{ERROR}}\n\nFix it.".to_string()),
                fix_instruction: None,
                fix_error_instruction: None,
                system_prompt: String::new(),
                allowed_tools: vec![],
                flags: PhaseFlags {
                    commits: true,
                    runs_tests: true,
                    include_task_context: true,
                    has_qa_fix_routing: true,
                    ..Default::default()
                },
                artifact: None,
                commit_message: Some("impl: implement the change".to_string()),
            },
        ],
        uses_worktrees: true,
        test_command: Some("cargo test".to_string()),
        integration: IntegrationStyle::GitPr,
        seed_modes: vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_mode() -> Mode {
        Mode {
            name: "spec-qa-impl".into(),
            initial_phase: "spec".into(),
            phases: vec![
                Phase {
                    name: "spec".into(),
                    kind: PhaseKind::Agent,
                    next: "qa".into(),
                    instruction: "Write a spec".into(),
                    error_instruction: None,
                    fix_instruction: None,
                    fix_error_instruction: None,
                    system_prompt: String::new(),
                    allowed_tools: vec![],
                    flags: PhaseFlags {
                        commits: true,
                        include_task_context: true,
                        ..Default::default()
                    },
                    artifact: Some("SPEC.md".into()),
                    commit_message: None,
                },
                Phase {
                    name: "impl".into(),
                    kind: PhaseKind::Agent,
                    next: "done".into(),
                    instruction: "Implement it".into(),
                    error_instruction: Some("Fix this: {{ERROR}}".into()),
                    fix_instruction: None,
                    fix_error_instruction: None,
                    system_prompt: String::new(),
                    allowed_tools: vec![],
                    flags: PhaseFlags {
                        commits: true,
                        runs_tests: true,
                        ..Default::default()
                    },
                    artifact: None,
                    commit_message: Some("implement".into()),
                },
            ],
            uses_worktrees: true,
            test_command: Some("cargo test".into()),
            integration: IntegrationStyle::GitPr,
            seed_modes: vec![],
        }
    }

    #[test]
    fn phase_lookup_by_name() {
        let mode = sample_mode();
        assert!(mode.phase("spec").is_some());
        assert!(mode.phase("missing").is_none());
    }

    #[test]
    fn default_commit_message_falls_back_to_phase_name() {
        let mode = sample_mode();
        assert_eq!(mode.phase("spec").unwrap().commit_message(), "spec: automated commit");
        assert_eq!(mode.phase("impl").unwrap().commit_message(), "implement");
    }

    #[test]
    fn mode_table_lookup() {
        let table = ModeTable::new(vec![sample_mode()]);
        assert!(table.get("spec-qa-impl").is_some());
        assert!(table.get("nope").is_none());
    }

    #[test]
    fn phase_deserializes_from_minimal_yaml() {
        let yaml = "name: setup\ntype: setup\nnext: spec\n";
        let phase: Phase = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(phase.kind, PhaseKind::Setup);
        assert!(!phase.flags.runs_tests);
    }

    #[test]
    fn default_mode_has_a_backlog_setup_phase_and_reaches_done() {
        let mode = default_mode();
        assert_eq!(mode.phase("backlog").unwrap().kind, PhaseKind::Setup);
        let mut name = "backlog".to_string();
        let mut hops = 0;
        while name != "done" {
            name = mode.phase(&name).unwrap().next.clone();
            hops += 1;
            assert!(hops < 10, "mode graph did not reach done");
        }
    }

    #[test]
    fn load_falls_back_to_default_mode_when_no_file_is_configured() {
        let table = ModeTable::load(None).unwrap();
        assert!(table.get("spec-qa-impl").is_some());
    }

    #[test]
    fn load_reads_an_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("modes.yml");
        std::fs::write(&path, "- name: bare\n  initial_phase: backlog\n  phases:\n    - name: backlog\n      type: setup\n      next: done\n").unwrap();
        let table = ModeTable::load(Some(&path)).unwrap();
        assert!(table.get("bare").is_some());
    }
}

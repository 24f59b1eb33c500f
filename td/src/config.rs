//! TaskDaemon configuration types and loading.
//!
//! `Config::load` resolves a fallback chain: explicit `--config` path,
//! project-local `.taskdaemon.yml`, user config dir, compiled-in defaults.
//! Sections cover what the pipeline scheduler needs: `pipeline`, `agent`,
//! `review`, `repos`.

use std::fs;
use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

/// Main TaskDaemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pipeline: PipelineConfig,
    pub agent: AgentConfig,
    pub review: ReviewConfig,
    pub git: GitConfig,
    pub storage: StorageConfig,
    pub repos: Vec<RepoConfig>,
}

impl Config {
    /// Load configuration with fallback chain.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let local_config = PathBuf::from(".taskdaemon.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => tracing::warn!("Failed to load config from {}: {}", local_config.display(), e),
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("taskdaemon").join("taskdaemon.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => tracing::warn!("Failed to load config from {}: {}", user_config.display(), e),
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Read just the `log_level` key out of whatever config file would be
    /// loaded, without requiring the rest of the file to parse cleanly.
    /// Needed because logging must be set up before the full config load
    /// (which itself logs warnings on fallback).
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        let path = config_path.cloned().or_else(|| {
            let local = PathBuf::from(".taskdaemon.yml");
            if local.exists() {
                return Some(local);
            }
            dirs::config_dir().map(|d| d.join("taskdaemon").join("taskdaemon.yml")).filter(|p| p.exists())
        })?;
        let content = fs::read_to_string(path).ok()?;
        let value: serde_yaml::Value = serde_yaml::from_str(&content).ok()?;
        value.get("log-level")?.as_str().map(|s| s.to_string())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Find a repo's configuration by its filesystem path.
    pub fn repo(&self, repo_path: &str) -> Option<&RepoConfig> {
        self.repos.iter().find(|r| r.path == repo_path)
    }
}

/// Pipeline Scheduler cadence and concurrency knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Seconds between Tick Loop iterations.
    #[serde(rename = "tick-interval-s")]
    pub tick_interval_s: u64,

    /// Minimum seconds between Integration Coordinator runs.
    #[serde(rename = "release-interval-s")]
    pub release_interval_s: u64,

    /// Global cap on concurrently dispatched agent invocations.
    #[serde(rename = "max-parallel-agents")]
    pub max_parallel_agents: usize,

    /// When false, the release interval gates integration runs; when true,
    /// integration still never runs more than once per minute.
    pub continuous: bool,

    /// Seconds to wait for in-flight workers to drain on shutdown.
    #[serde(rename = "shutdown-timeout-s")]
    pub shutdown_timeout_s: u64,

    /// Minimum seconds between each periodic background job (seed, health,
    /// triage, auto-promotion, self-update).
    #[serde(rename = "background-job-interval-s")]
    pub background_job_interval_s: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tick_interval_s: 10,
            release_interval_s: 300,
            max_parallel_agents: 4,
            continuous: true,
            shutdown_timeout_s: 30,
            background_job_interval_s: 600,
        }
    }
}

/// Agent Runner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Path to the agent-runtime adapter binary.
    pub binary: String,

    pub model: String,

    /// Path to a file or command that refreshes the OAuth token; external
    /// concern, only the path is read here.
    #[serde(rename = "oauth-token-path")]
    pub oauth_token_path: Option<PathBuf>,

    /// Per-task directory that stores agent session state between phases.
    #[serde(rename = "session-dir")]
    pub session_dir: PathBuf,

    /// Container image used for sandboxed invocations.
    pub image: String,

    #[serde(rename = "memory-limit-mb")]
    pub memory_limit_mb: u64,

    #[serde(rename = "agent-timeout-s")]
    pub agent_timeout_s: u64,

    /// Author identity for commits made inside a worktree.
    #[serde(rename = "commit-author")]
    pub commit_author: String,

    /// Suffix appended to every phase's system prompt.
    #[serde(rename = "global-instructions")]
    pub global_instructions: String,

    /// Byte budget for prompt injections (file listing, error context).
    #[serde(rename = "prompt-truncate-bytes")]
    pub prompt_truncate_bytes: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
            oauth_token_path: None,
            session_dir: PathBuf::from(".taskdaemon/sessions"),
            image: "taskdaemon-agent:latest".to_string(),
            memory_limit_mb: 4096,
            agent_timeout_s: 1800,
            commit_author: "TaskDaemon <taskdaemon@localhost>".to_string(),
            global_instructions: String::new(),
            prompt_truncate_bytes: 16_000,
        }
    }
}

/// Review-system (PR) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewConfig {
    /// CLI binary name (`gh` by default).
    pub binary: String,

    #[serde(rename = "auto-merge")]
    pub auto_merge: bool,

    /// Consecutive-UNKNOWN-mergeability bound before forcing a merge attempt
    /// anyway. Defaults to 5.
    #[serde(rename = "unknown-retry-limit")]
    pub unknown_retry_limit: u32,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            binary: "gh".to_string(),
            auto_merge: true,
            unknown_retry_limit: 5,
        }
    }
}

/// Git configuration (worktree root and quota).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    #[serde(rename = "worktree-dir")]
    pub worktree_dir: PathBuf,

    #[serde(rename = "disk-quota-gb")]
    pub disk_quota_gb: u32,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            worktree_dir: PathBuf::from("/tmp/taskdaemon/worktrees"),
            disk_quota_gb: 100,
        }
    }
}

/// TaskStore persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    #[serde(rename = "taskstore-dir")]
    pub taskstore_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            taskstore_dir: ".taskstore".to_string(),
        }
    }
}

/// One watched repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoConfig {
    pub path: String,

    #[serde(rename = "base-branch")]
    pub base_branch: String,

    /// Backlog file this repository seeds tasks from, if any.
    #[serde(rename = "backlog-file")]
    pub backlog_file: Option<String>,

    /// Per-repo override of `review.auto-merge`.
    #[serde(rename = "auto-merge")]
    pub auto_merge: Option<bool>,

    /// Mode name new tasks for this repo default to.
    #[serde(rename = "default-mode")]
    pub default_mode: String,

    #[serde(rename = "max-attempts")]
    pub max_attempts: u32,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            base_branch: "main".to_string(),
            backlog_file: None,
            auto_merge: None,
            default_mode: "spec-qa-impl".to_string(),
            max_attempts: 3,
        }
    }
}

impl RepoConfig {
    pub fn auto_merge(&self, default: bool) -> bool {
        self.auto_merge.unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_pipeline_values() {
        let config = Config::default();
        assert_eq!(config.pipeline.max_parallel_agents, 4);
        assert!(config.pipeline.continuous);
        assert_eq!(config.review.unknown_retry_limit, 5);
    }

    #[test]
    fn deserialize_config_with_repos() {
        let yaml = r#"
pipeline:
  tick-interval-s: 5
  max-parallel-agents: 8
agent:
  model: claude-opus-4
review:
  auto-merge: false
repos:
  - path: /srv/repo-a
    base-branch: main
    backlog-file: BACKLOG.md
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.pipeline.tick_interval_s, 5);
        assert_eq!(config.pipeline.max_parallel_agents, 8);
        assert_eq!(config.agent.model, "claude-opus-4");
        assert!(!config.review.auto_merge);
        assert_eq!(config.repos.len(), 1);
        assert_eq!(config.repos[0].path, "/srv/repo-a");
        assert_eq!(config.repos[0].backlog_file.as_deref(), Some("BACKLOG.md"));
    }

    #[test]
    fn partial_config_uses_defaults() {
        let yaml = "agent:\n  model: claude-haiku\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.agent.model, "claude-haiku");
        assert_eq!(config.pipeline.max_parallel_agents, 4);
    }

    #[test]
    fn repo_auto_merge_falls_back_to_global_default() {
        let repo = RepoConfig::default();
        assert!(repo.auto_merge(true));
        assert!(!repo.auto_merge(false));
    }
}

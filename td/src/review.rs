//! Review-system CLI wrapper (`gh`): PR state, mergeability, create, merge.
//!
//! Every operation returns a `(stdout, stderr, exit_code)`-shaped result;
//! failure is read off known substrings rather than raised

use tokio::process::Command;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ReviewError {
    #[error("failed to spawn gh: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrState {
    Open,
    Merged,
    Closed,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mergeability {
    Mergeable,
    Unknown,
    Conflicting,
    Other,
}

/// Failure-string markers the Integration Coordinator recognizes.
pub mod failure_strings {
    pub const NO_COMMITS_BETWEEN: &str = "No commits between";
    pub const NOT_MERGEABLE: &str = "not mergeable";
    pub const CANNOT_CREATE: &str = "cannot be cleanly created";
    pub const CANNOT_LOCK_REF: &str = "cannot lock ref";
}

#[derive(Debug, Clone)]
pub struct ReviewOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ReviewOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stderr_contains(&self, needle: &str) -> bool {
        self.stderr.contains(needle)
    }
}

/// Wraps the `gh` binary, scoped to one repository checkout.
#[derive(Debug, Clone)]
pub struct ReviewCli {
    repo_root: std::path::PathBuf,
    binary: String,
}

impl ReviewCli {
    pub fn new(repo_root: impl Into<std::path::PathBuf>, binary: impl Into<String>) -> Self {
        Self {
            repo_root: repo_root.into(),
            binary: binary.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<ReviewOutput, ReviewError> {
        debug!(binary = %self.binary, ?args, "ReviewCli::run: spawning");
        let output = Command::new(&self.binary).args(args).current_dir(&self.repo_root).output().await?;
        Ok(ReviewOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    pub async fn pr_state(&self, branch: &str) -> Result<(ReviewOutput, PrState), ReviewError> {
        let out = self.run(&["pr", "view", branch, "--json", "state", "-q", ".state"]).await?;
        let state = if !out.success() {
            PrState::Unknown
        } else {
            match out.stdout.trim() {
                "OPEN" => PrState::Open,
                "MERGED" => PrState::Merged,
                "CLOSED" => PrState::Closed,
                _ => PrState::Unknown,
            }
        };
        Ok((out, state))
    }

    pub async fn pr_mergeable(&self, branch: &str) -> Result<(ReviewOutput, Mergeability), ReviewError> {
        let out = self.run(&["pr", "view", branch, "--json", "mergeable", "-q", ".mergeable"]).await?;
        let mergeability = if !out.success() {
            Mergeability::Unknown
        } else {
            match out.stdout.trim() {
                "MERGEABLE" => Mergeability::Mergeable,
                "UNKNOWN" => Mergeability::Unknown,
                "CONFLICTING" => Mergeability::Conflicting,
                _ => Mergeability::Other,
            }
        };
        Ok((out, mergeability))
    }

    /// `true` iff a PR exists for `branch` (queried via `--json number`).
    pub async fn pr_exists(&self, branch: &str) -> Result<bool, ReviewError> {
        let out = self.run(&["pr", "view", branch, "--json", "number", "-q", ".number"]).await?;
        Ok(out.success() && !out.stdout.trim().is_empty())
    }

    pub async fn pr_create(&self, base: &str, head: &str, title: &str, body: &str) -> Result<ReviewOutput, ReviewError> {
        self.run(&["pr", "create", "--base", base, "--head", head, "--title", title, "--body", body]).await
    }

    pub async fn pr_merge_squash(&self, branch: &str) -> Result<ReviewOutput, ReviewError> {
        self.run(&["pr", "merge", branch, "--squash", "--delete-branch"]).await
    }
}

/// Strip shell metacharacters from a task title before it reaches an argv
/// slot (defense in depth; arguments are still passed as an argv array, never
/// through a shell string redesign flag).
pub fn sanitize_title(title: &str) -> String {
    title.replace(['"', '\\', '$', '`'], " ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_title_strips_shell_metacharacters() {
        let sanitized = sanitize_title(r#"fix `rm -rf $HOME` && echo "done""#);
        assert!(!sanitized.contains('`'));
        assert!(!sanitized.contains('$'));
        assert!(!sanitized.contains('"'));
    }

    #[test]
    fn sanitize_title_leaves_plain_text_untouched() {
        assert_eq!(sanitize_title("add caching layer"), "add caching layer");
    }
}

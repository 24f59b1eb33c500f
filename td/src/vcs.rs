//! Version-control wrapper: every git invocation the scheduler needs, as a
//! product type `(stdout, stderr, exit_code)` rather than a raised error.
//!
//! Callers inspect the result explicitly — a non-zero
//! exit is data, not necessarily a `VcsError`. `VcsError` is reserved for the
//! process itself failing to spawn.

use std::path::Path;

use tokio::process::Command;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum VcsError {
    #[error("failed to spawn git: {0}")]
    Spawn(#[from] std::io::Error),
}

/// The result of running a single git invocation.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl GitOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stderr_contains(&self, needle: &str) -> bool {
        self.stderr.contains(needle)
    }
}

/// A thin wrapper binding every git call to a fixed working directory.
#[derive(Debug, Clone)]
pub struct Vcs {
    repo_root: std::path::PathBuf,
}

impl Vcs {
    pub fn new(repo_root: impl Into<std::path::PathBuf>) -> Self {
        Self { repo_root: repo_root.into() }
    }

    async fn run_in(&self, dir: &Path, args: &[&str]) -> Result<GitOutput, VcsError> {
        debug!(?dir, ?args, "Vcs::run_in: spawning git");
        let output = Command::new("git").args(args).current_dir(dir).output().await?;
        Ok(GitOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn run(&self, args: &[&str]) -> Result<GitOutput, VcsError> {
        self.run_in(&self.repo_root, args).await
    }

    pub async fn checkout(&self, branch: &str) -> Result<GitOutput, VcsError> {
        self.run(&["checkout", branch]).await
    }

    pub async fn fetch(&self) -> Result<GitOutput, VcsError> {
        self.run(&["fetch", "origin"]).await
    }

    pub async fn checkout_new_branch(&self, branch: &str, start_point: &str) -> Result<GitOutput, VcsError> {
        self.run(&["checkout", "-B", branch, start_point]).await
    }

    pub async fn pull(&self) -> Result<GitOutput, VcsError> {
        self.run(&["pull", "--ff-only"]).await
    }

    pub async fn rev_parse(&self, reference: &str) -> Result<GitOutput, VcsError> {
        self.run(&["rev-parse", reference]).await
    }

    pub async fn rev_parse_verify(&self, reference: &str) -> Result<GitOutput, VcsError> {
        self.run(&["rev-parse", "--verify", reference]).await
    }

    /// Exit code 0 means `ancestor` is an ancestor of `descendant`.
    pub async fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<GitOutput, VcsError> {
        self.run(&["merge-base", "--is-ancestor", ancestor, descendant]).await
    }

    pub async fn worktree_add(&self, path: &Path, branch: &str, start_point: &str) -> Result<GitOutput, VcsError> {
        let path_str = path.to_string_lossy().into_owned();
        self.run(&["worktree", "add", &path_str, "-b", branch, start_point]).await
    }

    pub async fn worktree_remove(&self, path: &Path) -> Result<GitOutput, VcsError> {
        let path_str = path.to_string_lossy().into_owned();
        self.run(&["worktree", "remove", &path_str, "--force"]).await
    }

    pub async fn worktree_prune(&self) -> Result<GitOutput, VcsError> {
        self.run(&["worktree", "prune"]).await
    }

    pub async fn branch_delete(&self, branch: &str) -> Result<GitOutput, VcsError> {
        self.run(&["branch", "-D", branch]).await
    }

    pub async fn add_all(&self, worktree: &Path) -> Result<GitOutput, VcsError> {
        self.run_in(worktree, &["add", "-A"]).await
    }

    pub async fn commit(&self, worktree: &Path, message: &str, author: &str) -> Result<GitOutput, VcsError> {
        self.run_in(worktree, &["commit", "-m", message, "--author", author]).await
    }

    pub async fn diff_stat(&self, worktree: &Path, base: &str) -> Result<GitOutput, VcsError> {
        self.run_in(worktree, &["diff", "--stat", base]).await
    }

    /// Full unified diff between two refs, used to capture what a commit
    /// step actually changed.
    pub async fn diff(&self, worktree: &Path, from: &str, to: &str) -> Result<GitOutput, VcsError> {
        self.run_in(worktree, &["diff", from, to]).await
    }

    pub async fn status_porcelain(&self, worktree: &Path) -> Result<GitOutput, VcsError> {
        self.run_in(worktree, &["status", "--porcelain"]).await
    }

    pub async fn rebase(&self, worktree: &Path, onto: &str) -> Result<GitOutput, VcsError> {
        self.run_in(worktree, &["rebase", onto]).await
    }

    pub async fn rebase_abort(&self, worktree: &Path) -> Result<GitOutput, VcsError> {
        self.run_in(worktree, &["rebase", "--abort"]).await
    }

    pub async fn push(&self, worktree: &Path, branch: &str, force: bool) -> Result<GitOutput, VcsError> {
        let mut args = vec!["push", "origin", branch];
        if force {
            args.insert(1, "--force");
        }
        self.run_in(worktree, &args).await
    }

    pub async fn push_delete(&self, branch: &str) -> Result<GitOutput, VcsError> {
        self.run(&["push", "origin", "--delete", branch]).await
    }
}

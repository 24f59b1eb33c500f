//! Worktree lifecycle for the scheduler: one worktree per task, rooted at
//! `<repo>/.worktrees/task-<id>` (setup phase, `.git`-file invariant).

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::vcs::Vcs;

#[derive(Debug, thiserror::Error)]
pub enum WorktreeError {
    #[error("failed to create worktree: {0}")]
    CreateFailed(String),
    #[error("failed to remove worktree: {0}")]
    RemoveFailed(String),
    #[error("worktree is corrupted (`.git` is a directory, not a file): {0}")]
    Corrupted(PathBuf),
    #[error(transparent)]
    Vcs(#[from] crate::vcs::VcsError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Returns the canonical worktree path for a task under its repository.
pub fn worktree_path(repo_root: &Path, task_id: &str) -> PathBuf {
    repo_root.join(".worktrees").join(format!("task-{task_id}"))
}

/// `true` iff the worktree directory exists and its `.git` entry is a file
/// (the healthy state) rather than a directory (an agent ran `git init`
/// inside it, corrupting the worktree's `.git`-file invariant).
pub fn is_healthy(path: &Path) -> bool {
    let git_entry = path.join(".git");
    match std::fs::symlink_metadata(&git_entry) {
        Ok(meta) => meta.is_file(),
        Err(_) => false,
    }
}

/// Remove any stale worktree/branch left by a previous attempt, then create a
/// fresh one rooted at the base tip. Always tears down first, per the
/// resolved open question in (routine cleanup on every retry, not only
/// when corrupted) — the corrupted case is additionally logged distinctly
/// since it indicates a structural bug in the agent's sandbox.
pub async fn recreate(vcs: &Vcs, repo_root: &Path, task_id: &str, branch: &str, base_tip: &str) -> Result<PathBuf, WorktreeError> {
    let path = worktree_path(repo_root, task_id);

    if path.exists() {
        if path.join(".git").is_dir() {
            warn!(?path, "worktree::recreate: `.git` is a directory, agent likely ran `git init` inside the worktree");
        }
        debug!(?path, "worktree::recreate: removing stale worktree");
        let out = vcs.worktree_remove(&path).await?;
        if !out.success() && !out.stderr_contains("is not a working tree") {
            // Corrupted worktrees can defeat `git worktree remove`; force-delete the directory.
            std::fs::remove_dir_all(&path).ok();
        }
        vcs.worktree_prune().await?;
        vcs.branch_delete(branch).await.ok();
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let out = vcs.worktree_add(&path, branch, base_tip).await?;
    if !out.success() {
        return Err(WorktreeError::CreateFailed(out.stderr));
    }
    info!(?path, branch, "worktree::recreate: created fresh worktree");
    Ok(path)
}

pub async fn remove(vcs: &Vcs, path: &Path) -> Result<(), WorktreeError> {
    if !path.exists() {
        debug!(?path, "worktree::remove: already gone");
        return Ok(());
    }
    let out = vcs.worktree_remove(path).await?;
    if !out.success() && !out.stderr_contains("is not a working tree") {
        return Err(WorktreeError::RemoveFailed(out.stderr));
    }
    if path.exists() {
        std::fs::remove_dir_all(path).ok();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::process::Command;

    async fn setup_git_repo(dir: &Path) {
        Command::new("git").args(["init"]).current_dir(dir).output().await.unwrap();
        Command::new("git").args(["config", "user.email", "test@test.com"]).current_dir(dir).output().await.unwrap();
        Command::new("git").args(["config", "user.name", "Test"]).current_dir(dir).output().await.unwrap();
        Command::new("git").args(["commit", "--allow-empty", "-m", "initial"]).current_dir(dir).output().await.unwrap();
    }

    #[test]
    fn worktree_path_is_rooted_under_dot_worktrees() {
        let path = worktree_path(Path::new("/repo"), "42");
        assert_eq!(path, Path::new("/repo/.worktrees/task-42"));
    }

    #[test]
    fn is_healthy_false_when_missing() {
        assert!(!is_healthy(Path::new("/does/not/exist")));
    }

    #[tokio::test]
    async fn recreate_produces_a_healthy_worktree() {
        let repo = tempdir().unwrap();
        setup_git_repo(repo.path()).await;
        let vcs = Vcs::new(repo.path());

        let path = recreate(&vcs, repo.path(), "1", "task-1-branch", "HEAD").await.unwrap();
        assert!(path.exists());
        assert!(is_healthy(&path));

        remove(&vcs, &path).await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn recreate_tears_down_stale_worktree_first() {
        let repo = tempdir().unwrap();
        setup_git_repo(repo.path()).await;
        let vcs = Vcs::new(repo.path());

        let first = recreate(&vcs, repo.path(), "1", "task-1-branch", "HEAD").await.unwrap();
        std::fs::write(first.join("scratch.txt"), "stale").unwrap();

        let second = recreate(&vcs, repo.path(), "1", "task-1-branch", "HEAD").await.unwrap();
        assert_eq!(first, second);
        assert!(!second.join("scratch.txt").exists());

        remove(&vcs, &second).await.unwrap();
    }
}

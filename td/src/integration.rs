//! Integration Coordinator: walks each watched repository's queue,
//! pushes branches, drives PRs through the review system, and merges or
//! recycles entries back to the rebase phase.

use taskstore::Filter;
use tracing::{info, warn};

use crate::config::RepoConfig;
use crate::domain::{QueueEntry, QueueStatus, STATUS_MERGED, STATUS_REBASE, StateKv, Task};
use crate::phase::PhaseCtx;
use crate::review::{Mergeability, PrState, ReviewCli, failure_strings, sanitize_title};
use crate::vcs::Vcs;

/// Run the Integration Coordinator for every configured repository. Intended
/// to be called at most once per minute by the Tick Loop.
pub async fn run(ctx: &PhaseCtx) {
    for repo in ctx.config.repos.clone() {
        if let Err(e) = run_repo(ctx, &repo).await {
            warn!(repo = %repo.path, error = %e, "integration::run: repository pass failed");
        }
    }
}

async fn run_repo(ctx: &PhaseCtx, repo: &RepoConfig) -> Result<(), taskstore::StoreError> {
    let vcs = Vcs::new(&repo.path);
    let review = ReviewCli::new(&repo.path, &ctx.config.review.binary);
    let auto_merge = repo.auto_merge(ctx.config.review.auto_merge);

    // Step 1: read all queued entries, sorted oldest-first (merge order).
    let mut entries = {
        let store = ctx.store.lock().await;
        store.list::<QueueEntry>(&[Filter::eq("repo_path", taskstore::IndexValue::String(repo.path.clone()))])?
    };
    entries.retain(|e| e.status == QueueStatus::Queued);
    entries.sort_by_key(|e| e.created_at);

    if !entries.is_empty() {
        // Step 2: check out base and fast-forward.
        vcs.checkout(&repo.base_branch).await.ok();
        vcs.fetch().await.ok();
        vcs.pull().await.ok();

        let mut any_merged = false;

        for entry in entries {
            match process_entry(ctx, &vcs, &review, repo, auto_merge, entry).await {
                Ok(merged) => any_merged |= merged,
                Err(e) => warn!(repo = %repo.path, error = %e, "integration::run_repo: entry processing failed"),
            }
        }

        // Step 10: after any merges, re-sync the base branch locally.
        if any_merged {
            vcs.pull().await.ok();
        }
    }

    // Step 10 (cont.): backlog-file housekeeping, independent of this tick's
    // merge activity — the condition it watches for (every seeded task
    // merged) may only become true on a tick with an empty queue.
    if let Err(e) = maybe_cleanup_backlog_file(ctx, &vcs, &review, repo).await {
        warn!(repo = %repo.path, error = %e, "integration::run_repo: backlog cleanup check failed");
    }

    Ok(())
}

/// If the repository has a backlog file and every task it seeded has reached
/// `merged`, open a housekeeping PR removing the file so it isn't re-imported.
/// Gated by its own state-kv flag so the PR is only opened once per backlog
/// file.
async fn maybe_cleanup_backlog_file(ctx: &PhaseCtx, vcs: &Vcs, review: &ReviewCli, repo: &RepoConfig) -> Result<(), taskstore::StoreError> {
    let Some(backlog_file) = &repo.backlog_file else { return Ok(()) };
    let cleanup_key = format!("backlog_cleanup_done:{backlog_file}");
    let imported_key = format!("backlog_imported:{backlog_file}");

    let (already_done, imported_value) = {
        let store = ctx.store.lock().await;
        (store.get::<StateKv>(&cleanup_key)?.is_some(), store.get::<StateKv>(&imported_key)?.map(|kv| kv.value))
    };
    if already_done {
        return Ok(());
    }
    let Some(imported_value) = imported_value else { return Ok(()) };
    let task_ids: Vec<&str> = imported_value.split(',').filter(|s| !s.is_empty()).collect();
    if task_ids.is_empty() {
        return Ok(());
    }

    let all_merged = {
        let store = ctx.store.lock().await;
        let mut all = true;
        for id in &task_ids {
            match store.get::<Task>(id)? {
                Some(task) if task.status == STATUS_MERGED => {}
                _ => {
                    all = false;
                    break;
                }
            }
        }
        all
    };
    if !all_merged {
        return Ok(());
    }

    let file_path = std::path::Path::new(&repo.path).join(backlog_file);
    if !file_path.exists() {
        let mut store = ctx.store.lock().await;
        store.create(StateKv::new(cleanup_key, "true"))?;
        return Ok(());
    }

    let cleanup_branch = format!("taskdaemon/remove-{backlog_file}");
    vcs.checkout_new_branch(&cleanup_branch, &repo.base_branch).await.ok();
    if let Err(e) = std::fs::remove_file(&file_path) {
        warn!(path = %file_path.display(), error = %e, "integration::maybe_cleanup_backlog_file: failed to remove backlog file");
        vcs.checkout(&repo.base_branch).await.ok();
        return Ok(());
    }
    let repo_root = std::path::Path::new(&repo.path);
    vcs.add_all(repo_root).await.ok();
    vcs.commit(repo_root, &format!("chore: remove seeded backlog file {backlog_file}"), "taskdaemon <taskdaemon@local>").await.ok();
    let push = vcs.push(repo_root, &cleanup_branch, false).await;
    vcs.checkout(&repo.base_branch).await.ok();

    let Ok(push) = push else { return Ok(()) };
    if !push.success() {
        return Ok(());
    }

    let title = sanitize_title(&format!("Remove seeded backlog file {backlog_file}"));
    let body = "All tasks seeded from this backlog file have merged; removing it so it is not re-imported.";
    match review.pr_create(&repo.base_branch, &cleanup_branch, &title, body).await {
        Ok(output) if output.success() || output.stderr_contains(failure_strings::NO_COMMITS_BETWEEN) => {
            let mut store = ctx.store.lock().await;
            store.create(StateKv::new(cleanup_key, "true"))?;
            info!(repo = %repo.path, backlog_file, "integration::maybe_cleanup_backlog_file: opened housekeeping PR to remove backlog file");
        }
        Ok(output) => {
            warn!(repo = %repo.path, backlog_file, stderr = %output.stderr, "integration::maybe_cleanup_backlog_file: PR creation failed");
        }
        Err(e) => warn!(repo = %repo.path, backlog_file, error = %e, "integration::maybe_cleanup_backlog_file: PR creation failed"),
    }

    Ok(())
}

async fn process_entry(ctx: &PhaseCtx, vcs: &Vcs, review: &ReviewCli, repo: &RepoConfig, auto_merge: bool, mut entry: QueueEntry) -> Result<bool, taskstore::StoreError> {
    // Step 3: filter dead entries.
    let exists = vcs.rev_parse_verify(&entry.branch).await;
    if exists.is_err() || !exists.map(|o| o.success()).unwrap_or(false) {
        entry.exclude("branch not found");
        save_entry(ctx, entry).await?;
        return Ok(false);
    }

    // Step 4: pre-push PR state check.
    if let Ok((_, state)) = review.pr_state(&entry.branch).await {
        if state == PrState::Merged {
            entry.set_status(QueueStatus::Merged);
            save_entry(ctx, entry.clone()).await?;
            mark_task_merged(ctx, &entry.task_id).await?;
            return Ok(true);
        }
    }

    // Step 5: rebase gate.
    let base_tip = vcs.rev_parse(&format!("origin/{}", repo.base_branch)).await.map(|o| o.stdout.trim().to_string()).unwrap_or_default();
    let ancestor = vcs.is_ancestor(&base_tip, &entry.branch).await;
    if ancestor.is_err() || !ancestor.map(|o| o.success()).unwrap_or(false) {
        entry.exclude("branch not rebased on main");
        save_entry(ctx, entry.clone()).await?;
        move_task_to_rebase(ctx, &entry.task_id).await?;
        return Ok(false);
    }

    // Step 6: force-push.
    let worktree_path = crate::worktree::worktree_path(std::path::Path::new(&repo.path), &entry.task_id);
    let push_dir = if worktree_path.exists() { worktree_path.clone() } else { std::path::PathBuf::from(&repo.path) };
    let mut push = vcs.push(&push_dir, &entry.branch, true).await?;
    if !push.success() && push.stderr_contains(failure_strings::CANNOT_LOCK_REF) {
        vcs.push_delete(&entry.branch).await.ok();
        push = vcs.push(&push_dir, &entry.branch, true).await?;
    }
    if !push.success() {
        warn!(branch = %entry.branch, stderr = %push.stderr, "integration::process_entry: push failed, will retry next tick");
        return Ok(false);
    }

    // Step 7: ensure PR exists.
    let mut just_pushed = false;
    if !review.pr_exists(&entry.branch).await.unwrap_or(false) {
        let title = sanitize_title(&format!("Task {}", entry.task_id));
        let create = review.pr_create(&repo.base_branch, &entry.branch, &title, "Automated task branch.").await?;
        if !create.success() {
            if create.stderr_contains(failure_strings::NO_COMMITS_BETWEEN) {
                entry.set_status(QueueStatus::Merged);
                save_entry(ctx, entry.clone()).await?;
                mark_task_merged(ctx, &entry.task_id).await?;
                return Ok(true);
            }
            warn!(branch = %entry.branch, stderr = %create.stderr, "integration::process_entry: PR creation failed");
        } else {
            just_pushed = true;
        }
    }

    if !auto_merge {
        entry.set_status(QueueStatus::PendingReview);
        save_entry(ctx, entry).await?;
        return Ok(false);
    }

    if just_pushed {
        // Give the review system time to compute mergeability; try again next tick.
        entry.reset_unknown_retries();
        save_entry(ctx, entry).await?;
        return Ok(false);
    }

    // Step 8: merge readiness.
    let (_, mergeability) = review.pr_mergeable(&entry.branch).await?;
    let force = match mergeability {
        Mergeability::Mergeable => false,
        Mergeability::Unknown => {
            let force = entry.bump_unknown_retries(ctx.config.review.unknown_retry_limit);
            if !force {
                save_entry(ctx, entry).await?;
                return Ok(false);
            }
            info!(branch = %entry.branch, "integration::process_entry: unknown-mergeability retry budget exhausted, forcing merge attempt");
            true
        }
        Mergeability::Conflicting | Mergeability::Other => {
            entry.exclude("merge conflict reported by review system");
            save_entry(ctx, entry.clone()).await?;
            move_task_to_rebase(ctx, &entry.task_id).await?;
            return Ok(false);
        }
    };
    let _ = force;

    // Step 9: merge.
    entry.set_status(QueueStatus::Merging);
    save_entry(ctx, entry.clone()).await?;

    let merge = review.pr_merge_squash(&entry.branch).await?;
    if merge.success() {
        entry.set_status(QueueStatus::Merged);
        save_entry(ctx, entry.clone()).await?;
        mark_task_merged(ctx, &entry.task_id).await?;
        Ok(true)
    } else if merge.stderr_contains(failure_strings::NOT_MERGEABLE) || merge.stderr_contains(failure_strings::CANNOT_CREATE) {
        entry.exclude("merge failed: not mergeable");
        save_entry(ctx, entry.clone()).await?;
        move_task_to_rebase(ctx, &entry.task_id).await?;
        Ok(false)
    } else {
        warn!(branch = %entry.branch, stderr = %merge.stderr, "integration::process_entry: transient merge failure, restoring to queued");
        entry.set_status(QueueStatus::Queued);
        save_entry(ctx, entry).await?;
        Ok(false)
    }
}

async fn save_entry(ctx: &PhaseCtx, entry: QueueEntry) -> Result<(), taskstore::StoreError> {
    let mut store = ctx.store.lock().await;
    store.update(entry)?;
    Ok(())
}

async fn mark_task_merged(ctx: &PhaseCtx, task_id: &str) -> Result<(), taskstore::StoreError> {
    let mut store = ctx.store.lock().await;
    if let Some(mut task) = store.get::<Task>(task_id)? {
        task.set_status(STATUS_MERGED);
        store.update(task)?;
    }
    Ok(())
}

async fn move_task_to_rebase(ctx: &PhaseCtx, task_id: &str) -> Result<(), taskstore::StoreError> {
    let mut store = ctx.store.lock().await;
    if let Some(mut task) = store.get::<Task>(task_id)? {
        task.set_status(STATUS_REBASE);
        store.update(task)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::process::Command as StdCommand;
    use std::sync::Arc;

    use tempfile::tempdir;
    use tokio::sync::Mutex;

    use taskstore::Store;

    use super::*;
    use crate::config::Config;
    use crate::domain::{ModeTable, default_mode};
    use crate::notify::LoggingNotifier;
    use crate::sandbox::DockerDriver;

    fn run_git(dir: &std::path::Path, args: &[&str]) {
        let out = StdCommand::new("git").args(args).current_dir(dir).output().expect("git command failed");
        assert!(out.status.success(), "git {args:?} failed: {}", String::from_utf8_lossy(&out.stderr));
    }

    /// A work checkout with a bare `origin` remote and a branch one commit
    /// ahead of `main`, with both refs already pushed/tracked.
    fn setup_repo_with_branch(root: &std::path::Path, branch: &str) -> std::path::PathBuf {
        let origin = root.join("origin.git");
        std::fs::create_dir_all(&origin).unwrap();
        run_git(&origin, &["init", "--bare", "-b", "main"]);

        let work = root.join("work");
        std::fs::create_dir_all(&work).unwrap();
        run_git(&work, &["init", "-b", "main"]);
        run_git(&work, &["config", "user.email", "test@test.com"]);
        run_git(&work, &["config", "user.name", "Test"]);
        run_git(&work, &["commit", "--allow-empty", "-m", "initial"]);
        run_git(&work, &["remote", "add", "origin", origin.to_str().unwrap()]);
        run_git(&work, &["push", "-u", "origin", "main"]);

        run_git(&work, &["checkout", "-b", branch, "main"]);
        run_git(&work, &["commit", "--allow-empty", "-m", "task commit"]);
        run_git(&work, &["checkout", "main"]);

        work
    }

    /// Writes a stand-in `gh` binary: a shell script recognizing the
    /// `pr view`/`pr create`/`pr merge` invocations this module makes,
    /// answering with canned state instead of touching a real review system.
    fn write_fake_gh(dir: &std::path::Path, pr_exists: bool, state: &str, mergeable: &str) -> std::path::PathBuf {
        let path = dir.join("fake-gh.sh");
        let number_case = if pr_exists { "echo 123" } else { "exit 1" };
        let script = format!(
            "#!/bin/sh\ncase \"$2\" in\n  view)\n    case \"$5\" in\n      number) {number_case} ;;\n      state) echo \"{state}\" ;;\n      mergeable) echo \"{mergeable}\" ;;\n    esac\n    exit 0\n    ;;\n  merge)\n    exit 0\n    ;;\n  create)\n    echo \"https://example.invalid/pr/1\"\n    exit 0\n    ;;\nesac\nexit 1\n"
        );
        std::fs::write(&path, script).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn test_ctx(store_dir: &std::path::Path) -> PhaseCtx {
        let mut store = Store::open(store_dir).unwrap();
        store.rebuild_indexes::<Task>().unwrap();
        store.rebuild_indexes::<QueueEntry>().unwrap();
        PhaseCtx {
            store: Arc::new(Mutex::new(store)),
            modes: Arc::new(ModeTable::new(vec![default_mode()])),
            config: Arc::new(Config::default()),
            sandbox: Arc::new(DockerDriver::new()),
            notifier: Arc::new(LoggingNotifier),
        }
    }

    fn test_repo_config(path: &std::path::Path) -> RepoConfig {
        RepoConfig {
            path: path.to_string_lossy().into_owned(),
            base_branch: "main".to_string(),
            backlog_file: None,
            auto_merge: None,
            default_mode: "spec-qa-impl".to_string(),
            max_attempts: 3,
        }
    }

    #[tokio::test]
    async fn process_entry_excludes_entry_when_branch_is_gone() {
        let root = tempdir().unwrap();
        let work = setup_repo_with_branch(root.path(), "task-1");
        run_git(&work, &["branch", "-D", "task-1"]);

        let store_dir = tempdir().unwrap();
        let ctx = test_ctx(store_dir.path());
        let repo = test_repo_config(&work);
        let vcs = Vcs::new(&work);
        let review = ReviewCli::new(&work, "gh-unused-in-this-path");
        let entry = QueueEntry::new("task-1", "task-1", &repo.path);

        let merged = process_entry(&ctx, &vcs, &review, &repo, true, entry).await.unwrap();
        assert!(!merged);

        let store = ctx.store.lock().await;
        let saved = store.list::<QueueEntry>(&[]).unwrap();
        assert_eq!(saved[0].status, QueueStatus::Excluded);
        assert_eq!(saved[0].failure_reason.as_deref(), Some("branch not found"));
    }

    #[tokio::test]
    async fn process_entry_sends_unrebased_branch_back_to_rebase() {
        let root = tempdir().unwrap();
        let work = setup_repo_with_branch(root.path(), "task-2");
        // Advance main past the branch's base so it is no longer an ancestor.
        run_git(&work, &["commit", "--allow-empty", "-m", "main moved on"]);
        run_git(&work, &["push", "origin", "main"]);

        let store_dir = tempdir().unwrap();
        let ctx = test_ctx(store_dir.path());
        let task = Task::new("t", "d", work.to_string_lossy().into_owned(), "spec-qa-impl", 3);
        let task_id = task.id.clone();
        {
            let mut store = ctx.store.lock().await;
            store.create(task).unwrap();
        }

        let repo = test_repo_config(&work);
        let vcs = Vcs::new(&work);
        let review = ReviewCli::new(&work, "gh-unused-in-this-path");
        let entry = QueueEntry::new(&task_id, "task-2", &repo.path);

        let merged = process_entry(&ctx, &vcs, &review, &repo, true, entry).await.unwrap();
        assert!(!merged);

        let store = ctx.store.lock().await;
        let saved_entry = store.list::<QueueEntry>(&[]).unwrap();
        assert_eq!(saved_entry[0].status, QueueStatus::Excluded);
        assert_eq!(saved_entry[0].failure_reason.as_deref(), Some("branch not rebased on main"));

        let saved_task: Task = store.get(&task_id).unwrap().unwrap();
        assert_eq!(saved_task.status, STATUS_REBASE);
    }

    /// Regression test for the `just_pushed` bug: a branch whose PR already
    /// existed before this tick used to set `just_pushed = true` every tick
    /// and early-return, so it never reached the mergeability check. It
    /// should merge the same tick it is first observed mergeable.
    #[tokio::test]
    async fn process_entry_merges_a_pre_existing_mergeable_pr_in_one_tick() {
        let root = tempdir().unwrap();
        let work = setup_repo_with_branch(root.path(), "task-3");
        let gh = write_fake_gh(root.path(), true, "OPEN", "MERGEABLE");

        let store_dir = tempdir().unwrap();
        let ctx = test_ctx(store_dir.path());
        let task = Task::new("t", "d", work.to_string_lossy().into_owned(), "spec-qa-impl", 3);
        let task_id = task.id.clone();
        {
            let mut store = ctx.store.lock().await;
            store.create(task).unwrap();
        }

        let repo = test_repo_config(&work);
        let vcs = Vcs::new(&work);
        let review = ReviewCli::new(&work, gh.to_str().unwrap());
        let entry = QueueEntry::new(&task_id, "task-3", &repo.path);

        let merged = process_entry(&ctx, &vcs, &review, &repo, true, entry).await.unwrap();
        assert!(merged, "a pre-existing mergeable PR must merge on the tick it is observed mergeable");

        let store = ctx.store.lock().await;
        let saved_entry = store.list::<QueueEntry>(&[]).unwrap();
        assert_eq!(saved_entry[0].status, QueueStatus::Merged);

        let saved_task: Task = store.get(&task_id).unwrap().unwrap();
        assert_eq!(saved_task.status, STATUS_MERGED);
    }

    #[tokio::test]
    async fn process_entry_marks_pending_review_without_merging_when_auto_merge_is_disabled() {
        let root = tempdir().unwrap();
        let work = setup_repo_with_branch(root.path(), "task-4");
        let gh = write_fake_gh(root.path(), true, "OPEN", "MERGEABLE");

        let store_dir = tempdir().unwrap();
        let ctx = test_ctx(store_dir.path());
        let repo = test_repo_config(&work);
        let vcs = Vcs::new(&work);
        let review = ReviewCli::new(&work, gh.to_str().unwrap());
        let entry = QueueEntry::new("task-4", "task-4", &repo.path);

        let merged = process_entry(&ctx, &vcs, &review, &repo, false, entry).await.unwrap();
        assert!(!merged);

        let store = ctx.store.lock().await;
        let saved = store.list::<QueueEntry>(&[]).unwrap();
        assert_eq!(saved[0].status, QueueStatus::PendingReview);
    }
}

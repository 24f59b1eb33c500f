//! End-to-end tests that exercise the Phase Executor and backlog importer
//! against real git fixtures and a real (tempdir-backed) task store.
//!
//! These avoid anything that needs an external agent binary, container
//! engine, or `gh`: they cover the setup phase (pure git) and the backlog
//! import path, which is as far as a hermetic test can drive the pipeline.

use std::process::Command;
use std::sync::Arc;

use tempfile::tempdir;
use tokio::sync::Mutex;

use taskdaemon::config::{Config, RepoConfig};
use taskdaemon::domain::{Task, default_mode};
use taskdaemon::notify::LoggingNotifier;
use taskdaemon::sandbox::DockerDriver;
use taskdaemon::{PhaseCtx, domain::ModeTable};
use taskstore::Store;

fn init_repo(dir: &std::path::Path) {
    let run = |args: &[&str]| {
        Command::new("git").args(args).current_dir(dir).output().expect("git command failed");
    };
    run(&["init", "-b", "main"]);
    run(&["config", "user.email", "test@test.com"]);
    run(&["config", "user.name", "Test"]);
    run(&["commit", "--allow-empty", "-m", "initial"]);
}

fn test_ctx(repo_path: &str, store_dir: &std::path::Path) -> PhaseCtx {
    let mut store = Store::open(store_dir).unwrap();
    store.rebuild_indexes::<Task>().unwrap();
    store.rebuild_indexes::<taskdaemon::domain::StateKv>().unwrap();

    let config = Config {
        repos: vec![RepoConfig {
            path: repo_path.to_string(),
            base_branch: "main".to_string(),
            backlog_file: None,
            auto_merge: None,
            default_mode: "spec-qa-impl".to_string(),
            max_attempts: 3,
        }],
        ..Default::default()
    };

    PhaseCtx {
        store: Arc::new(Mutex::new(store)),
        modes: Arc::new(ModeTable::new(vec![default_mode()])),
        config: Arc::new(config),
        sandbox: Arc::new(DockerDriver::new()),
        notifier: Arc::new(LoggingNotifier),
    }
}

#[tokio::test]
async fn setup_phase_creates_worktree_and_advances_to_first_agent_phase() {
    let repo_dir = tempdir().unwrap();
    init_repo(repo_dir.path());
    let store_dir = tempdir().unwrap();

    let repo_path = repo_dir.path().to_string_lossy().into_owned();
    let ctx = test_ctx(&repo_path, store_dir.path());

    let task = Task::new("add a helper", "description", &repo_path, "spec-qa-impl", 3);
    let task_id = task.id.clone();
    {
        let mut store = ctx.store.lock().await;
        store.create(task).unwrap();
    }

    ctx.run(&task_id).await.unwrap();

    let saved: Task = {
        let store = ctx.store.lock().await;
        store.get(&task_id).unwrap().unwrap()
    };
    assert_eq!(saved.status, "spec");
    assert!(!saved.branch.is_empty());
    assert!(repo_dir.path().join(".worktrees").join(format!("task-{task_id}")).exists());
}

#[tokio::test]
async fn setup_phase_on_unresolvable_base_branch_leaves_task_in_backlog_for_retry() {
    let repo_dir = tempdir().unwrap();
    init_repo(repo_dir.path());
    let store_dir = tempdir().unwrap();

    let repo_path = repo_dir.path().to_string_lossy().into_owned();
    let mut store = Store::open(store_dir.path()).unwrap();
    store.rebuild_indexes::<Task>().unwrap();

    let config = Config {
        repos: vec![RepoConfig {
            path: repo_path.clone(),
            base_branch: "does-not-exist".to_string(),
            backlog_file: None,
            auto_merge: None,
            default_mode: "spec-qa-impl".to_string(),
            max_attempts: 3,
        }],
        ..Default::default()
    };
    let ctx = PhaseCtx {
        store: Arc::new(Mutex::new(store)),
        modes: Arc::new(ModeTable::new(vec![default_mode()])),
        config: Arc::new(config),
        sandbox: Arc::new(DockerDriver::new()),
        notifier: Arc::new(LoggingNotifier),
    };

    let task = Task::new("add a helper", "description", &repo_path, "spec-qa-impl", 3);
    let task_id = task.id.clone();
    {
        let mut store = ctx.store.lock().await;
        store.create(task).unwrap();
    }

    ctx.run(&task_id).await.unwrap();

    let saved: Task = {
        let store = ctx.store.lock().await;
        store.get(&task_id).unwrap().unwrap()
    };
    assert_eq!(saved.status, "backlog");
    assert!(saved.last_error.is_some());
}

#[tokio::test]
async fn backlog_import_is_idempotent_and_seeds_tasks_in_backlog_status() {
    let repo_dir = tempdir().unwrap();
    init_repo(repo_dir.path());
    let store_dir = tempdir().unwrap();

    let backlog_path = repo_dir.path().join("BACKLOG.md");
    std::fs::write(&backlog_path, "TASK_START\nTITLE: Add retries\nDESCRIPTION: Retry failed pushes.\nTASK_END\n").unwrap();

    let repo_path = repo_dir.path().to_string_lossy().into_owned();
    let ctx = test_ctx(&repo_path, store_dir.path());

    let imported_first = taskdaemon::backlog::import_backlog(&ctx, &repo_path, backlog_path.to_str().unwrap(), "spec-qa-impl", 3).await.unwrap();
    let imported_second = taskdaemon::backlog::import_backlog(&ctx, &repo_path, backlog_path.to_str().unwrap(), "spec-qa-impl", 3).await.unwrap();

    assert_eq!(imported_first, 1);
    assert_eq!(imported_second, 0);

    let tasks: Vec<Task> = {
        let store = ctx.store.lock().await;
        store.list(&[]).unwrap()
    };
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].status, "backlog");
    assert_eq!(tasks[0].title, "Add retries");
}

//! TaskDaemon - autonomous engineering orchestrator
//!
//! CLI entry point: parses arguments, loads configuration and the mode
//! table, and either drives the daemon lifecycle or dispatches to one of the
//! inspection/management subcommands against the task store directly.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{CommandFactory, FromArgMatches};
use eyre::{Context, Result};
use tracing::{debug, info};

use taskdaemon::cli::{Cli, Command, OutputFormat, QueueCommand, RepoCommand, TaskCommand, generate_after_help, get_log_path};
use taskdaemon::config::Config;
use taskdaemon::daemon::DaemonManager;
use taskdaemon::domain::{ModeTable, Proposal, QueueEntry, StateKv, Task, TaskOutput};
use taskdaemon::sandbox::DockerDriver;
use taskdaemon::Scheduler;
use taskstore::Store;

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    let log_dir = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from(".")).join("taskdaemon").join("logs");
    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let level_str = cli_log_level.or(config_log_level);
    let level = if let Some(s) = level_str {
        match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        }
    } else {
        tracing::Level::INFO
    };

    let log_file = fs::File::create(log_dir.join("taskdaemon.log")).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

fn open_store(config: &Config) -> Result<Store> {
    let mut store = Store::open(&config.storage.taskstore_dir).context("Failed to open task store")?;
    store.rebuild_indexes::<Task>().context("Failed to rebuild task index")?;
    store.rebuild_indexes::<QueueEntry>().context("Failed to rebuild queue index")?;
    store.rebuild_indexes::<Proposal>().context("Failed to rebuild proposal index")?;
    store.rebuild_indexes::<StateKv>().context("Failed to rebuild state-kv index")?;
    store.rebuild_indexes::<TaskOutput>().context("Failed to rebuild task-output index")?;
    Ok(store)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cmd = Cli::command().after_help(generate_after_help());
    let cli = Cli::from_arg_matches(&cmd.get_matches())?;

    let config_log_level = Config::load_log_level(cli.config.as_ref());
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    debug!(command = ?cli.command, "main: dispatching command");

    match cli.command {
        None => {
            Cli::command().print_help()?;
            Ok(())
        }
        Some(Command::Start { foreground }) => cmd_start(&config, cli.modes.as_deref(), foreground).await,
        Some(Command::Stop) => cmd_stop().await,
        Some(Command::Status { format }) => cmd_status(format).await,
        Some(Command::RunDaemon) => run_daemon_foreground(config, cli.modes.as_deref()).await,
        Some(Command::Task { command }) => cmd_task(&config, command).await,
        Some(Command::Queue { command }) => cmd_queue(&config, command).await,
        Some(Command::Repo { command }) => cmd_repo(&config, cli.config.as_ref(), command).await,
        Some(Command::Config { format }) => cmd_config_show(&config, format),
    }
}

/// `start`: fork to background (unless `--foreground`) and register the pidfile.
async fn cmd_start(config: &Config, modes_path: Option<&std::path::Path>, foreground: bool) -> Result<()> {
    let manager = DaemonManager::new();
    if foreground {
        manager.register_self()?;
        return run_daemon_foreground(config.clone(), modes_path).await;
    }
    let pid = manager.start()?;
    println!("Daemon started (pid {pid}). Logs: {}", get_log_path().display());
    Ok(())
}

async fn cmd_stop() -> Result<()> {
    let manager = DaemonManager::new();
    manager.stop()?;
    println!("Daemon stopped.");
    Ok(())
}

async fn cmd_status(format: OutputFormat) -> Result<()> {
    let manager = DaemonManager::new();
    let status = manager.status();
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({"running": status.running, "pid": status.pid, "pid_file": status.pid_file.display().to_string()})
            );
        }
        OutputFormat::Text | OutputFormat::Table => {
            if status.running {
                println!("taskdaemon: running (pid {})", status.pid.unwrap_or(0));
            } else {
                println!("taskdaemon: stopped");
            }
        }
    }
    Ok(())
}

/// Internal: the actual Tick Loop, run either in the foreground directly or
/// after `DaemonManager::start` has forked a child that re-execs with
/// `run-daemon`.
async fn run_daemon_foreground(config: Config, modes_path: Option<&std::path::Path>) -> Result<()> {
    let modes = ModeTable::load(modes_path).context("Failed to load mode table")?;
    let store = open_store(&config)?;
    let sandbox = Arc::new(DockerDriver::new());

    let scheduler = Arc::new(Scheduler::new(config, modes, store, sandbox));

    let runner = scheduler.clone();
    let run_handle = tokio::spawn(async move { runner.run().await });

    tokio::signal::ctrl_c().await.ok();
    info!("run_daemon_foreground: shutdown signal received");
    scheduler.request_shutdown();
    run_handle.await.context("scheduler task panicked")?;

    Ok(())
}

async fn cmd_task(config: &Config, command: TaskCommand) -> Result<()> {
    let mut store = open_store(config)?;
    match command {
        TaskCommand::Add { title, description, repo, mode } => {
            let repo_cfg = config.repo(&repo).cloned().unwrap_or_default();
            let mode = mode.unwrap_or(repo_cfg.default_mode);
            let task = Task::new(title, description, repo, mode, repo_cfg.max_attempts);
            let id = task.id.clone();
            store.create(task)?;
            println!("Created task {id}");
            Ok(())
        }
        TaskCommand::List { status, format } => {
            let mut tasks = store.list::<Task>(&[])?;
            if let Some(status) = status {
                tasks.retain(|t| t.status == status);
            }
            tasks.sort_by_key(|t| t.created_at);
            print_tasks(&tasks, format);
            Ok(())
        }
        TaskCommand::Show { id } => {
            let Some(task) = store.get::<Task>(&id)? else {
                println!("no such task: {id}");
                return Ok(());
            };
            println!("{task:#?}");
            let outputs = store.list::<TaskOutput>(&[taskstore::Filter::eq("task_id", taskstore::IndexValue::String(id))])?;
            for output in outputs {
                println!("--- phase {} ---\n{}", output.phase_name, output.final_text);
            }
            Ok(())
        }
        TaskCommand::Cancel { id } => {
            let Some(mut task) = store.get::<Task>(&id)? else {
                println!("no such task: {id}");
                return Ok(());
            };
            task.set_status(taskdaemon::domain::STATUS_FAILED);
            task.set_last_error("cancelled by operator".to_string());
            store.update(task)?;
            println!("Cancelled task {id}");
            Ok(())
        }
    }
}

async fn cmd_queue(config: &Config, command: QueueCommand) -> Result<()> {
    let store = open_store(config)?;
    match command {
        QueueCommand::List { status, format } => {
            let mut entries = store.list::<QueueEntry>(&[])?;
            if let Some(status) = status {
                entries.retain(|e| e.status.to_string() == status);
            }
            entries.sort_by_key(|e| e.created_at);
            print_queue_entries(&entries, format);
            Ok(())
        }
    }
}

async fn cmd_repo(config: &Config, explicit_config_path: Option<&PathBuf>, command: RepoCommand) -> Result<()> {
    match command {
        RepoCommand::Add { path, base_branch, backlog_file, mode } => {
            let mut config = config.clone();
            if config.repo(&path).is_some() {
                println!("repository already registered: {path}");
                return Ok(());
            }
            config.repos.push(taskdaemon::config::RepoConfig {
                path: path.clone(),
                base_branch,
                backlog_file,
                auto_merge: None,
                default_mode: mode,
                max_attempts: 3,
            });
            let target = explicit_config_path.cloned().unwrap_or_else(|| PathBuf::from(".taskdaemon.yml"));
            let yaml = serde_yaml::to_string(&config).context("Failed to serialize configuration")?;
            fs::write(&target, yaml).context(format!("Failed to write {}", target.display()))?;
            println!("Registered repository {path} ({})", target.display());
            Ok(())
        }
        RepoCommand::List { format } => {
            print_repos(&config.repos, format);
            Ok(())
        }
    }
}

fn cmd_config_show(config: &Config, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(config)?),
        OutputFormat::Text | OutputFormat::Table => println!("{}", serde_yaml::to_string(config)?),
    }
    Ok(())
}

fn print_tasks(tasks: &[Task], format: OutputFormat) {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(tasks).unwrap_or_default()),
        OutputFormat::Text | OutputFormat::Table => {
            for task in tasks {
                println!("{}\t{}\t{}\t{}", task.id, task.status, task.attempt, task.title);
            }
        }
    }
}

fn print_queue_entries(entries: &[QueueEntry], format: OutputFormat) {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(entries).unwrap_or_default()),
        OutputFormat::Text | OutputFormat::Table => {
            for entry in entries {
                println!("{}\t{}\t{}", entry.id, entry.status, entry.branch);
            }
        }
    }
}

fn print_repos(repos: &[taskdaemon::config::RepoConfig], format: OutputFormat) {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(repos).unwrap_or_default()),
        OutputFormat::Text | OutputFormat::Table => {
            for repo in repos {
                println!("{}\t{}\t{}", repo.path, repo.base_branch, repo.default_mode);
            }
        }
    }
}

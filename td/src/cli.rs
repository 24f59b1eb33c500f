//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;

/// TaskDaemon - autonomous engineering orchestrator
#[derive(Parser)]
#[command(
    name = "taskdaemon",
    about = "Autonomous pipeline scheduler: drives a task backlog through a multi-phase agent workflow",
    version = env!("GIT_DESCRIBE"),
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Path to modes file (defaults to the fallback chain, see ModeTable::load)
    #[arg(long, global = true, help = "Path to modes.yml")]
    pub modes: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the daemon (forks to background)
    Start {
        /// Don't fork to background (run in foreground)
        #[arg(long)]
        foreground: bool,
    },

    /// Stop the daemon
    Stop,

    /// Check daemon status
    Status {
        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Internal: run the Tick Loop in the foreground (used by `start` after forking)
    #[command(hide = true, name = "run-daemon")]
    RunDaemon,

    /// Manage tasks
    Task {
        #[command(subcommand)]
        command: TaskCommand,
    },

    /// Manage the integration queue
    Queue {
        #[command(subcommand)]
        command: QueueCommand,
    },

    /// Manage watched repositories
    Repo {
        #[command(subcommand)]
        command: RepoCommand,
    },

    /// Show the effective configuration
    Config {
        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },
}

/// Task management subcommands
#[derive(Debug, Subcommand)]
pub enum TaskCommand {
    /// Create a new task in the backlog
    Add {
        /// Task title
        title: String,

        /// Task description
        #[arg(short, long, default_value = "")]
        description: String,

        /// Repository path this task belongs to
        #[arg(short, long)]
        repo: String,

        /// Workflow mode (defaults to the repository's configured default mode)
        #[arg(short, long)]
        mode: Option<String>,
    },

    /// List tasks
    List {
        /// Filter by status (backlog, <phase name>, done, merged, failed, rebase)
        #[arg(short, long)]
        status: Option<String>,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Show one task's full detail, including recent output
    Show {
        /// Task id
        id: String,
    },

    /// Cancel a task (marks it `failed` and tears down its worktree)
    Cancel {
        /// Task id
        id: String,
    },
}

/// Queue inspection subcommands
#[derive(Debug, Subcommand)]
pub enum QueueCommand {
    /// List queue entries awaiting integration
    List {
        /// Filter by status (queued, merging, pending_review, merged, excluded)
        #[arg(short, long)]
        status: Option<String>,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },
}

/// Repository management subcommands
#[derive(Debug, Subcommand)]
pub enum RepoCommand {
    /// Register a repository to watch (persisted to the config file)
    Add {
        /// Filesystem path to the repository
        path: String,

        /// Base branch to integrate onto
        #[arg(short, long, default_value = "main")]
        base_branch: String,

        /// Backlog file this repository seeds tasks from
        #[arg(long)]
        backlog_file: Option<String>,

        /// Default workflow mode for tasks created against this repository
        #[arg(short, long, default_value = "spec-qa-impl")]
        mode: String,
    },

    /// List watched repositories
    List {
        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },
}

/// Result of checking a required tool
pub struct ToolCheck {
    pub name: &'static str,
    pub available: bool,
    pub version: Option<String>,
}

impl ToolCheck {
    /// Check if a tool is available and get its version
    pub fn check(name: &'static str, version_args: &[&str]) -> Self {
        debug!(name, ?version_args, "ToolCheck::check: called");
        let result = std::process::Command::new(name).args(version_args).output();

        match result {
            Ok(output) if output.status.success() => {
                debug!(name, "ToolCheck::check: tool available");
                let version_str = String::from_utf8_lossy(&output.stdout);
                let version = parse_version(&version_str);
                Self {
                    name,
                    available: true,
                    version: Some(version),
                }
            }
            _ => {
                debug!(name, "ToolCheck::check: tool not available");
                Self {
                    name,
                    available: false,
                    version: None,
                }
            }
        }
    }
}

/// Parse version from command output (extracts first version-like string)
fn parse_version(output: &str) -> String {
    debug!(%output, "parse_version: called");
    // Look for patterns like "1.2.3" or "v1.2.3"
    for word in output.split_whitespace() {
        let word = word.trim_start_matches('v');
        if word.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false) {
            // Take until non-version character
            let version: String = word.chars().take_while(|c| c.is_ascii_digit() || *c == '.').collect();
            if !version.is_empty() {
                debug!(%version, "parse_version: found version");
                return version;
            }
        }
    }
    debug!("parse_version: no version found, returning unknown");
    "unknown".to_string()
}

/// Check all required tools and return their status
pub fn check_required_tools() -> Vec<ToolCheck> {
    debug!("check_required_tools: called");
    let tools = vec![
        ToolCheck::check("git", &["--version"]),
        ToolCheck::check("gh", &["--version"]),
        ToolCheck::check("docker", &["--version"]),
    ];
    debug!(count = tools.len(), "check_required_tools: returning tools");
    tools
}

/// Check if the daemon is running (lightweight check for help display)
pub fn is_daemon_running() -> bool {
    debug!("is_daemon_running: called");
    // Use the same path logic as daemon.rs:default_pid_path()
    let pid_file = dirs::runtime_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("taskdaemon")
        .join("taskdaemon.pid");

    if !pid_file.exists() {
        debug!(?pid_file, "is_daemon_running: pid file does not exist");
        return false;
    }

    if let Ok(contents) = std::fs::read_to_string(&pid_file)
        && let Ok(pid) = contents.trim().parse::<u32>()
    {
        // Check if process exists
        let exists = PathBuf::from(format!("/proc/{}", pid)).exists();
        debug!(pid, exists, "is_daemon_running: checked process existence");
        return exists;
    }

    debug!("is_daemon_running: could not read or parse pid file");
    false
}

/// Get the log file path
pub fn get_log_path() -> PathBuf {
    debug!("get_log_path: called");
    let path = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("taskdaemon")
        .join("logs")
        .join("taskdaemon.log");
    debug!(?path, "get_log_path: returning path");
    path
}

/// Generate the after_help text with tool checks and daemon status
pub fn generate_after_help() -> String {
    debug!("generate_after_help: called");
    let tools = check_required_tools();
    let daemon_running = is_daemon_running();
    let log_path = get_log_path();

    let mut help = String::new();

    // Required Tools section
    help.push_str("Required Tools:\n");
    for tool in &tools {
        let icon = if tool.available {
            debug!(name = tool.name, "generate_after_help: tool available");
            "\u{2705}"
        } else {
            debug!(name = tool.name, "generate_after_help: tool not available");
            "\u{274C}"
        };
        let version = tool.version.as_deref().unwrap_or("not found");
        help.push_str(&format!("  {} {:<10} {}\n", icon, tool.name, version));
    }

    // Daemon section
    help.push('\n');
    help.push_str("Daemon:\n");
    let daemon_icon = if daemon_running {
        debug!("generate_after_help: daemon is running");
        "\u{2705}"
    } else {
        debug!("generate_after_help: daemon is stopped");
        "\u{274C}"
    };
    let daemon_status = if daemon_running { "running" } else { "stopped" };
    help.push_str(&format!("  {} {}\n", daemon_icon, daemon_status));

    // Log path
    help.push('\n');
    help.push_str(&format!("Logs are written to: {}\n", log_path.display()));

    debug!("generate_after_help: returning help text");
    help
}

/// Output format for status/list commands
#[derive(Clone, Debug, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    Table,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        debug!(%s, "OutputFormat::from_str: called");
        match s.to_lowercase().as_str() {
            "text" | "plain" => {
                debug!("OutputFormat::from_str: matched Text");
                Ok(Self::Text)
            }
            "json" => {
                debug!("OutputFormat::from_str: matched Json");
                Ok(Self::Json)
            }
            "table" => {
                debug!("OutputFormat::from_str: matched Table");
                Ok(Self::Table)
            }
            _ => {
                debug!(%s, "OutputFormat::from_str: unknown format");
                Err(format!("Unknown format: {}. Use: text, json, or table", s))
            }
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        debug!(?self, "OutputFormat::fmt: called");
        match self {
            Self::Text => {
                debug!("OutputFormat::fmt: writing text");
                write!(f, "text")
            }
            Self::Json => {
                debug!("OutputFormat::fmt: writing json");
                write!(f, "json")
            }
            Self::Table => {
                debug!("OutputFormat::fmt: writing table");
                write!(f, "table")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_no_command() {
        let cli = Cli::parse_from(["taskdaemon"]);
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_cli_parse_start() {
        let cli = Cli::parse_from(["taskdaemon", "start"]);
        assert!(matches!(cli.command, Some(Command::Start { foreground: false })));
    }

    #[test]
    fn test_cli_parse_start_foreground() {
        let cli = Cli::parse_from(["taskdaemon", "start", "--foreground"]);
        assert!(matches!(cli.command, Some(Command::Start { foreground: true })));
    }

    #[test]
    fn test_cli_parse_stop() {
        let cli = Cli::parse_from(["taskdaemon", "stop"]);
        assert!(matches!(cli.command, Some(Command::Stop)));
    }

    #[test]
    fn test_cli_parse_status() {
        let cli = Cli::parse_from(["taskdaemon", "status"]);
        assert!(matches!(cli.command, Some(Command::Status { .. })));
    }

    #[test]
    fn test_cli_parse_task_add() {
        let cli = Cli::parse_from(["taskdaemon", "task", "add", "fix bug", "--repo", "/repo"]);
        if let Some(Command::Task {
            command: TaskCommand::Add { title, repo, mode, .. },
        }) = cli.command
        {
            assert_eq!(title, "fix bug");
            assert_eq!(repo, "/repo");
            assert!(mode.is_none());
        } else {
            panic!("Expected Task::Add command");
        }
    }

    #[test]
    fn test_cli_parse_queue_list() {
        let cli = Cli::parse_from(["taskdaemon", "queue", "list"]);
        assert!(matches!(cli.command, Some(Command::Queue { command: QueueCommand::List { .. } })));
    }

    #[test]
    fn test_cli_parse_repo_add() {
        let cli = Cli::parse_from(["taskdaemon", "repo", "add", "/repo", "--base-branch", "trunk"]);
        if let Some(Command::Repo {
            command: RepoCommand::Add { path, base_branch, .. },
        }) = cli.command
        {
            assert_eq!(path, "/repo");
            assert_eq!(base_branch, "trunk");
        } else {
            panic!("Expected Repo::Add command");
        }
    }

    #[test]
    fn test_output_format_from_str() {
        assert!(matches!("text".parse::<OutputFormat>(), Ok(OutputFormat::Text)));
        assert!(matches!("json".parse::<OutputFormat>(), Ok(OutputFormat::Json)));
        assert!(matches!("table".parse::<OutputFormat>(), Ok(OutputFormat::Table)));
        assert!("invalid".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_cli_with_config() {
        let cli = Cli::parse_from(["taskdaemon", "-c", "/path/to/config.yml", "status"]);
        assert_eq!(cli.config, Some(PathBuf::from("/path/to/config.yml")));
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("git version 2.43.0"), "2.43.0");
        assert_eq!(parse_version("gh version 2.40.0"), "2.40.0");
        assert_eq!(parse_version("v1.2.3"), "1.2.3");
    }
}

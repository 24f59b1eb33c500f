//! Agent Runner: assembles a phase's prompt, invokes the agent-runtime
//! either inside the sandbox or directly on the host, parses its NDJSON event
//! stream, and enforces a timeout watchdog.
//!
//! Both invocation paths must drain stdout and stderr concurrently — a child
//! that fills one pipe's kernel buffer while nobody is reading it blocks
//! forever, the same hazard `sandbox.rs` documents for the container path.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::domain::{Phase, Task};
use crate::sandbox::{SandboxDriver, SandboxError, SandboxRequest};

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("failed to spawn agent process: {0}")]
    Spawn(std::io::Error),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error("agent invocation exceeded its timeout")]
    Timeout,
}

/// The outcome of one agent invocation: the accumulated final result text and
/// the session id to resume from on the next phase, if any.
#[derive(Debug, Clone, Default)]
pub struct AgentResult {
    pub final_text: String,
    pub session_id: Option<String>,
    pub event_log: String,
    pub exit_code: i32,
}

/// One line of the agent runtime's newline-delimited JSON event stream.
/// Unrecognized `type` values and malformed lines are skipped — the parser
/// is intentionally tolerant.
#[derive(Debug, Deserialize)]
struct AgentEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    result: Option<String>,
}

/// Fold a stream of NDJSON lines into the final `(session_id, final_text)`
/// pair. `"result"` events overwrite `final_text`; the last one wins. Both
/// `"system"` and `"result"` events may carry a `session_id` update.
fn fold_events(lines: impl Iterator<Item = String>) -> (Option<String>, String) {
    let mut session_id = None;
    let mut final_text = String::new();
    for line in lines {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let event: AgentEvent = match serde_json::from_str(trimmed) {
            Ok(e) => e,
            Err(_) => continue,
        };
        match event.kind.as_str() {
            "system" => {
                if let Some(sid) = event.session_id {
                    session_id = Some(sid);
                }
            }
            "result" => {
                if let Some(sid) = event.session_id {
                    session_id = Some(sid);
                }
                if let Some(text) = event.result {
                    final_text = text;
                }
            }
            _ => {}
        }
    }
    (session_id, final_text)
}

/// Assembles a phase's prompt: the base instruction (or error-recovery
/// variant when `task.last_error` is set), optionally prefixed with task
/// context and a truncated repo file listing.
pub fn build_prompt(phase: &Phase, task: &Task, worktree: &Path, truncate_bytes: usize) -> String {
    let mut sections = Vec::new();

    if phase.flags.include_task_context {
        sections.push(format!("## Task\n\nTitle: {}\n\nDescription:\n{}", task.title, task.description));
    }

    if phase.flags.include_file_listing {
        sections.push(format!("## Repository files\n\n{}", file_listing(worktree, truncate_bytes)));
    }

    let body = match (&task.last_error, &phase.error_instruction) {
        (Some(err), Some(template)) => template.replace("{{ERROR}}", err),
        _ => phase.instruction.clone(),
    };
    sections.push(body);

    sections.join("\n\n")
}

fn file_listing(worktree: &Path, truncate_bytes: usize) -> String {
    let mut listing = String::new();
    for entry in WalkDir::new(worktree).into_iter().filter_map(Result::ok) {
        if entry.path().components().any(|c| c.as_os_str() == ".git" || c.as_os_str() == ".worktrees") {
            continue;
        }
        if entry.file_type().is_file() {
            if let Ok(rel) = entry.path().strip_prefix(worktree) {
                listing.push_str(&rel.to_string_lossy());
                listing.push('\n');
            }
        }
        if listing.len() >= truncate_bytes {
            break;
        }
    }
    if listing.len() > truncate_bytes {
        listing.truncate(truncate_bytes);
        listing.push_str("\n...[truncated]");
    }
    listing
}

/// Invokes the agent runtime directly on the host, draining stdout and
/// stderr concurrently. Used for the rebase phase's conflict-resolution step,
/// which runs against the worktree already rebasing on disk and has no need
/// for sandbox isolation.
pub async fn run_on_host(binary: &str, worktree: &Path, prompt: &str, session_id: Option<&str>, timeout: Duration) -> Result<AgentResult, AgentError> {
    let mut args = vec!["-p".to_string(), "--output-format".to_string(), "stream-json".to_string()];
    if let Some(sid) = session_id {
        args.push("--resume".to_string());
        args.push(sid.to_string());
    }

    debug!(binary, ?worktree, "agent::run_on_host: spawning");

    let mut child = Command::new(binary)
        .args(&args)
        .current_dir(worktree)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(AgentError::Spawn)?;

    let mut stdin = child.stdin.take().expect("stdin piped");
    let mut stdout = child.stdout.take().expect("stdout piped");
    let mut stderr = child.stderr.take().expect("stderr piped");

    stdin.write_all(prompt.as_bytes()).await.map_err(AgentError::Spawn)?;
    drop(stdin);

    let stdout_task = tokio::spawn(async move {
        let mut lines = Vec::new();
        let reader = BufReader::new(&mut stdout);
        let mut reader_lines = reader.lines();
        while let Ok(Some(line)) = reader_lines.next_line().await {
            lines.push(line);
        }
        lines
    });

    let stderr_task = tokio::spawn(async move {
        let mut buf = String::new();
        stderr.read_to_string(&mut buf).await.ok();
        buf
    });

    let wait = child.wait();
    let status = match tokio::time::timeout(timeout, wait).await {
        Ok(result) => result.map_err(AgentError::Spawn)?,
        Err(_) => {
            child.start_kill().ok();
            return Err(AgentError::Timeout);
        }
    };

    let lines = stdout_task.await.unwrap_or_default();
    let stderr_buf = stderr_task.await.unwrap_or_default();

    let event_log = lines.join("\n");
    let (session_id, final_text) = fold_events(lines.into_iter());

    if final_text.is_empty() && !stderr_buf.is_empty() {
        warn!(stderr = %stderr_buf, "agent::run_on_host: empty result with non-empty stderr");
    }

    Ok(AgentResult {
        final_text,
        session_id,
        event_log,
        exit_code: status.code().unwrap_or(-1),
    })
}

/// Invokes the agent runtime inside the sandbox (the default, used for every
/// phase flagged `use_docker`). Streams stdout through the NDJSON fold as it
/// arrives is unnecessary here — the sandbox driver already buffers full
/// stdout/stderr, so the fold runs once on the complete output.
pub async fn run_sandboxed(
    driver: &dyn SandboxDriver,
    image: &str,
    name: &str,
    env: &[(String, String)],
    binds: &[(String, String)],
    memory_limit_mb: u64,
    prompt: &str,
    timeout: Duration,
) -> Result<AgentResult, AgentError> {
    let request = SandboxRequest {
        image,
        name,
        env,
        binds,
        memory_limit_mb,
        stdin_bytes: prompt.as_bytes().to_vec(),
    };

    let run = driver.run(request, None);
    let output = match tokio::time::timeout(timeout, run).await {
        Ok(result) => result?,
        Err(_) => {
            driver.kill(name).await.ok();
            return Err(AgentError::Timeout);
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let lines: Vec<String> = stdout.lines().map(str::to_string).collect();
    let (session_id, final_text) = fold_events(lines.iter().cloned());

    Ok(AgentResult {
        final_text,
        session_id,
        event_log: stdout,
        exit_code: output.exit_code,
    })
}

/// Per-task session directory, used to persist any on-disk state the agent
/// runtime itself wants between phases (credentials cache, scratch files).
pub fn session_dir(base: &Path, task_id: &str) -> PathBuf {
    base.join(task_id)
}

//! Shared test-command runner, used by the Agent phase's test step and the
//! Rebase phase's re-test step.
//!
//! Runs `sh -c <command>` in the worktree with a timeout, draining stdout and
//! stderr on separate tasks so a verbose test suite that fills one pipe
//! before the other is read can never deadlock the invocation.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct TestRunOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
}

impl TestRunOutput {
    pub fn passed(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }

    /// Combined output for prompt injection / `last_error`, stdout first then
    /// a stderr section if non-empty (only called out when it carries
    /// something).
    pub fn combined(&self) -> String {
        if self.timed_out {
            return format!("{}\n\nSTDERR:\n{}\n\n[test command timed out]", self.stdout, self.stderr);
        }
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n\nSTDERR:\n{}", self.stdout, self.stderr)
        }
    }
}

pub async fn run_test_command(worktree: &Path, command: &str, timeout: Duration) -> std::io::Result<TestRunOutput> {
    debug!(?worktree, command, "testrun::run_test_command: spawning");

    let mut child = Command::new("sh").arg("-c").arg(command).current_dir(worktree).stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped()).spawn()?;

    let mut stdout = child.stdout.take().expect("stdout piped");
    let mut stderr = child.stderr.take().expect("stderr piped");

    let stdout_task = tokio::spawn(async move {
        let mut buf = String::new();
        stdout.read_to_string(&mut buf).await.ok();
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = String::new();
        stderr.read_to_string(&mut buf).await.ok();
        buf
    });

    let wait = child.wait();
    match tokio::time::timeout(timeout, wait).await {
        Ok(status) => {
            let status = status?;
            let stdout = stdout_task.await.unwrap_or_default();
            let stderr = stderr_task.await.unwrap_or_default();
            Ok(TestRunOutput {
                stdout,
                stderr,
                exit_code: status.code().unwrap_or(-1),
                timed_out: false,
            })
        }
        Err(_) => {
            child.start_kill().ok();
            let stdout = stdout_task.await.unwrap_or_default();
            let stderr = stderr_task.await.unwrap_or_default();
            Ok(TestRunOutput {
                stdout,
                stderr,
                exit_code: -1,
                timed_out: true,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn successful_command_reports_passed() {
        let dir = tempdir().unwrap();
        let out = run_test_command(dir.path(), "echo ok", Duration::from_secs(5)).await.unwrap();
        assert!(out.passed());
        assert!(out.stdout.contains("ok"));
    }

    #[tokio::test]
    async fn failing_command_reports_not_passed() {
        let dir = tempdir().unwrap();
        let out = run_test_command(dir.path(), "exit 1", Duration::from_secs(5)).await.unwrap();
        assert!(!out.passed());
        assert_eq!(out.exit_code, 1);
    }

    #[tokio::test]
    async fn large_combined_stdout_and_stderr_does_not_deadlock() {
        let dir = tempdir().unwrap();
        // 128 KiB onto each stream: larger than a typical 64 KiB pipe buffer,
        // the classic deadlock scenario when only one side is drained.
        let command = "head -c 131072 /dev/zero | tr '\\0' 'a'; head -c 131072 /dev/zero | tr '\\0' 'b' 1>&2";
        let out = run_test_command(dir.path(), command, Duration::from_secs(10)).await.unwrap();
        assert!(out.passed());
        assert_eq!(out.stdout.len(), 131072);
        assert_eq!(out.stderr.len(), 131072);
    }

    #[tokio::test]
    async fn timeout_is_reported_and_kills_the_child() {
        let dir = tempdir().unwrap();
        let out = run_test_command(dir.path(), "sleep 30", Duration::from_millis(100)).await.unwrap();
        assert!(out.timed_out);
        assert!(!out.passed());
    }
}

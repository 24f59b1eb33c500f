//! Sandbox driver: runs an agent invocation inside a container engine.
//!
//! Only the command contract is in scope — the container engine's own
//! internals are an external collaborator. Stdout is streamed live to a sink
//! (for the web dashboard) while stderr is drained on its own task; both
//! streams are read concurrently so a child writing past a pipe buffer on
//! either stream never blocks (pipe-deadlock rule).

use std::process::Stdio;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("failed to spawn container: {0}")]
    Spawn(std::io::Error),
    #[error("failed to write stdin to container: {0}")]
    Stdin(std::io::Error),
    #[error("container produced no stdout/stderr handle")]
    MissingPipe,
}

/// The outcome of a single sandboxed invocation.
#[derive(Debug, Clone)]
pub struct SandboxOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

/// A callback invoked with each chunk of stdout as it arrives.
pub type StreamSink = Box<dyn Fn(&[u8]) + Send + Sync>;

pub struct SandboxRequest<'a> {
    pub image: &'a str,
    pub name: &'a str,
    pub env: &'a [(String, String)],
    pub binds: &'a [(String, String)],
    pub memory_limit_mb: u64,
    pub stdin_bytes: Vec<u8>,
}

/// Drives the Docker CLI. Generalizable behind a trait if a second engine is
/// ever needed, but today there is exactly one caller and one implementation.
#[async_trait::async_trait]
pub trait SandboxDriver: Send + Sync {
    async fn run(&self, request: SandboxRequest<'_>, sink: Option<StreamSink>) -> Result<SandboxOutput, SandboxError>;
    async fn kill(&self, name: &str) -> Result<(), SandboxError>;
}

pub struct DockerDriver {
    binary: String,
}

impl DockerDriver {
    pub fn new() -> Self {
        Self { binary: "docker".to_string() }
    }
}

impl Default for DockerDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl SandboxDriver for DockerDriver {
    async fn run(&self, request: SandboxRequest<'_>, sink: Option<StreamSink>) -> Result<SandboxOutput, SandboxError> {
        let mut args: Vec<String> = vec!["run".into(), "--rm".into(), "-i".into(), "--name".into(), request.name.into(), "--memory".into(), format!("{}m", request.memory_limit_mb)];
        for (key, value) in request.env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        for (host, container) in request.binds {
            args.push("-v".into());
            args.push(format!("{host}:{container}"));
        }
        args.push(request.image.into());

        debug!(name = %request.name, image = %request.image, "DockerDriver::run: spawning container");

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(SandboxError::Spawn)?;

        let mut stdin = child.stdin.take().ok_or(SandboxError::MissingPipe)?;
        let mut stdout = child.stdout.take().ok_or(SandboxError::MissingPipe)?;
        let mut stderr = child.stderr.take().ok_or(SandboxError::MissingPipe)?;

        stdin.write_all(&request.stdin_bytes).await.map_err(SandboxError::Stdin)?;
        drop(stdin);

        // Both streams must be drained concurrently: the container can write
        // more than one pipe buffer to either stream before the other is read.
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let mut chunk = [0u8; 8192];
            loop {
                let n = match stdout.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(_) => break,
                };
                if let Some(sink) = &sink {
                    sink(&chunk[..n]);
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            buf
        });

        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            stderr.read_to_end(&mut buf).await.ok();
            buf
        });

        let status = child.wait().await.map_err(SandboxError::Spawn)?;
        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        Ok(SandboxOutput {
            stdout,
            stderr,
            exit_code: status.code().unwrap_or(-1),
        })
    }

    async fn kill(&self, name: &str) -> Result<(), SandboxError> {
        debug!(name, "DockerDriver::kill: called");
        let output = Command::new(&self.binary).args(["kill", name]).output().await.map_err(SandboxError::Spawn)?;
        if !output.status.success() {
            warn!(name, stderr = %String::from_utf8_lossy(&output.stderr), "DockerDriver::kill: container may already be gone");
        }
        Ok(())
    }
}

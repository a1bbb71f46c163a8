//! Child process spawning.
//!
//! `ChildLauncher` is the seam between the supervisor and the operating
//! system: the production `ProcessLauncher` spawns real processes with piped
//! stdio, while tests substitute in-memory children.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};

use super::errors::McpError;
use super::transport::{BoxedReader, BoxedWriter};
use super::types::ServerDescriptor;

/// Handle to a running child, owned by its exit watcher.
#[async_trait]
pub trait ChildProcess: Send {
    /// OS process id, when there is one.
    fn id(&self) -> Option<u32>;

    /// Wait for the process to exit; `Ok(None)` means killed by a signal.
    async fn wait(&mut self) -> std::io::Result<Option<i32>>;

    /// Forcefully terminate the process.
    async fn kill(&mut self) -> std::io::Result<()>;
}

/// A freshly spawned child with its stdio pipes detached.
pub struct LaunchedChild {
    pub stdin: BoxedWriter,
    pub stdout: BoxedReader,
    pub stderr: Option<BoxedReader>,
    pub process: Box<dyn ChildProcess>,
}

/// Spawns the process behind a `ServerDescriptor`.
#[async_trait]
pub trait ChildLauncher: Send + Sync {
    async fn launch(
        &self,
        name: &str,
        descriptor: &ServerDescriptor,
    ) -> Result<LaunchedChild, McpError>;
}

// ─── ProcessLauncher ─────────────────────────────────────────────────────────

/// Launches real OS processes via `tokio::process`.
#[derive(Debug, Clone, Default)]
pub struct ProcessLauncher {
    /// Working directory used when a descriptor does not set its own `cwd`.
    working_dir: Option<PathBuf>,
}

impl ProcessLauncher {
    pub fn new(working_dir: Option<PathBuf>) -> Self {
        Self { working_dir }
    }

    fn command(&self, descriptor: &ServerDescriptor) -> Command {
        let mut cmd = Command::new(&descriptor.command);
        cmd.args(&descriptor.args);

        // Overrides are layered on top of the inherited environment.
        for (key, value) in &descriptor.env {
            cmd.env(key, value);
        }

        let effective_dir = descriptor
            .cwd
            .as_ref()
            .map(PathBuf::from)
            .or_else(|| self.working_dir.clone());
        if let Some(dir) = effective_dir {
            cmd.current_dir(dir);
        }

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl ChildLauncher for ProcessLauncher {
    async fn launch(
        &self,
        name: &str,
        descriptor: &ServerDescriptor,
    ) -> Result<LaunchedChild, McpError> {
        let mut child = self
            .command(descriptor)
            .spawn()
            .map_err(|e| McpError::SpawnFailed {
                name: name.to_string(),
                reason: format!("{}: {e}", descriptor.command),
            })?;

        let stdin = child.stdin.take().ok_or(McpError::SpawnFailed {
            name: name.to_string(),
            reason: "failed to capture stdin".into(),
        })?;

        let stdout = child.stdout.take().ok_or(McpError::SpawnFailed {
            name: name.to_string(),
            reason: "failed to capture stdout".into(),
        })?;

        let stderr = child
            .stderr
            .take()
            .map(|s| Box::new(s) as BoxedReader);

        tracing::info!(
            server = name,
            command = %descriptor.command,
            args = ?descriptor.args,
            pid = ?child.id(),
            "spawned server process"
        );

        Ok(LaunchedChild {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr,
            process: Box::new(OsChild { child }),
        })
    }
}

/// `tokio::process::Child` adapted to `ChildProcess`.
struct OsChild {
    child: Child,
}

#[async_trait]
impl ChildProcess for OsChild {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> std::io::Result<Option<i32>> {
        let status = self.child.wait().await?;
        Ok(status.code())
    }

    async fn kill(&mut self) -> std::io::Result<()> {
        self.child.kill().await
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

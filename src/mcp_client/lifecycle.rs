//! Server process lifecycle management.
//!
//! One `ManagedServer` per running child: it performs the initialize
//! handshake, drains stderr into the log, watches for process exit, and
//! shuts the process down on request. States move
//! `Starting → Ready → Exited`; an exited server is never reused.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{oneshot, watch};

use super::errors::McpError;
use super::launcher::{ChildLauncher, ChildProcess, LaunchedChild};
use super::transport::{extract_result, BoxedReader, StdioTransport};
use super::types::{initialize_params, ServerDescriptor, INITIALIZED_NOTIFICATION};
use crate::config::TimeoutConfig;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Longest stderr line forwarded to the log before truncation.
const MAX_STDERR_LINE: usize = 2000;

// ─── ServerState ─────────────────────────────────────────────────────────────

/// Lifecycle state of one child connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Starting,
    Ready,
    Exited,
}

// ─── ManagedServer ───────────────────────────────────────────────────────────

/// A running MCP server process with its transport.
pub struct ManagedServer {
    /// Logical server name (e.g., "filesystem").
    name: String,
    /// JSON-RPC transport (stdin/stdout).
    transport: Arc<StdioTransport>,
    created_at: DateTime<Utc>,
    pid: Option<u32>,
    state_tx: watch::Sender<ServerState>,
    /// Asks the exit watcher to stop the process.
    stop_tx: std::sync::Mutex<Option<oneshot::Sender<()>>>,
    shutdown_timeout: Duration,
}

impl ManagedServer {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> ServerState {
        *self.state_tx.borrow()
    }

    /// Ready and still connected.
    pub fn is_usable(&self) -> bool {
        self.state() == ServerState::Ready && !self.transport.is_closed()
    }

    /// Requests currently awaiting a response from this child.
    pub fn pending_requests(&self) -> usize {
        self.transport.pending_count()
    }

    /// Subscribe to state changes (used by the supervisor's exit hook).
    pub fn subscribe_state(&self) -> watch::Receiver<ServerState> {
        self.state_tx.subscribe()
    }

    /// Send a request and return its `result` payload.
    ///
    /// A JSON-RPC error object from the child comes back as
    /// `McpError::ServerError` with code, message, and data intact.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        if self.state() == ServerState::Exited {
            return Err(McpError::ConnectionLost {
                name: self.name.clone(),
                reason: "process has exited".into(),
            });
        }
        let response = self.transport.request(method, params, timeout).await?;
        extract_result(response)
    }

    /// Wait until the process has exited.
    pub async fn exited(&self) {
        let mut rx = self.state_tx.subscribe();
        let _ = rx
            .wait_for(|s| *s == ServerState::Exited)
            .await
            .map(|_| ());
    }

    /// Close stdin, give the process a grace period, then kill it.
    pub async fn shutdown(&self) {
        let stop = self
            .stop_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(tx) = stop {
            let _ = tx.send(());
        }
        // The watcher kills after `shutdown_timeout`; allow a little slack.
        let budget = self.shutdown_timeout + Duration::from_secs(1);
        if tokio::time::timeout(budget, self.exited()).await.is_err() {
            tracing::warn!(server = %self.name, "server did not report exit after shutdown");
        }
    }
}

impl fmt::Debug for ManagedServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedServer")
            .field("name", &self.name)
            .field("pid", &self.pid)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Drop for ManagedServer {
    fn drop(&mut self) {
        // Dropping the stop sender wakes the watcher, which then terminates the child.
        self.stop_tx
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
    }
}

// ─── Spawning ────────────────────────────────────────────────────────────────

/// Spawn a server process and perform the initialization handshake.
///
/// Ready is reached on whichever comes first: the child's own
/// `notifications/initialized`, or a successful `initialize` response.
/// Failing to get there within `timeouts.startup` yields `StartupTimeout`.
pub async fn spawn_server(
    name: &str,
    descriptor: &ServerDescriptor,
    launcher: &dyn ChildLauncher,
    timeouts: &TimeoutConfig,
) -> Result<Arc<ManagedServer>, McpError> {
    let LaunchedChild {
        stdin,
        stdout,
        stderr,
        process,
    } = launcher.launch(name, descriptor).await?;

    let transport = Arc::new(StdioTransport::new(name, stdin, stdout));

    if let Some(stderr) = stderr {
        tokio::spawn(drain_stderr(name.to_string(), stderr));
    }

    let (state_tx, _) = watch::channel(ServerState::Starting);
    let (stop_tx, stop_rx) = oneshot::channel();
    let pid = process.id();

    tokio::spawn(watch_exit(
        name.to_string(),
        process,
        Arc::clone(&transport),
        stop_rx,
        state_tx.clone(),
        timeouts.shutdown(),
    ));

    let server = Arc::new(ManagedServer {
        name: name.to_string(),
        transport,
        created_at: Utc::now(),
        pid,
        state_tx,
        stop_tx: std::sync::Mutex::new(Some(stop_tx)),
        shutdown_timeout: timeouts.shutdown(),
    });

    let startup = timeouts.startup();
    match tokio::time::timeout(startup, handshake(&server, startup)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            server.shutdown().await;
            return Err(match e {
                McpError::RequestTimeout { .. } => startup_timeout(name, startup),
                other => McpError::ServerNotReady {
                    name: name.to_string(),
                    reason: other.to_string(),
                },
            });
        }
        Err(_) => {
            server.shutdown().await;
            return Err(startup_timeout(name, startup));
        }
    }

    // Tell the child the handshake is done, as the protocol expects.
    if let Err(e) = server.transport.notify(INITIALIZED_NOTIFICATION, None).await {
        tracing::warn!(server = name, error = %e, "failed to send initialized notification");
    }

    server.state_tx.send_if_modified(|state| {
        if *state == ServerState::Starting {
            *state = ServerState::Ready;
            true
        } else {
            false
        }
    });

    if server.state() != ServerState::Ready {
        return Err(McpError::ServerNotReady {
            name: name.to_string(),
            reason: "process exited during startup".into(),
        });
    }

    tracing::info!(server = name, pid = ?pid, "server is ready");
    Ok(server)
}

fn startup_timeout(name: &str, startup: Duration) -> McpError {
    McpError::StartupTimeout {
        name: name.to_string(),
        timeout_ms: startup.as_millis() as u64,
    }
}

/// Race the `initialize` round-trip against the child's ready notification.
async fn handshake(server: &ManagedServer, startup: Duration) -> Result<(), McpError> {
    tokio::select! {
        result = server.transport.request("initialize", Some(initialize_params()), startup) => {
            let info = extract_result(result?)?;
            let server_info = info.get("serverInfo").cloned().unwrap_or(Value::Null);
            tracing::debug!(server = %server.name, server_info = %server_info, "initialize completed");
            Ok(())
        }
        _ = server.transport.initialized_notification() => {
            tracing::debug!(server = %server.name, "child announced initialized");
            Ok(())
        }
    }
}

// ─── Background Tasks ────────────────────────────────────────────────────────

/// Forward child stderr to the log, line by line. Never touches protocol data.
async fn drain_stderr(name: String, stderr: BoxedReader) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(mut line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                if line.len() > MAX_STDERR_LINE {
                    let mut cut = MAX_STDERR_LINE;
                    while !line.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    line.truncate(cut);
                    line.push_str("...(truncated)");
                }
                tracing::warn!(server = %name, stderr = %line, "server stderr");
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(server = %name, error = %e, "stderr read failed");
                break;
            }
        }
    }
}

/// Own the process handle until it exits, then fail whatever is pending.
async fn watch_exit(
    name: String,
    mut process: Box<dyn ChildProcess>,
    transport: Arc<StdioTransport>,
    stop_rx: oneshot::Receiver<()>,
    state_tx: watch::Sender<ServerState>,
    shutdown_timeout: Duration,
) {
    let status = tokio::select! {
        status = process.wait() => status,
        _ = stop_rx => {
            transport.close_stdin().await;
            match tokio::time::timeout(shutdown_timeout, process.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    tracing::warn!(server = %name, "server ignored stdin close; killing");
                    if let Err(e) = process.kill().await {
                        tracing::warn!(server = %name, error = %e, "failed to kill server");
                    }
                    process.wait().await
                }
            }
        }
    };

    let reason = match status {
        Ok(Some(code)) => format!("process exited with code {code}"),
        Ok(None) => "process terminated by signal".to_string(),
        Err(e) => format!("failed to wait for process: {e}"),
    };

    let failed = transport.fail_all(&reason);
    state_tx.send_replace(ServerState::Exited);
    tracing::info!(server = %name, reason = %reason, failed_requests = failed, "server exited");
}

// ─── Tests ───────────────────────────────────────────────────────────────────

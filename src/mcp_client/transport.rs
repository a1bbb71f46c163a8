//! JSON-RPC over stdio transport.
//!
//! Handles low-level communication with one MCP server child process:
//! - Writing JSON-RPC requests to stdin (the only writer of that pipe)
//! - A single demultiplexing task that owns stdout, decodes frames, and
//!   resolves pending requests by id
//! - Per-request deadlines and failing every waiter when the stream closes

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;

use super::codec::FrameDecoder;
use super::errors::McpError;
use super::types::{IncomingMessage, JsonRpcRequest, JsonRpcResponse};

/// Write half handed to the transport (a child's stdin or a test pipe).
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Read half handed to the transport (a child's stdout or a test pipe).
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

type Waiter = oneshot::Sender<Result<JsonRpcResponse, McpError>>;

// ─── Pending Requests ────────────────────────────────────────────────────────

#[derive(Default)]
struct PendingState {
    waiters: HashMap<u64, Waiter>,
    /// Set once the stream is gone; no new waiters are accepted after that.
    closed: Option<String>,
}

type SharedPending = Arc<std::sync::Mutex<PendingState>>;

fn lock_pending(pending: &SharedPending) -> std::sync::MutexGuard<'_, PendingState> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Fail every waiter with `ConnectionLost` and refuse new ones.
fn close_pending(pending: &SharedPending, server: &str, reason: &str) -> usize {
    let drained: Vec<Waiter> = {
        let mut state = lock_pending(pending);
        if state.closed.is_none() {
            state.closed = Some(reason.to_string());
        }
        state.waiters.drain().map(|(_, tx)| tx).collect()
    };
    let count = drained.len();
    for tx in drained {
        let _ = tx.send(Err(McpError::ConnectionLost {
            name: server.to_string(),
            reason: reason.to_string(),
        }));
    }
    count
}

/// Removes a waiter when the calling future finishes or is dropped.
struct PendingGuard<'a> {
    pending: &'a SharedPending,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock_pending(self.pending).waiters.remove(&self.id);
    }
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// Bi-directional JSON-RPC transport over a child process's stdio.
pub struct StdioTransport {
    server_name: String,
    writer: Mutex<Option<BoxedWriter>>,
    pending: SharedPending,
    next_id: AtomicU64,
    initialized_rx: watch::Receiver<bool>,
    closed_rx: watch::Receiver<bool>,
    reader_task: JoinHandle<()>,
}

impl StdioTransport {
    /// Create a transport and start its stdout demultiplexing task.
    pub fn new(server_name: &str, stdin: BoxedWriter, stdout: BoxedReader) -> Self {
        let pending: SharedPending = Arc::default();
        let (initialized_tx, initialized_rx) = watch::channel(false);
        let (closed_tx, closed_rx) = watch::channel(false);

        let reader_task = tokio::spawn(demux_loop(
            server_name.to_string(),
            stdout,
            Arc::clone(&pending),
            initialized_tx,
            closed_tx,
        ));

        Self {
            server_name: server_name.to_string(),
            writer: Mutex::new(Some(stdin)),
            pending,
            next_id: AtomicU64::new(1),
            initialized_rx,
            closed_rx,
            reader_task,
        }
    }

    /// Send a JSON-RPC request and wait for the matching response.
    ///
    /// Concurrent calls are correlated independently by id and may complete
    /// in any order. A response that never arrives yields `RequestTimeout`
    /// after `timeout`; the pending entry is removed either way.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        {
            let mut state = lock_pending(&self.pending);
            if let Some(reason) = &state.closed {
                return Err(McpError::ConnectionLost {
                    name: self.server_name.clone(),
                    reason: reason.clone(),
                });
            }
            state.waiters.insert(id, tx);
        }
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        let req = JsonRpcRequest::new(id, method, params);
        let json = serde_json::to_value(&req).map_err(|e| McpError::TransportError {
            server: self.server_name.clone(),
            reason: format!("failed to serialize request: {e}"),
        })?;
        self.write_line(&json).await?;

        tracing::debug!(server = %self.server_name, id, method, "request sent");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(McpError::ConnectionLost {
                name: self.server_name.clone(),
                reason: "response channel dropped".into(),
            }),
            Err(_) => Err(McpError::RequestTimeout {
                server: self.server_name.clone(),
                method: method.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        let mut notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
        });
        if let Some(params) = params {
            notification["params"] = params;
        }
        self.write_line(&notification).await
    }

    async fn write_line(&self, message: &Value) -> Result<(), McpError> {
        let mut json = message.to_string();
        json.push('\n');

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| McpError::TransportError {
            server: self.server_name.clone(),
            reason: "stdin already closed".into(),
        })?;
        writer
            .write_all(json.as_bytes())
            .await
            .map_err(|e| McpError::TransportError {
                server: self.server_name.clone(),
                reason: format!("failed to write to stdin: {e}"),
            })?;
        writer
            .flush()
            .await
            .map_err(|e| McpError::TransportError {
                server: self.server_name.clone(),
                reason: format!("failed to flush stdin: {e}"),
            })
    }

    /// Close the child's stdin, signalling end of input.
    pub async fn close_stdin(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }

    /// Fail all pending requests with `ConnectionLost` and refuse new ones.
    pub fn fail_all(&self, reason: &str) -> usize {
        close_pending(&self.pending, &self.server_name, reason)
    }

    /// Number of requests currently waiting for a response.
    pub fn pending_count(&self) -> usize {
        lock_pending(&self.pending).waiters.len()
    }

    /// Whether the stdout stream has ended.
    pub fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    /// Resolve once the child has sent `notifications/initialized`.
    ///
    /// Never resolves if the stream closes first; callers race it against
    /// their own deadline.
    pub async fn initialized_notification(&self) {
        let mut rx = self.initialized_rx.clone();
        let seen = rx.wait_for(|seen| *seen).await.map(|_| ());
        if seen.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Resolve once the stdout stream has ended.
    pub async fn closed(&self) {
        let mut rx = self.closed_rx.clone();
        let _ = rx.wait_for(|closed| *closed).await.map(|_| ());
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

// ─── Demultiplexer ───────────────────────────────────────────────────────────

/// Own the child's stdout: decode every frame and route it to its waiter.
async fn demux_loop(
    server: String,
    mut stdout: BoxedReader,
    pending: SharedPending,
    initialized_tx: watch::Sender<bool>,
    closed_tx: watch::Sender<bool>,
) {
    let mut decoder = FrameDecoder::new();
    let mut chunk = vec![0u8; 8192];

    let reason = loop {
        match stdout.read(&mut chunk).await {
            Ok(0) => break "stdout closed (process may have exited)".to_string(),
            Ok(n) => {
                for value in decoder.push(&chunk[..n]) {
                    dispatch(&server, value, &pending, &initialized_tx);
                }
            }
            Err(e) => break format!("failed to read from stdout: {e}"),
        }
    };

    if let Some(value) = decoder.finish() {
        dispatch(&server, value, &pending, &initialized_tx);
    }

    let failed = close_pending(&pending, &server, &reason);
    tracing::info!(server = %server, failed_requests = failed, reason = %reason, "child stream ended");
    closed_tx.send_replace(true);
}

fn dispatch(
    server: &str,
    value: Value,
    pending: &SharedPending,
    initialized_tx: &watch::Sender<bool>,
) {
    let message: IncomingMessage = match serde_json::from_value(value) {
        Ok(m) => m,
        Err(e) => {
            tracing::debug!(server, error = %e, "ignoring non JSON-RPC message");
            return;
        }
    };

    if message.is_initialized_notification() {
        initialized_tx.send_replace(true);
        return;
    }

    let Some(id) = message.correlation_id() else {
        tracing::debug!(server, method = ?message.method, "ignoring child-initiated message");
        return;
    };

    let waiter = lock_pending(pending).waiters.remove(&id);
    match waiter {
        Some(tx) => {
            let _ = tx.send(Ok(JsonRpcResponse {
                id,
                result: message.result,
                error: message.error,
            }));
        }
        None => tracing::debug!(server, id, "dropping response with no pending request"),
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::ServerError {
        code: -32603,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Instant;
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream};

    /// Transport wired to in-memory pipes; returns the child's ends.
    fn pipe_transport() -> (StdioTransport, BufReader<DuplexStream>, DuplexStream) {
        let (stdin_ours, stdin_child) = tokio::io::duplex(64 * 1024);
        let (stdout_child, stdout_ours) = tokio::io::duplex(64 * 1024);
        let transport =
            StdioTransport::new("test", Box::new(stdin_ours), Box::new(stdout_ours));
        (transport, BufReader::new(stdin_child), stdout_child)
    }

    async fn read_request(child_in: &mut BufReader<DuplexStream>) -> Value {
        let mut line = String::new();
        child_in.read_line(&mut line).await.unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn test_request_resolves_matching_response() {
        let (transport, mut child_in, mut child_out) = pipe_transport();

        let child = tokio::spawn(async move {
            let req = read_request(&mut child_in).await;
            assert_eq!(req["jsonrpc"], "2.0");
            assert_eq!(req["method"], "tools/list");
            let resp = json!({"jsonrpc": "2.0", "id": req["id"], "result": {"tools": []}});
            child_out
                .write_all(format!("log noise\n{resp}\n").as_bytes())
                .await
                .unwrap();
            (child_in, child_out)
        });

        let resp = transport
            .request("tools/list", Some(json!({})), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(resp.result.unwrap()["tools"], json!([]));
        assert_eq!(transport.pending_count(), 0);
        let _ = child.await.unwrap();
    }

    #[tokio::test]
    async fn test_null_result_is_a_success() {
        let (transport, mut child_in, mut child_out) = pipe_transport();

        let child = tokio::spawn(async move {
            let req = read_request(&mut child_in).await;
            let resp = json!({"jsonrpc": "2.0", "id": req["id"], "result": null});
            child_out
                .write_all(format!("{resp}\n").as_bytes())
                .await
                .unwrap();
            (child_in, child_out)
        });

        let resp = transport
            .request("tools/call", None, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(extract_result(resp).unwrap(), Value::Null);
        let _ = child.await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_requests_complete_out_of_order() {
        let (transport, mut child_in, mut child_out) = pipe_transport();

        let child = tokio::spawn(async move {
            let first = read_request(&mut child_in).await;
            let second = read_request(&mut child_in).await;
            // Answer in reverse order.
            for req in [&second, &first] {
                let resp = json!({"jsonrpc": "2.0", "id": req["id"], "result": {"echo": req["method"]}});
                child_out.write_all(format!("{resp}\n").as_bytes()).await.unwrap();
            }
            (child_in, child_out)
        });

        let timeout = Duration::from_secs(2);
        let (a, b) = tokio::join!(
            transport.request("first", None, timeout),
            transport.request("second", None, timeout),
        );
        assert_eq!(a.unwrap().result.unwrap()["echo"], "first");
        assert_eq!(b.unwrap().result.unwrap()["echo"], "second");
        let _ = child.await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_removes_pending_entry() {
        let (transport, mut child_in, mut child_out) = pipe_transport();
        let timeout = Duration::from_millis(100);

        let started = Instant::now();
        let err = transport.request("slow", None, timeout).await.unwrap_err();
        assert!(matches!(err, McpError::RequestTimeout { .. }));
        assert!(started.elapsed() >= timeout);
        assert_eq!(transport.pending_count(), 0);

        // A late answer to the timed-out id must not satisfy the next request.
        let stale = read_request(&mut child_in).await;
        let late = json!({"jsonrpc": "2.0", "id": stale["id"], "result": {"stale": true}});
        child_out.write_all(format!("{late}\n").as_bytes()).await.unwrap();

        let child = tokio::spawn(async move {
            let req = read_request(&mut child_in).await;
            assert_ne!(req["id"], stale["id"]);
            let resp = json!({"jsonrpc": "2.0", "id": req["id"], "result": {"stale": false}});
            child_out.write_all(format!("{resp}\n").as_bytes()).await.unwrap();
            (child_in, child_out)
        });

        let resp = transport
            .request("slow", None, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(resp.result.unwrap()["stale"], false);
        let _ = child.await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_close_fails_pending_with_connection_lost() {
        let (transport, mut child_in, child_out) = pipe_transport();

        let child = tokio::spawn(async move {
            let _ = read_request(&mut child_in).await;
            drop(child_out);
            child_in
        });

        let err = transport
            .request("tools/call", None, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ConnectionLost { .. }));
        transport.closed().await;
        assert!(transport.is_closed());

        let err = transport
            .request("tools/call", None, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ConnectionLost { .. }));
        let _ = child.await.unwrap();
    }

    #[tokio::test]
    async fn test_initialized_notification_is_observed() {
        let (transport, _child_in, mut child_out) = pipe_transport();
        child_out
            .write_all(b"{\"jsonrpc\":\"2.0\",\"method\":\"notifications/initialized\"}\n")
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), transport.initialized_notification())
            .await
            .expect("initialized notification not seen");
    }

    #[tokio::test]
    async fn test_notify_writes_without_id() {
        let (transport, mut child_in, _child_out) = pipe_transport();
        transport.notify("notifications/initialized", None).await.unwrap();
        let msg = read_request(&mut child_in).await;
        assert_eq!(msg["method"], "notifications/initialized");
        assert!(msg.get("id").is_none());
    }

    #[test]
    fn test_extract_result_error() {
        let resp = JsonRpcResponse {
            id: 1,
            result: None,
            error: Some(super::super::types::JsonRpcError {
                code: -32601,
                message: "Method not found".into(),
                data: None,
            }),
        };
        let err = extract_result(resp).unwrap_err();
        match err {
            McpError::ServerError { code, message, .. } => {
                assert_eq!(code, -32601);
                assert_eq!(message, "Method not found");
            }
            _ => panic!("expected ServerError"),
        }
    }

    #[test]
    fn test_extract_result_missing_both() {
        let resp = JsonRpcResponse {
            id: 1,
            result: None,
            error: None,
        };
        let err = extract_result(resp).unwrap_err();
        assert!(matches!(err, McpError::ServerError { .. }));
    }
}

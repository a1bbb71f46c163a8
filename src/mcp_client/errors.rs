//! MCP Client error types.

use thiserror::Error;

/// Errors that can occur while talking to upstream MCP server processes.
#[derive(Debug, Clone, Error)]
pub enum McpError {
    /// A server process failed to start (executable missing, permission denied).
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed {
        name: String,
        reason: String,
    },

    /// The server did not become ready within the startup deadline.
    #[error("server '{name}' did not become ready within {timeout_ms}ms")]
    StartupTimeout {
        name: String,
        timeout_ms: u64,
    },

    /// A request sent to a server received no matching response in time.
    #[error("request '{method}' to server '{server}' timed out after {timeout_ms}ms")]
    RequestTimeout {
        server: String,
        method: String,
        timeout_ms: u64,
    },

    /// The server process exited or its stdout closed while requests were pending.
    #[error("connection to server '{name}' lost: {reason}")]
    ConnectionLost {
        name: String,
        reason: String,
    },

    /// JSON-RPC communication error (serialization, stdin write failure).
    #[error("transport error for server '{server}': {reason}")]
    TransportError {
        server: String,
        reason: String,
    },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// No enabled server is configured under this name.
    #[error("unknown server: '{name}'")]
    UnknownServer {
        name: String,
    },

    /// The server exists but could not reach the ready state.
    #[error("server '{name}' is not ready: {reason}")]
    ServerNotReady {
        name: String,
        reason: String,
    },

    /// The caller supplied malformed parameters (e.g. an unparseable tool name).
    #[error("invalid params: {reason}")]
    InvalidParams {
        reason: String,
    },

    /// Configuration error (bad config file, invalid server name).
    #[error("config error: {reason}")]
    ConfigError {
        reason: String,
    },
}

impl McpError {
    /// Whether this error means the child connection itself is gone.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            McpError::ConnectionLost { .. } | McpError::TransportError { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_server_name() {
        let err = McpError::RequestTimeout {
            server: "alpha".into(),
            method: "tools/list".into(),
            timeout_ms: 5000,
        };
        let text = err.to_string();
        assert!(text.contains("alpha"));
        assert!(text.contains("tools/list"));
        assert!(text.contains("5000ms"));
    }

    #[test]
    fn test_is_connection_failure() {
        let lost = McpError::ConnectionLost {
            name: "alpha".into(),
            reason: "exited with code 1".into(),
        };
        assert!(lost.is_connection_failure());

        let unknown = McpError::UnknownServer { name: "beta".into() };
        assert!(!unknown.is_connection_failure());
    }
}

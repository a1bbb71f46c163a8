//! Shared types for the MCP client.
//!
//! JSON-RPC 2.0 message types and MCP protocol structures exchanged with
//! upstream server processes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// MCP protocol version spoken on both sides of the gateway.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Name reported in `clientInfo` / `serverInfo`.
pub const GATEWAY_NAME: &str = "mcp-manager";

/// Notification a child emits (or receives) once the handshake is complete.
pub const INITIALIZED_NOTIFICATION: &str = "notifications/initialized";

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message sent to a child.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// Any message read from a child's stdout.
///
/// Responses carry `id` plus `result` or `error`; notifications carry
/// `method` and no `id`. Requests initiated by the child carry both and are
/// not interpreted by the gateway.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IncomingMessage {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub method: Option<String>,
    /// `Some(Value::Null)` when the child sent `"result": null`.
    #[serde(default, deserialize_with = "present_value")]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

/// Keep a present-but-null field distinct from a missing one.
fn present_value<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl IncomingMessage {
    /// Numeric correlation id, if this message is a response to one of ours.
    ///
    /// Children that echo the id back as a string are accepted too.
    pub fn correlation_id(&self) -> Option<u64> {
        if self.method.is_some() {
            return None;
        }
        match self.id.as_ref()? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Whether this is the child's "handshake complete" notification.
    pub fn is_initialized_notification(&self) -> bool {
        self.id.is_none()
            && matches!(
                self.method.as_deref(),
                Some(INITIALIZED_NOTIFICATION) | Some("initialized")
            )
    }
}

/// JSON-RPC 2.0 response message (success or error) matched to a request.
#[derive(Debug, Clone)]
pub struct JsonRpcResponse {
    pub id: u64,
    pub result: Option<Value>,
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// One upstream server entry from the `mcpServers` configuration map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub disabled: bool,
    /// Optional working directory for the child process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

impl ServerDescriptor {
    /// Descriptor for `command` with no arguments or overrides.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            disabled: false,
            cwd: None,
        }
    }

    /// Builder-style argument list.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// Tool definition as a child returns it from `tools/list`.
///
/// Unknown fields (annotations, output schemas) are kept and passed through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "inputSchema", skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// `tools/list` result payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolsListResult {
    #[serde(default)]
    pub tools: Vec<McpToolDefinition>,
}

/// A tool as exposed by the gateway: namespaced by its owning server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    /// `{serverName}_{originalName}`.
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Parameters the gateway sends with its own `initialize` request.
pub fn initialize_params() -> Value {
    serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": { "tools": {} },
        "clientInfo": {
            "name": GATEWAY_NAME,
            "version": env!("CARGO_PKG_VERSION"),
        }
    })
}

// ─── Standard MCP Error Codes ────────────────────────────────────────────────

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i32 = -32700;
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i32 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
}

// ─── Tests ───────────────────────────────────────────────────────────────────

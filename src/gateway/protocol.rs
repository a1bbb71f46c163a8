//! JSON-RPC 2.0 envelopes as seen by the gateway's own callers.
//!
//! Validation of inbound messages, response construction, and the
//! translation of `McpError` into wire error objects.

use serde::Serialize;
use serde_json::{json, Value};

use crate::mcp_client::types::{error_codes, JsonRpcError, GATEWAY_NAME, PROTOCOL_VERSION};
use crate::mcp_client::McpError;

// ─── Inbound ─────────────────────────────────────────────────────────────────

/// A validated request addressed to the gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
    pub id: Value,
    pub method: String,
    /// Missing params are normalised to `{}`.
    pub params: Value,
}

/// What an inbound JSON value turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Request(RpcRequest),
    /// Well-formed but carries no `id`; never answered.
    Notification { method: String },
    /// Fails the envelope rules; answered with -32600. Keeps the id if one was readable.
    Invalid { id: Value },
}

/// Classify a decoded JSON value.
///
/// A request needs `jsonrpc: "2.0"`, a non-empty string `method`, and an
/// `id` key (a `null` id is accepted).
pub fn classify(value: Value) -> Envelope {
    let Value::Object(mut obj) = value else {
        return Envelope::Invalid { id: Value::Null };
    };

    let version_ok = obj.get("jsonrpc").and_then(Value::as_str) == Some("2.0");
    let method = obj
        .get("method")
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .map(String::from);

    let (true, Some(method)) = (version_ok, method) else {
        let id = obj.remove("id").unwrap_or(Value::Null);
        return Envelope::Invalid { id };
    };

    match obj.remove("id") {
        Some(id) => Envelope::Request(RpcRequest {
            id,
            method,
            params: obj
                .remove("params")
                .filter(|p| !p.is_null())
                .unwrap_or_else(|| json!({})),
        }),
        None => Envelope::Notification { method },
    }
}

/// Parse raw text into an envelope, or `None` when it is not JSON at all.
pub fn decode(text: &str) -> Option<Envelope> {
    serde_json::from_str::<Value>(text).ok().map(classify)
}

// ─── Outbound ────────────────────────────────────────────────────────────────

/// A JSON-RPC 2.0 response object.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RpcResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl RpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn parse_error() -> Self {
        Self::failure(Value::Null, error(error_codes::PARSE_ERROR, "Parse error"))
    }

    pub fn invalid_request(id: Value) -> Self {
        Self::failure(id, error(error_codes::INVALID_REQUEST, "Invalid Request"))
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn to_value(&self) -> Value {
        let mut out = json!({ "jsonrpc": self.jsonrpc, "id": self.id });
        if let Some(result) = &self.result {
            out["result"] = result.clone();
        }
        if let Some(err) = &self.error {
            let mut e = json!({ "code": err.code, "message": err.message });
            if let Some(data) = &err.data {
                e["data"] = data.clone();
            }
            out["error"] = e;
        }
        out
    }
}

fn error(code: i32, message: impl Into<String>) -> JsonRpcError {
    JsonRpcError {
        code,
        message: message.into(),
        data: None,
    }
}

pub fn method_not_found(method: &str) -> JsonRpcError {
    error(
        error_codes::METHOD_NOT_FOUND,
        format!("Method not found: {method}"),
    )
}

pub fn invalid_params(reason: &str) -> JsonRpcError {
    error(error_codes::INVALID_PARAMS, format!("Invalid params: {reason}"))
}

/// Translate a backend failure into the error object sent to the caller.
///
/// A child's own error passes through untouched; everything else becomes
/// an internal error carrying the failure's description.
pub fn rpc_error(err: &McpError) -> JsonRpcError {
    match err {
        McpError::ServerError {
            code,
            message,
            data,
        } => JsonRpcError {
            code: *code,
            message: message.clone(),
            data: data.clone(),
        },
        McpError::InvalidParams { reason } => invalid_params(reason),
        other => error(error_codes::INTERNAL_ERROR, other.to_string()),
    }
}

// ─── Static Payloads ─────────────────────────────────────────────────────────

/// Result of the gateway's own `initialize`.
pub fn initialize_result() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {
            "tools": {},
            "resources": {},
            "prompts": {}
        },
        "serverInfo": {
            "name": GATEWAY_NAME,
            "version": env!("CARGO_PKG_VERSION"),
        }
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

//! Method dispatch shared by every front end.

use std::sync::Arc;

use serde_json::{json, Value};

use super::protocol::{
    self, initialize_result, invalid_params, method_not_found, rpc_error, Envelope, RpcRequest,
    RpcResponse,
};
use crate::mcp_client::registry::tools_list_result;
use crate::mcp_client::types::JsonRpcError;
use crate::mcp_client::McpClient;

/// Answers gateway requests against the shared `McpClient`.
#[derive(Clone)]
pub struct RpcHandler {
    client: Arc<McpClient>,
}

impl RpcHandler {
    pub fn new(client: Arc<McpClient>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Arc<McpClient> {
        &self.client
    }

    /// Answer one validated request. Every failure becomes an error response.
    pub async fn handle(&self, request: RpcRequest) -> RpcResponse {
        let RpcRequest { id, method, params } = request;
        tracing::info!(method = %method, id = %id, "processing request");

        let outcome = match method.as_str() {
            "initialize" => Ok(initialize_result()),
            "tools/list" => Ok(tools_list_result(&self.client.list_tools().await)),
            "tools/call" => self.call_tool(params).await,
            "resources/list" => Ok(json!({ "resources": [] })),
            "prompts/list" => Ok(json!({ "prompts": [] })),
            other => Err(method_not_found(other)),
        };

        match outcome {
            Ok(result) => RpcResponse::success(id, result),
            Err(error) => {
                tracing::debug!(method = %method, code = error.code, message = %error.message, "request failed");
                RpcResponse::failure(id, error)
            }
        }
    }

    /// Decode and answer one stdio line; `None` for notifications.
    ///
    /// Non-JSON yields -32700 and a broken envelope -32600.
    pub async fn handle_text(&self, text: &str) -> Option<RpcResponse> {
        match protocol::decode(text) {
            Some(Envelope::Notification { method }) => {
                tracing::debug!(method = %method, "ignoring notification");
                None
            }
            decoded => Some(self.answer(decoded).await),
        }
    }

    /// Decode and answer one WebSocket frame. A message without `id` is
    /// answered with -32600 like any other broken envelope.
    pub async fn handle_frame(&self, text: &str) -> RpcResponse {
        self.answer(protocol::decode(text)).await
    }

    async fn answer(&self, decoded: Option<Envelope>) -> RpcResponse {
        match decoded {
            None => RpcResponse::parse_error(),
            Some(Envelope::Invalid { id }) => RpcResponse::invalid_request(id),
            Some(Envelope::Notification { .. }) => RpcResponse::invalid_request(Value::Null),
            Some(Envelope::Request(request)) => self.handle(request).await,
        }
    }

    async fn call_tool(&self, params: Value) -> Result<Value, JsonRpcError> {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| invalid_params("missing tool name"))?;
        let arguments = params
            .get("arguments")
            .filter(|a| !a.is_null())
            .cloned()
            .unwrap_or_else(|| json!({}));

        self.client
            .call_tool(name, arguments)
            .await
            .map_err(|e| rpc_error(&e))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

//! MCP Client: high-level interface for tool listing and execution.
//!
//! Routes a namespaced tool call to the child that owns it, starting the
//! child on demand, and handles the built-in `launch_manager` tool itself.
//! This is the single backend every transport front end talks to.

use std::process::Stdio;
use std::sync::Arc;

use serde_json::{json, Value};

use super::errors::McpError;
use super::launcher::ChildLauncher;
use super::registry::{parse_namespaced_name, ToolCatalog, META_TOOL_NAME};
use super::supervisor::Supervisor;
use super::types::ToolDescriptor;
use crate::config::{GatewayConfig, ManagerConfig};

// ─── McpClient ───────────────────────────────────────────────────────────────

/// Dispatch router over the tool catalog and the child supervisor.
pub struct McpClient {
    catalog: ToolCatalog,
    manager: ManagerConfig,
    /// Reported by `launch_manager` when `manager.url` is not set.
    default_manager_url: String,
}

impl McpClient {
    pub fn new(catalog: ToolCatalog, manager: ManagerConfig, default_manager_url: String) -> Self {
        Self {
            catalog,
            manager,
            default_manager_url,
        }
    }

    /// Build the full backend (supervisor, catalog, router) from configuration.
    pub fn from_config(config: &GatewayConfig, launcher: Arc<dyn ChildLauncher>) -> Self {
        let supervisor = Supervisor::from_config(config, launcher);
        Self::new(
            ToolCatalog::new(supervisor),
            config.manager.clone(),
            config.gateway.base_url(),
        )
    }

    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    pub fn supervisor(&self) -> &Supervisor {
        self.catalog.supervisor()
    }

    /// The aggregated tool catalog.
    pub async fn list_tools(&self) -> Vec<ToolDescriptor> {
        self.catalog.list_all_tools().await
    }

    // ─── Tool Execution ──────────────────────────────────────────────────

    /// Execute a tool call, routing to the appropriate server.
    ///
    /// Steps:
    /// 1. Handle the built-in tool without touching any child
    /// 2. Split the name into `(server, tool)` and check the server is enabled
    /// 3. Start the server if needed
    /// 4. Forward `tools/call` with `{name, arguments}` and return its result as-is
    ///
    /// A JSON-RPC error from the child comes back unchanged as `ServerError`.
    pub async fn call_tool(&self, tool_name: &str, arguments: Value) -> Result<Value, McpError> {
        if tool_name == META_TOOL_NAME {
            return self.launch_manager();
        }

        // 1. Resolve owner
        let (server_name, original_name) =
            parse_namespaced_name(tool_name).ok_or_else(|| McpError::UnknownServer {
                name: tool_name.to_string(),
            })?;
        if !self.supervisor().is_enabled(server_name) {
            return Err(McpError::UnknownServer {
                name: server_name.to_string(),
            });
        }

        // 2. Ensure ready
        let server = self
            .supervisor()
            .ensure_started(server_name)
            .await
            .map_err(|e| match e {
                McpError::StartupTimeout { .. } => McpError::ServerNotReady {
                    name: server_name.to_string(),
                    reason: e.to_string(),
                },
                other => other,
            })?;

        // 3. Forward
        let params = json!({
            "name": original_name,
            "arguments": arguments,
        });
        tracing::debug!(server = server_name, tool = original_name, "forwarding tool call");

        let timeout = self.supervisor().timeouts().request();
        let result = server.request("tools/call", Some(params), timeout).await;
        match &result {
            Err(e) if e.is_connection_failure() => {
                tracing::warn!(server = server_name, tool = original_name, error = %e, "lost child during tool call");
            }
            Err(e) => {
                tracing::debug!(server = server_name, tool = original_name, error = %e, "tool call returned error");
            }
            Ok(_) => {}
        }
        result
    }

    /// Start the companion management interface, if one is configured.
    fn launch_manager(&self) -> Result<Value, McpError> {
        let url = self
            .manager
            .url
            .clone()
            .unwrap_or_else(|| self.default_manager_url.clone());

        if let Some(command) = &self.manager.command {
            let child = tokio::process::Command::new(command)
                .args(&self.manager.args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
                .map_err(|e| McpError::SpawnFailed {
                    name: "manager".into(),
                    reason: format!("{command}: {e}"),
                })?;
            tracing::info!(command = %command, pid = ?child.id(), url = %url, "launched manager interface");
        } else {
            tracing::info!(url = %url, "no manager command configured; reporting URL only");
        }

        Ok(json!({
            "content": [{
                "type": "text",
                "text": format!("MCP Manager launched at {url}"),
            }]
        }))
    }

    /// Stop every child server.
    pub async fn shutdown(&self) {
        self.supervisor().shutdown().await;
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimeoutConfig;
    use crate::mcp_client::testing::{FakeLauncher, FakeServer};
    use crate::mcp_client::types::ServerDescriptor;
    use std::collections::BTreeMap;

    fn client_with(launcher: &Arc<FakeLauncher>, names: &[&str]) -> McpClient {
        client_with_manager(launcher, names, ManagerConfig::default())
    }

    fn client_with_manager(
        launcher: &Arc<FakeLauncher>,
        names: &[&str],
        manager: ManagerConfig,
    ) -> McpClient {
        let descriptors: BTreeMap<String, ServerDescriptor> = names
            .iter()
            .map(|n| (n.to_string(), ServerDescriptor::new("fake")))
            .collect();
        let timeouts = TimeoutConfig {
            request_ms: 300,
            startup_ms: 300,
            shutdown_ms: 200,
        };
        let supervisor = Supervisor::new(
            descriptors,
            Arc::clone(launcher) as Arc<dyn ChildLauncher>,
            timeouts,
        );
        McpClient::new(
            ToolCatalog::new(supervisor),
            manager,
            "http://localhost:3456".into(),
        )
    }

    #[tokio::test]
    async fn test_call_forwards_original_name_and_arguments() {
        let launcher = Arc::new(FakeLauncher::new().with_server("simple", FakeServer::echo()));
        let client = client_with(&launcher, &["simple"]);

        let args = json!({"message": "hi", "nested": {"k": [1, 2]}});
        let result = client.call_tool("simple_echo", args.clone()).await.unwrap();
        assert_eq!(result["content"][0]["text"], "hi");

        let call = launcher
            .received("simple")
            .into_iter()
            .find(|m| m["method"] == "tools/call")
            .unwrap();
        assert_eq!(call["params"], json!({"name": "echo", "arguments": args}));
    }

    #[tokio::test]
    async fn test_call_starts_server_on_demand() {
        let launcher = Arc::new(FakeLauncher::new().with_server("simple", FakeServer::echo()));
        let client = client_with(&launcher, &["simple"]);
        assert!(client.supervisor().running_servers().is_empty());

        client
            .call_tool("simple_echo", json!({"message": "x"}))
            .await
            .unwrap();
        assert_eq!(client.supervisor().running_servers(), vec!["simple"]);
        assert_eq!(launcher.launch_count("simple"), 1);
    }

    #[tokio::test]
    async fn test_child_error_is_returned_verbatim() {
        let launcher = Arc::new(FakeLauncher::new().with_server("simple", FakeServer::echo()));
        let client = client_with(&launcher, &["simple"]);

        let err = client.call_tool("simple_fail", json!({})).await.unwrap_err();
        match err {
            McpError::ServerError {
                code,
                message,
                data,
            } => {
                assert_eq!(code, -32000);
                assert_eq!(message, "tool failed");
                assert_eq!(data, Some(json!({"detail": "boom"})));
            }
            other => panic!("expected ServerError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_server() {
        let launcher = Arc::new(FakeLauncher::new());
        let client = client_with(&launcher, &[]);

        let err = client.call_tool("ghost_echo", json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::UnknownServer { ref name } if name == "ghost"));

        let err = client.call_tool("plainname", json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::UnknownServer { .. }));
    }

    #[tokio::test]
    async fn test_startup_timeout_becomes_server_not_ready() {
        let launcher = Arc::new(
            FakeLauncher::new().with_server("mute", FakeServer::echo().without_initialize_response()),
        );
        let client = client_with(&launcher, &["mute"]);
        let err = client.call_tool("mute_echo", json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::ServerNotReady { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn test_request_timeout_does_not_kill_child() {
        let launcher = Arc::new(FakeLauncher::new().with_server("simple", FakeServer::echo()));
        let client = client_with(&launcher, &["simple"]);

        let err = client.call_tool("simple_hang", json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::RequestTimeout { .. }));
        assert!(!launcher.is_stopped("simple"));

        let ok = client
            .call_tool("simple_echo", json!({"message": "still here"}))
            .await
            .unwrap();
        assert_eq!(ok["content"][0]["text"], "still here");
    }

    #[tokio::test]
    async fn test_meta_tool_never_touches_children() {
        let launcher = Arc::new(FakeLauncher::new().with_server("simple", FakeServer::echo()));
        let client = client_with(&launcher, &["simple"]);

        let result = client.call_tool(META_TOOL_NAME, json!({})).await.unwrap();
        assert_eq!(result["content"][0]["type"], "text");
        assert_eq!(
            result["content"][0]["text"],
            "MCP Manager launched at http://localhost:3456"
        );
        assert_eq!(launcher.launch_count("simple"), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_meta_tool_spawns_configured_command() {
        let launcher = Arc::new(FakeLauncher::new());
        let manager = ManagerConfig {
            command: Some("true".into()),
            args: vec![],
            url: Some("http://127.0.0.1:9000/ui".into()),
        };
        let client = client_with_manager(&launcher, &[], manager);
        let result = client.call_tool(META_TOOL_NAME, json!({})).await.unwrap();
        assert_eq!(
            result["content"][0]["text"],
            "MCP Manager launched at http://127.0.0.1:9000/ui"
        );
    }

    #[tokio::test]
    async fn test_meta_tool_reports_spawn_failure() {
        let launcher = Arc::new(FakeLauncher::new());
        let manager = ManagerConfig {
            command: Some("definitely-not-a-real-binary-77aa".into()),
            args: vec![],
            url: None,
        };
        let client = client_with_manager(&launcher, &[], manager);
        let err = client.call_tool(META_TOOL_NAME, json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::SpawnFailed { .. }));
    }
}

//! Tool catalog: aggregates tool definitions across all MCP servers.
//!
//! Provides:
//! - Namespacing of child tool names as `server_tool`
//! - Splitting a namespaced name back into `(server, tool)`
//! - A per-server cache of `tools/list` results, filled on first demand
//! - The aggregated listing offered to callers, built-in tool first

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::join_all;
use serde_json::{json, Value};
use tokio::sync::OnceCell;

use super::errors::McpError;
use super::supervisor::Supervisor;
use super::types::{McpToolDefinition, ToolDescriptor, ToolsListResult};

// ─── Namespacing ─────────────────────────────────────────────────────────────

/// Separates the server name from the tool name. Server names may not contain it.
pub const NAMESPACE_DELIMITER: char = '_';

/// Name of the built-in tool that is not backed by any child.
pub const META_TOOL_NAME: &str = "launch_manager";

/// Qualify a child's tool definition with its owning server.
///
/// E.g., `echo` from `simple` becomes `simple_echo`, described as
/// `"[simple] Echo a message"`.
pub fn namespace_tool(server_name: &str, tool: McpToolDefinition) -> ToolDescriptor {
    ToolDescriptor {
        name: format!("{server_name}{NAMESPACE_DELIMITER}{}", tool.name),
        description: format!(
            "[{server_name}] {}",
            tool.description.unwrap_or_default()
        ),
        input_schema: tool.input_schema,
        original_name: Some(tool.name),
        server_name: Some(server_name.to_string()),
        extra: tool.extra,
    }
}

/// Split a namespaced tool name on the first delimiter.
///
/// `"fs_read_file"` → `("fs", "read_file")`. Returns `None` when either half
/// would be empty.
pub fn parse_namespaced_name(name: &str) -> Option<(&str, &str)> {
    let (server, tool) = name.split_once(NAMESPACE_DELIMITER)?;
    if server.is_empty() || tool.is_empty() {
        return None;
    }
    Some((server, tool))
}

/// Descriptor of the built-in `launch_manager` tool.
pub fn meta_tool_descriptor() -> ToolDescriptor {
    ToolDescriptor {
        name: META_TOOL_NAME.to_string(),
        description: "Launch the MCP Server Manager interface".to_string(),
        input_schema: Some(json!({ "type": "object", "properties": {} })),
        original_name: None,
        server_name: None,
        extra: serde_json::Map::new(),
    }
}

// ─── ToolCatalog ─────────────────────────────────────────────────────────────

type CachedTools = Arc<Vec<ToolDescriptor>>;

/// Aggregated tool catalog across all enabled servers.
///
/// Each server's list is fetched once and kept until [`ToolCatalog::invalidate`]
/// is called. Concurrent first requests for the same server share one fetch;
/// failures are not cached.
pub struct ToolCatalog {
    supervisor: Supervisor,
    cache: Mutex<HashMap<String, Arc<OnceCell<CachedTools>>>>,
}

impl ToolCatalog {
    pub fn new(supervisor: Supervisor) -> Self {
        Self {
            supervisor,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    fn lock_cache(&self) -> MutexGuard<'_, HashMap<String, Arc<OnceCell<CachedTools>>>> {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Every tool offered to callers: the built-in tool, then each server's tools.
    ///
    /// Servers that fail to start or to list their tools contribute nothing;
    /// the failure is logged and the rest of the catalog is still returned.
    pub async fn list_all_tools(&self) -> Vec<ToolDescriptor> {
        let servers = self.supervisor.enabled_servers();
        let lists = join_all(servers.iter().map(|name| self.server_tools(name))).await;

        let mut tools = vec![meta_tool_descriptor()];
        for (name, result) in servers.iter().zip(lists) {
            match result {
                Ok(list) => tools.extend(list.iter().cloned()),
                Err(e) => {
                    tracing::warn!(server = %name, error = %e, "server contributes no tools");
                }
            }
        }

        tracing::debug!(tools = tools.len(), servers = servers.len(), "catalog assembled");
        tools
    }

    /// Namespaced tools for one server, fetching them on first use.
    pub async fn server_tools(&self, server_name: &str) -> Result<CachedTools, McpError> {
        let cell = Arc::clone(
            self.lock_cache()
                .entry(server_name.to_string())
                .or_default(),
        );
        cell.get_or_try_init(|| self.fetch(server_name))
            .await
            .map(Arc::clone)
    }

    async fn fetch(&self, server_name: &str) -> Result<CachedTools, McpError> {
        let result = self
            .supervisor
            .send_request(server_name, "tools/list", Some(json!({})))
            .await?;

        let listed: ToolsListResult =
            serde_json::from_value(result).map_err(|e| McpError::TransportError {
                server: server_name.to_string(),
                reason: format!("malformed tools/list result: {e}"),
            })?;

        let tools: Vec<ToolDescriptor> = listed
            .tools
            .into_iter()
            .map(|tool| namespace_tool(server_name, tool))
            .collect();

        tracing::info!(server = server_name, count = tools.len(), "cached server tools");
        Ok(Arc::new(tools))
    }

    /// Forget the cached list for one server; the next listing re-queries it.
    pub fn invalidate(&self, server_name: &str) {
        if self.lock_cache().remove(server_name).is_some() {
            tracing::info!(server = server_name, "tool cache invalidated");
        }
    }

    /// Names of servers whose tool list is currently cached, sorted.
    pub fn cached_servers(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .lock_cache()
            .iter()
            .filter(|(_, cell)| cell.initialized())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Cached tool count for one server, without triggering a fetch.
    pub fn tools_for_server(&self, server_name: &str) -> usize {
        self.lock_cache()
            .get(server_name)
            .and_then(|cell| cell.get().map(|tools| tools.len()))
            .unwrap_or(0)
    }
}

/// Render a catalog as the `tools/list` result payload.
pub fn tools_list_result(tools: &[ToolDescriptor]) -> Value {
    json!({ "tools": tools })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

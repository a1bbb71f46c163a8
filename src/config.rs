//! Gateway configuration loading and validation.
//!
//! Reads a YAML or JSON file (JSON parses as YAML) holding the `mcpServers`
//! map plus gateway settings, after resolving `${VAR}` / `${VAR:-default}`
//! references from the environment. The loaded config is read-only for the
//! lifetime of the process.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::mcp_client::errors::McpError;
use crate::mcp_client::registry::NAMESPACE_DELIMITER;
use crate::mcp_client::types::ServerDescriptor;

/// Environment variable pointing at an explicit config file.
pub const CONFIG_ENV_VAR: &str = "MCP_MANAGER_CONFIG";

// ─── Public Types ────────────────────────────────────────────────────────────

/// Where the HTTP front ends listen and how often they send liveness signals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListenConfig {
    pub host: String,
    pub port: u16,
    /// Interval between SSE heartbeat events and WebSocket pings.
    pub heartbeat_secs: u64,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3456,
            heartbeat_secs: 30,
        }
    }
}

impl ListenConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    /// Base URL the gateway is reachable at.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Deadlines applied to child processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeoutConfig {
    /// Per-request deadline for `tools/list` and `tools/call`.
    pub request_ms: u64,
    /// Deadline for a child to complete the initialize handshake.
    pub startup_ms: u64,
    /// Grace period between closing stdin and killing a child.
    pub shutdown_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_ms: 10_000,
            startup_ms: 15_000,
            shutdown_ms: 5_000,
        }
    }
}

impl TimeoutConfig {
    pub fn request(&self) -> Duration {
        Duration::from_millis(self.request_ms)
    }

    pub fn startup(&self) -> Duration {
        Duration::from_millis(self.startup_ms)
    }

    pub fn shutdown(&self) -> Duration {
        Duration::from_millis(self.shutdown_ms)
    }
}

/// The companion management interface started by the `launch_manager` tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ManagerConfig {
    /// Command to spawn; when absent the tool only reports the URL.
    pub command: Option<String>,
    pub args: Vec<String>,
    /// URL reported back to the caller; defaults to the gateway's own address.
    pub url: Option<String>,
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayConfig {
    /// Upstream servers keyed by logical name.
    pub mcp_servers: BTreeMap<String, ServerDescriptor>,
    pub gateway: ListenConfig,
    pub timeouts: TimeoutConfig,
    pub manager: ManagerConfig,
}

impl GatewayConfig {
    /// Enabled servers only, in name order.
    pub fn enabled_servers(&self) -> impl Iterator<Item = (&String, &ServerDescriptor)> {
        self.mcp_servers.iter().filter(|(_, d)| !d.disabled)
    }

    /// Drop server entries the router could not address or launch.
    ///
    /// Each bad entry is skipped on its own with a warning; the remaining
    /// servers stay available. Returns the names that were dropped.
    pub fn prune_invalid_servers(&mut self) -> Vec<String> {
        let mut dropped = Vec::new();
        self.mcp_servers.retain(|name, descriptor| {
            let problem = if name.trim().is_empty() {
                Some("server names must not be empty".to_string())
            } else if name.contains(NAMESPACE_DELIMITER) {
                Some(format!(
                    "name must not contain '{NAMESPACE_DELIMITER}' (it separates server and tool names)"
                ))
            } else if descriptor.command.trim().is_empty() {
                Some("command is empty".to_string())
            } else {
                None
            };
            match problem {
                Some(reason) => {
                    tracing::warn!(server = %name, reason = %reason, "skipping invalid server entry");
                    dropped.push(name.clone());
                    false
                }
                None => true,
            }
        });
        dropped
    }

    /// Apply `MCP_MANAGER_HOST` / `MCP_MANAGER_PORT` overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("MCP_MANAGER_HOST") {
            if !host.trim().is_empty() {
                self.gateway.host = host;
            }
        }
        if let Ok(port) = std::env::var("MCP_MANAGER_PORT") {
            match port.parse() {
                Ok(p) => self.gateway.port = p,
                Err(_) => tracing::warn!(value = %port, "ignoring invalid MCP_MANAGER_PORT"),
            }
        }
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Resolve which config file to read.
///
/// Resolution order:
/// 1. An explicit path (from `--config`).
/// 2. `MCP_MANAGER_CONFIG`.
/// 3. `config.json` / `config.yaml` in the current directory.
/// 4. `<config dir>/mcp-manager/config.json`.
///
/// Returns `None` when no candidate exists.
pub fn find_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(expand_tilde(&path)));
        }
    }

    let cwd = std::env::current_dir().unwrap_or_default();
    let mut candidates = vec![cwd.join("config.json"), cwd.join("config.yaml")];
    if let Some(dir) = dirs::config_dir() {
        candidates.push(dir.join("mcp-manager").join("config.json"));
    }

    candidates.into_iter().find(|p| p.is_file())
}

/// Load, interpolate, parse, and validate a config file.
pub fn load_config(path: &Path) -> Result<GatewayConfig, McpError> {
    let raw = std::fs::read_to_string(path).map_err(|e| McpError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    let config = parse_config(&raw)?;

    let servers: Vec<&String> = config.mcp_servers.keys().collect();
    tracing::info!(
        path = %path.display(),
        servers = ?servers,
        "loaded gateway config"
    );

    Ok(config)
}

/// Parse config text (YAML or JSON).
pub fn parse_config(raw: &str) -> Result<GatewayConfig, McpError> {
    let interpolated = interpolate_env_vars(raw);

    let mut config: GatewayConfig =
        serde_yaml::from_str(&interpolated).map_err(|e| McpError::ConfigError {
            reason: format!("failed to parse config: {e}"),
        })?;

    config.prune_invalid_servers();
    Ok(config)
}

/// Find and load the config, falling back to an empty one when none exists.
pub fn load_or_default(explicit: Option<&Path>) -> Result<GatewayConfig, McpError> {
    let mut config = match find_config_path(explicit) {
        Some(path) => load_config(&path)?,
        None => {
            tracing::warn!("no config file found; starting with no upstream servers");
            GatewayConfig::default()
        }
    };
    config.apply_env_overrides();
    Ok(config)
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    if let Some(idx) = expr.find(":-") {
        let var_name = &expr[..idx];
        let default = &expr[idx + 2..];
        std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
    } else {
        std::env::var(expr).unwrap_or_default()
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

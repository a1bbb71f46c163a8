//! MCP client: JSON-RPC over stdio to the upstream servers.
//!
//! This module handles:
//! - Spawning and supervising MCP server child processes
//! - JSON-RPC 2.0 communication over process stdio
//! - Tool discovery, namespacing, and caching across all servers
//! - Tool call routing, including the built-in `launch_manager` tool
//!
//! The gateway front ends only ever talk to [`McpClient`].

pub mod client;
pub mod codec;
pub mod errors;
pub mod launcher;
pub mod lifecycle;
pub mod registry;
pub mod supervisor;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use client::McpClient;
pub use errors::McpError;
pub use launcher::{ChildLauncher, ProcessLauncher};
pub use registry::{ToolCatalog, META_TOOL_NAME};
pub use supervisor::{ServerStatus, Supervisor};
pub use types::{ServerDescriptor, ToolDescriptor};

//! Transport gateway: the front ends callers connect to.
//!
//! Every front end decodes its own framing and hands requests to the same
//! [`RpcHandler`], which in turn talks only to [`McpClient`]. Shutdown is an
//! explicit call on [`Gateway`]; nothing in here installs signal handlers.

pub mod handler;
pub mod http;
pub mod protocol;
pub mod sessions;
pub mod stdio;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::config::{GatewayConfig, ListenConfig};
use crate::mcp_client::{ChildLauncher, McpClient, ProcessLauncher};

pub use handler::RpcHandler;
pub use sessions::ConnectionRegistry;

/// Resolve once shutdown is requested or its sender is gone.
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await.map(|_| ());
}

// ─── Gateway ─────────────────────────────────────────────────────────────────

/// Owns the backend client and the front ends built on it.
pub struct Gateway {
    handler: RpcHandler,
    sessions: Arc<ConnectionRegistry>,
    listen: ListenConfig,
    shutdown_tx: watch::Sender<bool>,
}

impl Gateway {
    pub fn new(client: Arc<McpClient>, listen: ListenConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            handler: RpcHandler::new(client),
            sessions: Arc::new(ConnectionRegistry::new()),
            listen,
            shutdown_tx,
        }
    }

    /// Gateway over real child processes described by `config`.
    pub fn from_config(config: &GatewayConfig) -> Self {
        let launcher: Arc<dyn ChildLauncher> = Arc::new(ProcessLauncher::default());
        let client = Arc::new(McpClient::from_config(config, launcher));
        Self::new(client, config.gateway.clone())
    }

    pub fn client(&self) -> &Arc<McpClient> {
        self.handler.client()
    }

    pub fn sessions(&self) -> &Arc<ConnectionRegistry> {
        &self.sessions
    }

    pub fn listen_config(&self) -> &ListenConfig {
        &self.listen
    }

    /// The HTTP router (`/mcp`, `/sse`, `/ws`, introspection).
    pub fn router(&self) -> axum::Router {
        http::router(http::AppState {
            handler: self.handler.clone(),
            sessions: Arc::clone(&self.sessions),
            heartbeat: self.listen.heartbeat(),
            shutdown: self.shutdown_tx.subscribe(),
        })
    }

    /// Bind the configured address and serve HTTP until shutdown.
    ///
    /// A bind failure is the one error that should end the process.
    pub async fn serve_http(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind((self.listen.host.as_str(), self.listen.port)).await?;
        self.serve_on(listener).await
    }

    /// Serve HTTP on an already-bound listener until shutdown.
    pub async fn serve_on(&self, listener: TcpListener) -> std::io::Result<()> {
        let addr = listener.local_addr()?;
        tracing::info!(addr = %addr, "HTTP gateway listening");
        tracing::info!("  POST /mcp        JSON-RPC over HTTP");
        tracing::info!("  GET  /sse        Server-Sent Events (POST /sse/rpc for requests)");
        tracing::info!("  GET  /ws         WebSocket");

        let mut shutdown = self.shutdown_tx.subscribe();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { stopped(&mut shutdown).await })
            .await
    }

    /// Act as one MCP server on this process's stdin/stdout until input ends or shutdown.
    pub async fn serve_stdio(&self) -> std::io::Result<()> {
        stdio::serve_stdio(
            self.handler.clone(),
            tokio::io::stdin(),
            tokio::io::stdout(),
            self.shutdown_tx.subscribe(),
        )
        .await
    }

    /// Stop the front ends, then every child server.
    pub async fn shutdown(&self) {
        tracing::info!(connections = self.sessions.len(), "gateway shutting down");
        self.shutdown_tx.send_replace(true);
        self.client().shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::handler::tests::echo_client;
    use serde_json::{json, Value};
    use std::time::Duration;

    #[tokio::test]
    async fn test_shutdown_stops_http_and_children() {
        let (client, launcher) = echo_client(&["simple"]);
        let gateway = Arc::new(Gateway::new(client, ListenConfig::default()));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let serving = {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move { gateway.serve_on(listener).await })
        };

        let body: Value = reqwest::Client::new()
            .post(format!("http://{addr}/mcp"))
            .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["result"]["tools"][1]["name"], "simple_echo");
        assert_eq!(gateway.client().supervisor().running_servers(), vec!["simple"]);

        gateway.shutdown().await;
        tokio::time::timeout(Duration::from_secs(2), serving)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
        assert!(launcher.is_stopped("simple"));
    }
}

//! `mcp-manager`: aggregate stdio MCP servers behind one gateway.
//!
//! ```text
//! mcp-manager [--config PATH] stdio            # act as one MCP server on stdin/stdout
//! mcp-manager [--config PATH] serve [--port P] # HTTP /mcp, SSE, WebSocket
//! mcp-manager [--config PATH] tools            # print the aggregated tool catalog
//! ```

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use mcp_manager::{config, default_log_path, init_tracing, Gateway, LogOptions};

#[derive(Debug, Parser)]
#[command(name = "mcp-manager", version, about)]
struct Cli {
    /// Config file (YAML or JSON). Defaults to MCP_MANAGER_CONFIG or ./config.json.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `mcp_manager=trace`. Overrides RUST_LOG.
    #[arg(long, global = true, env = "MCP_MANAGER_LOG", value_name = "LEVEL")]
    log_level: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    /// Log to a file (rotated on startup) instead of stderr.
    #[arg(long, global = true, value_name = "PATH", num_args = 0..=1)]
    log_file: Option<Option<PathBuf>>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve MCP on stdin/stdout.
    Stdio,
    /// Serve the HTTP, SSE, and WebSocket front ends.
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print the aggregated tool catalog as JSON and exit.
    Tools,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(&LogOptions {
        level: cli.log_level.clone(),
        json: cli.log_json,
        file: cli
            .log_file
            .clone()
            .map(|path| path.unwrap_or_else(default_log_path)),
    })
    .context("failed to initialise logging")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    let result = runtime.block_on(run(cli));

    // A blocking stdin read would otherwise hold the process open.
    runtime.shutdown_timeout(Duration::from_secs(1));
    result
}

async fn run(cli: Cli) -> Result<()> {
    let mut config =
        config::load_or_default(cli.config.as_deref()).context("failed to load configuration")?;

    if let Command::Serve { host, port } = &cli.command {
        if let Some(host) = host {
            config.gateway.host = host.clone();
        }
        if let Some(port) = port {
            config.gateway.port = *port;
        }
    }

    tracing::info!(
        servers = config.enabled_servers().count(),
        "gateway configured"
    );
    let gateway = Arc::new(Gateway::from_config(&config));

    match cli.command {
        Command::Stdio => until_interrupted(&gateway, gateway.serve_stdio())
            .await
            .context("stdio front end failed"),
        Command::Serve { .. } => {
            let listen = gateway.listen_config();
            let addr = format!("{}:{}", listen.host, listen.port);
            until_interrupted(&gateway, gateway.serve_http())
                .await
                .with_context(|| format!("HTTP gateway on {addr} failed"))
        }
        Command::Tools => {
            let tools = gateway.client().list_tools().await;
            println!("{}", serde_json::to_string_pretty(&tools)?);
            gateway.shutdown().await;
            Ok(())
        }
    }
}

/// Drive a front end until it finishes or Ctrl-C arrives, then shut everything down.
async fn until_interrupted<F>(gateway: &Gateway, serving: F) -> std::io::Result<()>
where
    F: Future<Output = std::io::Result<()>>,
{
    tokio::pin!(serving);

    let result = tokio::select! {
        result = &mut serving => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received");
            gateway.shutdown().await;
            serving.await
        }
    };

    gateway.shutdown().await;
    result
}

//! The gateway acting as a single MCP server on its own stdin/stdout.
//!
//! One JSON-RPC message per line in each direction. Requests are handled
//! concurrently; responses are written by one writer task so lines never
//! interleave.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use super::handler::RpcHandler;
use super::protocol::RpcResponse;
use super::stopped;

/// Serve requests from `input` until it closes or `shutdown` flips to true.
///
/// Requests already in flight when input ends are still answered.
pub async fn serve_stdio<R, W>(
    handler: RpcHandler,
    input: R,
    output: W,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let (tx, rx) = mpsc::channel::<RpcResponse>(64);
    let writer = tokio::spawn(write_responses(output, rx));

    let mut lines = BufReader::new(input).lines();
    let mut in_flight = JoinSet::new();
    tracing::info!("stdio front end ready");

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = stopped(&mut shutdown) => {
                tracing::info!("stdio front end stopping");
                break;
            }
            Some(done) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = done {
                    tracing::error!(error = %e, "stdio request task failed");
                }
                continue;
            }
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read stdin");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let handler = handler.clone();
        let tx = tx.clone();
        in_flight.spawn(async move {
            if let Some(response) = handler.handle_text(&line).await {
                let _ = tx.send(response).await;
            }
        });
    }

    while let Some(done) = in_flight.join_next().await {
        if let Err(e) = done {
            tracing::error!(error = %e, "stdio request task failed");
        }
    }
    drop(tx);

    match writer.await {
        Ok(result) => result,
        Err(e) => Err(std::io::Error::other(e)),
    }
}

async fn write_responses<W>(mut output: W, mut rx: mpsc::Receiver<RpcResponse>) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(response) = rx.recv().await {
        let mut line = response.to_value().to_string();
        line.push('\n');
        output.write_all(line.as_bytes()).await?;
        output.flush().await?;
    }
    Ok(())
}

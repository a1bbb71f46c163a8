//! HTTP front ends: JSON-RPC over POST, SSE, WebSocket, and introspection.
//!
//! Routes:
//! - `POST /mcp`: one JSON-RPC request per body
//! - `GET /sse` + `POST /sse/rpc`: push channel with heartbeats, RPC over POST
//! - `GET /ws`: one JSON-RPC request per text frame, answered on the same socket
//! - `GET /transport/{stats,health,info}` and `GET /health`

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use futures::{SinkExt, Stream, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::handler::RpcHandler;
use super::protocol::{self, Envelope, RpcResponse};
use super::sessions::{ConnectionRegistry, SessionKind};
use super::stopped;
use crate::mcp_client::types::PROTOCOL_VERSION;

// ─── State ───────────────────────────────────────────────────────────────────

/// Shared state handed to every route.
#[derive(Clone)]
pub struct AppState {
    pub handler: RpcHandler,
    pub sessions: Arc<ConnectionRegistry>,
    /// Interval for SSE heartbeat events and WebSocket pings.
    pub heartbeat: Duration,
    pub shutdown: watch::Receiver<bool>,
}

/// Build the router with CORS and request tracing applied.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/mcp", post(http_rpc))
        .route("/sse", get(sse_connect))
        .route("/sse/rpc", post(sse_rpc))
        .route("/ws", get(ws_upgrade))
        .route("/transport/stats", get(transport_stats))
        .route("/transport/health", get(transport_health))
        .route("/transport/info", get(transport_info))
        .route("/health", get(health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

fn timestamp() -> String {
    Utc::now().to_rfc3339()
}

// ─── JSON-RPC over POST ──────────────────────────────────────────────────────

/// Status codes used when a body is rejected before dispatch.
#[derive(Clone, Copy)]
struct Rejection {
    parse: StatusCode,
    invalid: StatusCode,
}

/// POST /mcp
async fn http_rpc(State(state): State<AppState>, body: Bytes) -> Response {
    let rejection = Rejection {
        parse: StatusCode::BAD_REQUEST,
        invalid: StatusCode::BAD_REQUEST,
    };
    rpc_over_post(&state.handler, &body, rejection).await
}

/// POST /sse/rpc
///
/// Same envelope as `/mcp`, but an invalid envelope is still answered with 200.
async fn sse_rpc(State(state): State<AppState>, body: Bytes) -> Response {
    let rejection = Rejection {
        parse: StatusCode::BAD_REQUEST,
        invalid: StatusCode::OK,
    };
    rpc_over_post(&state.handler, &body, rejection).await
}

async fn rpc_over_post(handler: &RpcHandler, body: &[u8], rejection: Rejection) -> Response {
    let value: Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(error = %e, "unparseable request body");
            return (rejection.parse, Json(RpcResponse::parse_error())).into_response();
        }
    };

    match protocol::classify(value) {
        Envelope::Request(request) => Json(handler.handle(request).await).into_response(),
        Envelope::Invalid { id } => {
            (rejection.invalid, Json(RpcResponse::invalid_request(id))).into_response()
        }
        // Over HTTP every message needs an id to be answered.
        Envelope::Notification { .. } => (
            rejection.invalid,
            Json(RpcResponse::invalid_request(Value::Null)),
        )
            .into_response(),
    }
}

// ─── SSE ─────────────────────────────────────────────────────────────────────

/// GET /sse
async fn sse_connect(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let guard = state.sessions.register(SessionKind::Sse);
    let heartbeat = state.heartbeat;
    let mut shutdown = state.shutdown.clone();

    let stream = async_stream::stream! {
        // Dropped with the stream when the client goes away.
        let session = guard;

        let connected = json!({
            "type": "connected",
            "clientId": session.id(),
            "timestamp": timestamp(),
        });
        yield Ok(Event::default().data(connected.to_string()));

        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + heartbeat, heartbeat);
        loop {
            let stop = tokio::select! {
                _ = ticker.tick() => false,
                _ = stopped(&mut shutdown) => true,
            };
            if stop {
                tracing::debug!(client_id = %session.id(), "closing SSE stream for shutdown");
                break;
            }
            let beat = json!({ "type": "heartbeat", "timestamp": timestamp() });
            yield Ok(Event::default().data(beat.to_string()));
        }
    };

    Sse::new(stream)
}

// ─── WebSocket ───────────────────────────────────────────────────────────────

/// GET /ws
async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| ws_session(socket, state))
}

async fn ws_session(socket: WebSocket, state: AppState) {
    let session = state.sessions.register(SessionKind::WebSocket);
    let client_id = session.id().to_string();
    let (mut sink, mut frames) = socket.split();

    // One writer owns the sink; responses and pings are queued to it.
    let (tx, mut rx) = mpsc::channel::<Message>(64);
    let writer_id = client_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Err(e) = sink.send(message).await {
                tracing::debug!(client_id = %writer_id, error = %e, "websocket write failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    let connected = json!({
        "type": "connected",
        "clientId": client_id,
        "timestamp": timestamp(),
    });
    let _ = tx.send(Message::Text(connected.to_string())).await;

    let mut shutdown = state.shutdown.clone();
    let mut ticker =
        tokio::time::interval_at(tokio::time::Instant::now() + state.heartbeat, state.heartbeat);
    let mut in_flight = JoinSet::new();

    loop {
        tokio::select! {
            frame = frames.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::debug!(client_id = %client_id, error = %e, "websocket read failed");
                        break;
                    }
                };
                let handler = state.handler.clone();
                let tx = tx.clone();
                in_flight.spawn(async move {
                    let response = handler.handle_frame(&text).await;
                    let _ = tx.send(Message::Text(response.to_value().to_string())).await;
                });
            }
            _ = ticker.tick() => {
                if tx.send(Message::Ping(Vec::new())).await.is_err() {
                    tracing::debug!(client_id = %client_id, "ping failed; dropping session");
                    break;
                }
            }
            Some(done) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = done {
                    tracing::error!(client_id = %client_id, error = %e, "websocket request task failed");
                }
            }
            _ = stopped(&mut shutdown) => break,
        }
    }

    // Only the waiting callers are dropped; child requests finish on their own.
    in_flight.shutdown().await;
    drop(tx);
    let _ = writer.await;
    drop(session);
}

// ─── Introspection ───────────────────────────────────────────────────────────

/// GET /transport/stats
async fn transport_stats(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "success": true,
        "data": state.sessions.stats(),
        "timestamp": timestamp(),
    }))
}

/// GET /transport/health
async fn transport_health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "transports": {
            "sse": "available",
            "http_jsonrpc": "available",
            "websocket": "available",
        },
        "timestamp": timestamp(),
    }))
}

/// GET /transport/info
async fn transport_info(headers: HeaderMap) -> Json<Value> {
    let host = headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("localhost");
    let base = format!("http://{host}");

    Json(json!({
        "name": "MCP Manager Transport Layer",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "sse": {
                "url": format!("{base}/sse"),
                "description": "Server-Sent Events endpoint for real-time communication",
                "methods": ["GET"],
            },
            "sse_rpc": {
                "url": format!("{base}/sse/rpc"),
                "description": "JSON-RPC over SSE endpoint",
                "methods": ["POST"],
            },
            "http_jsonrpc": {
                "url": format!("{base}/mcp"),
                "description": "Standard HTTP JSON-RPC endpoint",
                "methods": ["POST"],
            },
            "websocket": {
                "url": format!("ws://{host}/ws"),
                "description": "WebSocket endpoint for bidirectional communication",
                "methods": ["WebSocket"],
            },
        },
        "capabilities": {
            "tools": true,
            "resources": false,
            "prompts": false,
        },
        "protocolVersion": PROTOCOL_VERSION,
    }))
}

/// GET /health
async fn health(State(state): State<AppState>) -> Json<Value> {
    let supervisor = state.handler.client().supervisor();
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "servers": {
            "configured": supervisor.enabled_servers().len(),
            "running": supervisor.running_servers().len(),
            "details": supervisor.statuses(),
        },
        "connections": state.sessions.len(),
        "timestamp": timestamp(),
    }))
}

// ─── Tests ───────────────────────────────────────────────────────────────────

//! WebSocket task channel
//!
//! Authenticated at the handshake (token match plus an optional Origin
//! allowlist), capped at 100 concurrent connections and 10 messages per
//! minute per connection. `{type: "task", payload}` runs through the same
//! submission pipeline as REST; results come back as
//! `{type: "result", payload}` via the registry's push channel. Errors are
//! pushed as `{type: "error", code, message}` with no internal detail.

use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::auth::{AuthContext, AuthMethod};
use crate::identity::ClientIdentity;
use crate::metrics;
use crate::task::TaskRequest;

use super::submit::submit_task;
use super::{client_ip, header_str, AppState, MAX_WS_CONNECTIONS};

/// Per-connection message budget per window
const WS_MESSAGES_PER_MINUTE: u32 = 10;
/// Inbound payload cap, bytes
const WS_MAX_PAYLOAD: usize = 1024 * 1024;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    token: Option<String>,
}

/// `GET /ws` - handshake-time authentication, then upgrade
pub async fn ws_upgrade(
    State(state): State<AppState>,
    connect: ConnectInfo<SocketAddr>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if state.ws_connections.load(Ordering::Relaxed) >= MAX_WS_CONNECTIONS {
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    }

    // Origin allowlist applies only when configured
    let allowed_origins = &state.config.server.ws_allowed_origins;
    if !allowed_origins.is_empty() {
        let origin = header_str(&headers, "origin").unwrap_or_default();
        if !allowed_origins.iter().any(|o| o == origin) {
            return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
        }
    }

    let auth = match state.config.ws_token() {
        Some(expected) => {
            let candidate = query
                .token
                .as_deref()
                .or_else(|| {
                    header_str(&headers, "authorization")
                        .and_then(|h| h.strip_prefix("Bearer "))
                        .map(str::trim)
                });
            let matched = candidate
                .map(|c| bool::from(expected.as_bytes().ct_eq(c.as_bytes())))
                .unwrap_or(false);
            if !matched {
                metrics::AUTH_FAILURES
                    .with_label_values(&["websocket"])
                    .inc();
                return (StatusCode::UNAUTHORIZED, "invalid token").into_response();
            }
            AuthContext {
                identity: ClientIdentity::paid("ws-client"),
                method: AuthMethod::StaticToken,
            }
        }
        // No token configured: connections are anonymous free-tier
        None => AuthContext {
            identity: ClientIdentity::anonymous(),
            method: AuthMethod::FreeTier,
        },
    };

    let ip = client_ip(&headers, &connect);
    ws.max_message_size(WS_MAX_PAYLOAD)
        .on_upgrade(move |socket| handle_socket(state, socket, auth, ip))
}

async fn handle_socket(state: AppState, mut socket: WebSocket, auth: AuthContext, ip: String) {
    state.ws_connections.fetch_add(1, Ordering::Relaxed);
    metrics::WS_CONNECTIONS.set(state.ws_connections.load(Ordering::Relaxed) as i64);
    info!(identity = %auth.identity.id, ip = %ip, "WebSocket connected");

    // One push channel per connection; the registry clones the sender per
    // task so results land here regardless of how many tasks are in flight.
    let (push_tx, mut push_rx) = mpsc::unbounded_channel();

    let mut window_start = Instant::now();
    let mut window_count: u32 = 0;

    loop {
        tokio::select! {
            pushed = push_rx.recv() => {
                // Senders never all drop while the connection lives (we hold
                // push_tx below), so this arm only fires with a result.
                if let Some(result) = pushed {
                    let frame = json!({"type": "result", "payload": result});
                    if send_json(&mut socket, &frame).await.is_err() {
                        break;
                    }
                }
            }
            incoming = socket.recv() => {
                let message = match incoming {
                    Some(Ok(message)) => message,
                    _ => break,
                };
                let text = match message {
                    Message::Text(text) => text,
                    Message::Close(_) => break,
                    // Pings are answered by axum; binary frames are ignored
                    _ => continue,
                };

                if window_start.elapsed() >= Duration::from_secs(60) {
                    window_start = Instant::now();
                    window_count = 0;
                }
                window_count += 1;
                if window_count > WS_MESSAGES_PER_MINUTE {
                    let _ = send_error(
                        &mut socket,
                        "RATE_LIMITED",
                        &format!("limit is {} messages per minute", WS_MESSAGES_PER_MINUTE),
                    )
                    .await;
                    continue;
                }

                if let Err(e) = handle_message(&state, &mut socket, &auth, &ip, &push_tx, text.as_str()).await {
                    debug!(error = %e, "WebSocket send failed, closing");
                    break;
                }
            }
        }
    }

    state.ws_connections.fetch_sub(1, Ordering::Relaxed);
    metrics::WS_CONNECTIONS.set(state.ws_connections.load(Ordering::Relaxed) as i64);
    info!(identity = %auth.identity.id, "WebSocket disconnected");
}

/// Handle one inbound frame. The returned error means the socket is dead;
/// protocol-level failures are pushed to the peer instead.
async fn handle_message(
    state: &AppState,
    socket: &mut WebSocket,
    auth: &AuthContext,
    ip: &str,
    push_tx: &mpsc::UnboundedSender<crate::task::TaskResult>,
    text: &str,
) -> Result<(), axum::Error> {
    let frame: Value = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(_) => return send_error(socket, "VALIDATION_ERROR", "frame is not valid JSON").await,
    };

    match frame["type"].as_str() {
        Some("task") => {
            let request: TaskRequest = match serde_json::from_value(frame["payload"].clone()) {
                Ok(request) => request,
                Err(_) => {
                    return send_error(socket, "VALIDATION_ERROR", "payload is not a valid task")
                        .await
                }
            };

            match submit_task(state, request, auth, ip, false, Some(push_tx.clone())).await {
                Ok(accepted) => {
                    let frame = json!({
                        "type": "accepted",
                        "taskId": accepted.task.task_id,
                    });
                    send_json(socket, &frame).await
                }
                Err(e) => {
                    warn!(error = %e, "WebSocket task rejected");
                    send_error(socket, e.code(), e.body()["error"]["message"].as_str().unwrap_or("error")).await
                }
            }
        }
        Some("ping") => send_json(socket, &json!({"type": "pong"})).await,
        _ => send_error(socket, "VALIDATION_ERROR", "unknown frame type").await,
    }
}

async fn send_json(socket: &mut WebSocket, value: &Value) -> Result<(), axum::Error> {
    socket.send(Message::Text(value.to_string().into())).await
}

async fn send_error(
    socket: &mut WebSocket,
    code: &str,
    message: &str,
) -> Result<(), axum::Error> {
    send_json(
        socket,
        &json!({"type": "error", "code": code, "message": message}),
    )
    .await
}

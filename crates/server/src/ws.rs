//! Coordinator listening side: WebSocket upgrade and per-connection
//! pump tasks.

use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use tower_http::trace::TraceLayer;

use crate::handler;
use crate::sockets::{Outbound, CLOSE_UNSUPPORTED_DATA};
use crate::state::AppState;

/// The coordinator's entire HTTP surface: the WebSocket endpoint and a
/// liveness probe.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Manage one connection after upgrade: register it, pump outbound
/// frames from the registry channel, feed inbound text frames to the
/// shared handler, clean up on disconnect.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (id, mut rx) = state.registry.add().await;
    tracing::info!(socket = id, "WebSocket connected");

    let (mut sink, mut stream) = socket.split();

    let mut send_task = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            let msg = match out {
                Outbound::Text(text) => Message::Text(text.into()),
                Outbound::Ping => Message::Ping(Bytes::new()),
                Outbound::Close(code) => {
                    let frame = code.map(|code| CloseFrame {
                        code,
                        reason: Utf8Bytes::from_static("unsupported data"),
                    });
                    let _ = sink.send(Message::Close(frame)).await;
                    break;
                }
            };
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Text(text)) => {
                handler::handle_text(&state, id, text.as_str()).await;
            }
            Ok(Message::Binary(_)) => {
                // The engraving protocol is text-only.
                tracing::warn!(socket = id, "Binary frame received; closing connection");
                state.registry.close(id, CLOSE_UNSUPPORTED_DATA).await;
                break;
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_) | Message::Pong(_)) => {}
            Err(e) => {
                tracing::debug!(socket = id, error = %e, "WebSocket receive error");
                break;
            }
        }
    }

    // Deregistering drops the channel sender; the pump drains whatever
    // is queued (including a pending Close) and exits.
    state.registry.remove(id).await;
    state.dispatcher.socket_closed(id).await;
    if tokio::time::timeout(Duration::from_secs(5), &mut send_task)
        .await
        .is_err()
    {
        send_task.abort();
    }
    tracing::info!(socket = id, "WebSocket disconnected");
}

//! Worker role: the outbound link to a coordinator.
//!
//! The dialed socket is registered in the same registry as any
//! accepted connection and serviced by the same handler, so from this
//! side the coordinator is just another request source and from the
//! coordinator's side this process is just another client. The link
//! reconnects forever on a fixed delay; renders in flight when the
//! link drops complete locally and their replies are dropped at the
//! registry lookup.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use stave_core::protocol;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Bytes, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::handler;
use crate::sockets::Outbound;
use crate::state::AppState;

/// Delay between reconnection attempts.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Keepalive ping cadence on the coordinator socket.
const PING_INTERVAL: Duration = Duration::from_secs(1);

/// Dial the coordinator and keep a session alive until cancelled.
/// Never gives up: a coordinator restart just costs a reconnect.
pub async fn run(state: AppState, url: String, max_jobs: usize, cancel: CancellationToken) {
    loop {
        tracing::info!(url = %url, "Connecting to coordinator");
        tokio::select! {
            _ = cancel.cancelled() => return,
            result = connect_async(url.as_str()) => match result {
                Ok((ws_stream, _response)) => {
                    tracing::info!("Coordinator connected");
                    run_session(&state, ws_stream, max_jobs, &cancel).await;
                    if cancel.is_cancelled() {
                        return;
                    }
                    tracing::warn!("Coordinator session ended; reconnecting");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Coordinator connection failed");
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
}

/// Drive one coordinator session: advertise capacity, then pump
/// outbound frames, the keepalive ping, and inbound traffic through
/// one `select!` loop.
async fn run_session(
    state: &AppState,
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    max_jobs: usize,
    cancel: &CancellationToken,
) {
    let (socket_id, mut rx) = state.registry.add().await;
    let (mut sink, mut stream) = ws_stream.split();

    let hello = protocol::request_frame(
        &Value::Null,
        "i_haz_computes",
        json!({ "max_jobs": max_jobs }),
    );
    if sink.send(Message::text(hello)).await.is_err() {
        tracing::error!("Failed to advertise capacity; dropping session");
        state.registry.remove(socket_id).await;
        return;
    }
    tracing::info!(socket = socket_id, max_jobs, "Advertised capacity to coordinator");

    let mut ping = tokio::time::interval(PING_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            _ = ping.tick() => {
                if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }

            out = rx.recv() => match out {
                Some(Outbound::Text(text)) => {
                    if sink.send(Message::text(text)).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Ping) => {
                    if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Close(_)) | None => break,
            },

            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    handler::handle_text(state, socket_id, text.as_str()).await;
                }
                Some(Ok(Message::Binary(_))) => {
                    tracing::warn!("Binary frame from coordinator; dropping session");
                    break;
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!(?frame, "Coordinator closed WebSocket");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::error!(error = %e, "WebSocket receive error");
                    break;
                }
                None => break,
            }
        }
    }

    state.registry.remove(socket_id).await;
    state.dispatcher.socket_closed(socket_id).await;
}

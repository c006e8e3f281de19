//! The shared JSON-RPC method router.
//!
//! Every socket, whether a browser client, a registered worker, or
//! the worker role's own link to its coordinator, is serviced by
//! [`handle_text`]. That symmetry is what keeps the protocol flat: a
//! worker's response frame arrives here like any other message and is
//! recognized by its id.

use serde_json::{json, Value};

use stave_core::protocol::{
    self, Frame, ERROR_GITHUB, ERROR_INVALID_VERSION, ERROR_JSON_PARSE,
};
use stave_core::types::{Backend, SocketId, Version};

use crate::dispatch::RenderRequest;
use crate::state::AppState;
use crate::status::StatusSnapshot;

/// Service one inbound text frame from `socket`.
pub async fn handle_text(state: &AppState, socket: SocketId, text: &str) {
    let frame = match Frame::parse(text) {
        Ok(frame) => frame,
        Err(e) => {
            let reply =
                protocol::error_frame(&Value::Null, ERROR_JSON_PARSE, &format!("Parse Error: {e}"));
            state.registry.send_text(socket, reply).await;
            return;
        }
    };

    if frame.method != "ping" {
        tracing::debug!(socket, id = %frame.id_key(), method = %frame.method, "Inbound frame");
    }

    // A frame whose id names a request held by a remote worker is that
    // worker's response. Checked before method dispatch.
    let key = frame.id_key();
    if !key.is_empty() && state.dispatcher.try_relay(key, text).await {
        return;
    }

    match frame.method.as_str() {
        "ping" => {
            let reply = protocol::result_frame(&frame.id, json!("pong"));
            state.registry.send_text(socket, reply).await;
        }

        "notifySaved" => {
            state.stats.record_save();
            let reply = protocol::result_frame(&frame.id, json!("ok"));
            state.registry.send_text(socket, reply).await;
        }

        "render" => handle_render(state, socket, &frame).await,

        "signIn" => handle_sign_in(state, socket, &frame).await,

        "signOut" => handle_sign_out(state, socket, &frame).await,

        "i_haz_computes" => {
            let max_jobs = frame
                .params
                .get("max_jobs")
                .and_then(Value::as_i64)
                .unwrap_or(0);
            state.dispatcher.register_worker(socket, max_jobs).await;
        }

        "get_status" => handle_status(state, socket, &frame).await,

        other => {
            tracing::debug!(socket, method = %other, "Unknown method");
        }
    }
}

async fn handle_render(state: &AppState, socket: SocketId, frame: &Frame) {
    state.stats.record_render();

    let src = frame.param_str("src");
    let backend = frame.param_str("backend").parse::<Backend>();
    let (src, backend) = match backend {
        Ok(backend) if !src.is_empty() => (src.to_string(), backend),
        _ => {
            state
                .registry
                .send_text(socket, protocol::invalid_request_frame())
                .await;
            return;
        }
    };

    let version = match frame.params.get("version") {
        None => Version::default(),
        Some(value) => match value.as_str().unwrap_or_default().parse::<Version>() {
            Ok(version) => version,
            Err(()) => {
                let reply =
                    protocol::error_frame(&frame.id, ERROR_INVALID_VERSION, "Invalid version");
                state.registry.send_text(socket, reply).await;
                return;
            }
        },
    };

    if !state.dispatcher.can_serve(version).await {
        let reply = protocol::error_frame(&frame.id, ERROR_INVALID_VERSION, "Invalid version");
        state.registry.send_text(socket, reply).await;
        return;
    }

    state
        .dispatcher
        .enqueue(RenderRequest {
            src,
            backend,
            version,
            origin: socket,
            request_id: frame.id_key().to_string(),
        })
        .await;
}

async fn handle_sign_in(state: &AppState, socket: SocketId, frame: &Frame) {
    let Some(identity) = state.identity.clone() else {
        let reply = protocol::error_frame(&frame.id, ERROR_GITHUB, "GitHub integration disabled");
        state.registry.send_text(socket, reply).await;
        return;
    };

    let request_id = frame.id_key().to_string();
    let oauth_state = frame.param_str("state").to_string();
    let code = frame.param_str("oauth").to_string();
    tokio::spawn(async move {
        identity.sign_in(socket, request_id, oauth_state, code).await;
    });
}

async fn handle_sign_out(state: &AppState, socket: SocketId, frame: &Frame) {
    let token = frame.param_str("token").to_string();
    if token.is_empty() {
        state
            .registry
            .send_text(socket, protocol::invalid_request_frame())
            .await;
        return;
    }

    let Some(identity) = state.identity.clone() else {
        let reply = protocol::error_frame(&frame.id, ERROR_GITHUB, "GitHub integration disabled");
        state.registry.send_text(socket, reply).await;
        return;
    };

    let request_id = frame.id_key().to_string();
    tokio::spawn(async move {
        identity.sign_out(socket, request_id, token).await;
    });
}

async fn handle_status(state: &AppState, socket: SocketId, frame: &Frame) {
    let dispatch = state.dispatcher.snapshot().await;
    let active = state.registry.connection_count().await;
    let snapshot = StatusSnapshot::build(
        dispatch,
        active,
        state.stats.started_at,
        state.stats.renders(),
        state.stats.saves(),
        state.stats.sign_ins(),
    );
    let result =
        serde_json::to_value(&snapshot).expect("StatusSnapshot is always serialisable");
    let reply = protocol::result_frame(&frame.id, result);
    state.registry.send_text(socket, reply).await;
}

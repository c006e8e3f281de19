//! Shared fixtures for the server integration tests.
//!
//! Connections are simulated through the socket registry directly:
//! registering returns the outbound channel a real WebSocket pump
//! would drain, so tests read exactly the frames a peer would see.

// Not every test binary uses every helper, so we suppress dead_code
// warnings at the module level.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use stave_renderer::{RendererConfig, RendererPool, SlotEvent};
use stave_server::dispatch::Dispatcher;
use stave_server::sockets::{Outbound, SocketRegistry};
use stave_server::state::{AppState, Stats};
use tokio::sync::mpsc;

/// App state with no local slots: everything must go to workers.
pub fn coordinator_without_slots() -> AppState {
    with_pool(|events| {
        RendererPool::start(
            &RendererConfig {
                stable_tag: "engraver:stable".into(),
                unstable_tag: None,
                jobs: 0,
                render_timeout: Duration::from_secs(5),
            },
            events,
        )
    })
}

/// App state whose renderer pool is built by `build`, with the slot
/// event pump running.
pub fn with_pool<F>(build: F) -> AppState
where
    F: FnOnce(mpsc::UnboundedSender<SlotEvent>) -> RendererPool,
{
    let registry = Arc::new(SocketRegistry::new());
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let pool = build(events_tx);
    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&registry), pool));

    let pump = Arc::clone(&dispatcher);
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            pump.on_slot_event(event).await;
        }
    });

    AppState {
        registry,
        dispatcher,
        identity: None,
        stats: Arc::new(Stats::new()),
    }
}

/// Next text frame on a simulated connection, parsed as JSON. Pings
/// are skipped.
pub async fn recv_frame(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Value {
    loop {
        let out = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection channel closed");
        match out {
            Outbound::Text(text) => {
                return serde_json::from_str(&text).expect("outbound frame is JSON")
            }
            Outbound::Ping => continue,
            Outbound::Close(code) => panic!("unexpected close frame: {code:?}"),
        }
    }
}

/// Assert no text frame arrives within a short grace period.
pub async fn assert_silent(rx: &mut mpsc::UnboundedReceiver<Outbound>) {
    tokio::time::sleep(Duration::from_millis(100)).await;
    match rx.try_recv() {
        Ok(Outbound::Text(text)) => panic!("unexpected frame: {text}"),
        _ => {}
    }
}

pub fn render_frame(id: &str, src: &str, backend: &str, version: Option<&str>) -> String {
    let mut params = json!({ "src": src, "backend": backend });
    if let Some(v) = version {
        params["version"] = json!(v);
    }
    json!({ "jsonrpc": "2.0", "id": id, "method": "render", "params": params }).to_string()
}

pub fn register_worker_frame(max_jobs: i64) -> String {
    json!({
        "jsonrpc": "2.0",
        "id": null,
        "method": "i_haz_computes",
        "params": { "max_jobs": max_jobs },
    })
    .to_string()
}

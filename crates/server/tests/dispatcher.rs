//! Dispatcher integration tests: worker dispatch, relay, failure
//! recovery, and status arithmetic, driven through the shared message
//! handler with simulated connections.

mod common;

use std::process::Stdio;
use std::time::Duration;

use serde_json::json;
use stave_core::types::Version;
use stave_renderer::slot::CommandFactory;
use stave_renderer::RendererPool;
use stave_server::handler::handle_text;
use tokio::process::Command;

use common::{
    assert_silent, coordinator_without_slots, recv_frame, register_worker_frame, render_frame,
    with_pool,
};

fn shell_slot(script: &'static str) -> CommandFactory {
    Box::new(move || {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    })
}

// ---------------------------------------------------------------------------
// Remote dispatch
// ---------------------------------------------------------------------------

#[tokio::test]
async fn two_renders_fan_out_to_worker_and_replies_relay_in_any_order() {
    let state = coordinator_without_slots();
    let (client, mut client_rx) = state.registry.add().await;
    let (worker, mut worker_rx) = state.registry.add().await;

    handle_text(&state, worker, &register_worker_frame(2)).await;

    handle_text(&state, client, &render_frame("x", "{ c4 }", "svg", None)).await;
    handle_text(&state, client, &render_frame("y", "{ d4 }", "svg", None)).await;

    let first = recv_frame(&mut worker_rx).await;
    let second = recv_frame(&mut worker_rx).await;
    assert_eq!(first["method"], "render");
    assert_eq!(first["id"], "x");
    assert_eq!(first["params"]["src"], "{ c4 }");
    assert_eq!(second["id"], "y");

    // The worker answers in reverse order; each reply is relayed
    // verbatim to the client with its id preserved.
    let reply_y = json!({ "jsonrpc": "2.0", "id": "y", "result": { "files": 2 } }).to_string();
    let reply_x = json!({ "jsonrpc": "2.0", "id": "x", "result": { "files": 1 } }).to_string();
    handle_text(&state, worker, &reply_y).await;
    handle_text(&state, worker, &reply_x).await;

    let got_y = recv_frame(&mut client_rx).await;
    assert_eq!(got_y["id"], "y");
    assert_eq!(got_y["result"]["files"], 2);
    let got_x = recv_frame(&mut client_rx).await;
    assert_eq!(got_x["id"], "x");
    assert_eq!(got_x["result"]["files"], 1);
}

#[tokio::test]
async fn relay_returns_worker_capacity_to_the_pool() {
    let state = coordinator_without_slots();
    let (client, mut client_rx) = state.registry.add().await;
    let (worker, mut worker_rx) = state.registry.add().await;

    handle_text(&state, worker, &register_worker_frame(2)).await;

    // Saturate both capacity entries, queue a third render.
    for id in ["a", "b", "c"] {
        handle_text(&state, client, &render_frame(id, "{ c4 }", "pdf", None)).await;
    }
    assert_eq!(recv_frame(&mut worker_rx).await["id"], "a");
    assert_eq!(recv_frame(&mut worker_rx).await["id"], "b");

    let snapshot = state.dispatcher.snapshot().await;
    assert_eq!(snapshot.backlog, 1);
    assert_eq!(snapshot.free_worker_entries, 0);

    // Answering "a" frees a capacity entry and the queued render moves.
    let reply = json!({ "jsonrpc": "2.0", "id": "a", "result": {} }).to_string();
    handle_text(&state, worker, &reply).await;
    assert_eq!(recv_frame(&mut client_rx).await["id"], "a");
    assert_eq!(recv_frame(&mut worker_rx).await["id"], "c");

    let snapshot = state.dispatcher.snapshot().await;
    assert_eq!(snapshot.backlog, 0);
    assert_eq!(snapshot.busy_worker_entries, 2);
}

#[tokio::test]
async fn worker_death_fails_requests_it_was_holding() {
    let state = coordinator_without_slots();
    let (client, mut client_rx) = state.registry.add().await;
    let (worker, mut worker_rx) = state.registry.add().await;

    handle_text(&state, worker, &register_worker_frame(2)).await;
    handle_text(&state, client, &render_frame("p", "{ c4 }", "svg", None)).await;
    assert_eq!(recv_frame(&mut worker_rx).await["id"], "p");

    // The worker socket drops.
    state.registry.remove(worker).await;
    state.dispatcher.socket_closed(worker).await;

    let error = recv_frame(&mut client_rx).await;
    assert_eq!(error["id"], "p");
    assert_eq!(error["error"]["code"], 2);
    assert_eq!(error["error"]["message"], "Worker died");

    let snapshot = state.dispatcher.snapshot().await;
    assert_eq!(snapshot.free_worker_entries, 0);
    assert_eq!(snapshot.busy_worker_entries, 0);
}

#[tokio::test]
async fn worker_death_reevaluates_waiting_requests() {
    let state = coordinator_without_slots();
    let (client, mut client_rx) = state.registry.add().await;
    let (worker, mut worker_rx) = state.registry.add().await;

    handle_text(&state, worker, &register_worker_frame(2)).await;
    handle_text(&state, client, &render_frame("a", "{ c4 }", "svg", None)).await;
    handle_text(&state, client, &render_frame("b", "{ d4 }", "svg", None)).await;
    // Both capacity entries busy; "c" waits in the queue.
    handle_text(
        &state,
        client,
        &render_frame("c", "{ e4 }", "svg", Some("unstable")),
    )
    .await;
    assert_eq!(recv_frame(&mut worker_rx).await["id"], "a");
    assert_eq!(recv_frame(&mut worker_rx).await["id"], "b");
    assert_eq!(state.dispatcher.snapshot().await.backlog, 1);

    state.registry.remove(worker).await;
    state.dispatcher.socket_closed(worker).await;

    // "a" and "b" fail with the worker; "c" is then unserviceable by
    // anything and is rejected instead of waiting forever.
    let mut errors = Vec::new();
    for _ in 0..3 {
        errors.push(recv_frame(&mut client_rx).await);
    }
    let worker_died = errors
        .iter()
        .filter(|e| e["error"]["message"] == "Worker died")
        .count();
    assert_eq!(worker_died, 2);
    let invalid_version = errors
        .iter()
        .find(|e| e["error"]["message"] == "Invalid version")
        .expect("queued render should be rejected after the worker dies");
    assert_eq!(invalid_version["id"], "c");
    assert_eq!(invalid_version["error"]["code"], 3);
}

#[tokio::test]
async fn duplicate_request_id_is_rejected_at_dispatch() {
    // Two slow slots: the duplicate meets an idle slot while the
    // original is still in flight, which is exactly when the
    // collision check must fire.
    let slow = "while read line; do sleep 0.3; printf '{}\\n'; done";
    let state = with_pool(|events| {
        RendererPool::start_with(
            vec![
                (Version::Stable, shell_slot(slow)),
                (Version::Stable, shell_slot(slow)),
            ],
            Duration::from_secs(5),
            events,
        )
    });
    let (client, mut client_rx) = state.registry.add().await;

    handle_text(&state, client, &render_frame("x", "{ c4 }", "svg", None)).await;
    handle_text(&state, client, &render_frame("x", "{ d4 }", "svg", None)).await;

    let error = recv_frame(&mut client_rx).await;
    assert_eq!(error["id"], "x");
    assert_eq!(error["error"]["code"], 2);
    assert_eq!(error["error"]["message"], "Duplicate request id");

    // The original "x" still completes normally.
    let reply = recv_frame(&mut client_rx).await;
    assert_eq!(reply["id"], "x");
    assert!(reply.get("result").is_some());
}

// ---------------------------------------------------------------------------
// Version handling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unserviceable_version_is_rejected_immediately() {
    let state = coordinator_without_slots();
    let (client, mut client_rx) = state.registry.add().await;

    handle_text(
        &state,
        client,
        &render_frame("u", "{ c4 }", "svg", Some("unstable")),
    )
    .await;

    let error = recv_frame(&mut client_rx).await;
    assert_eq!(error["id"], "u");
    assert_eq!(error["error"]["code"], 3);
    assert_eq!(error["error"]["message"], "Invalid version");
}

#[tokio::test]
async fn unknown_version_string_is_rejected() {
    let state = coordinator_without_slots();
    let (client, mut client_rx) = state.registry.add().await;

    handle_text(
        &state,
        client,
        &render_frame("v", "{ c4 }", "svg", Some("nightly")),
    )
    .await;

    let error = recv_frame(&mut client_rx).await;
    assert_eq!(error["error"]["code"], 3);
    assert_eq!(error["error"]["message"], "Invalid version");
}

// ---------------------------------------------------------------------------
// Local dispatch
// ---------------------------------------------------------------------------

#[tokio::test]
async fn local_slot_renders_and_result_carries_the_request_id() {
    // `cat` echoes the request line; the dispatcher parses it back as
    // the engraver result object.
    let state = with_pool(|events| {
        RendererPool::start_with(
            vec![(Version::Stable, shell_slot("cat"))],
            Duration::from_secs(5),
            events,
        )
    });
    let (client, mut client_rx) = state.registry.add().await;

    handle_text(&state, client, &render_frame("a", "{ c4 }", "svg", None)).await;

    let reply = recv_frame(&mut client_rx).await;
    assert_eq!(reply["id"], "a");
    assert_eq!(reply["result"]["backend"], "svg");
    let src = reply["result"]["src"].as_str().unwrap();
    assert!(src.starts_with("#(ly:set-option 'backend 'svg)"));
    assert!(src.contains("{ c4 }"));

    let snapshot = state.dispatcher.snapshot().await;
    assert_eq!(snapshot.busy_local_slots, 0);
    assert_eq!(snapshot.backlog, 0);
}

#[tokio::test]
async fn disconnected_origin_gets_no_reply_and_slot_recovers() {
    let state = with_pool(|events| {
        RendererPool::start_with(
            vec![(
                Version::Stable,
                shell_slot("while read line; do sleep 0.3; printf '{}\\n'; done"),
            )],
            Duration::from_secs(5),
            events,
        )
    });
    let (client, mut client_rx) = state.registry.add().await;

    handle_text(&state, client, &render_frame("q", "{ c4 }", "svg", None)).await;

    // Drop the client while the render is in flight.
    state.registry.remove(client).await;
    state.dispatcher.socket_closed(client).await;

    // The child's line is read and dropped; the slot goes back to
    // idle.
    tokio::time::sleep(Duration::from_millis(700)).await;
    let snapshot = state.dispatcher.snapshot().await;
    assert_eq!(snapshot.busy_local_slots, 0);

    // Nothing was ever sent to the dead connection.
    while let Ok(out) = client_rx.try_recv() {
        assert!(
            !matches!(out, stave_server::sockets::Outbound::Text(_)),
            "reply sent to a disconnected client",
        );
    }
}

#[tokio::test]
async fn crashed_child_fails_the_render_and_the_slot_respawns() {
    let state = with_pool(|events| {
        RendererPool::start_with(
            vec![(Version::Stable, shell_slot("read line; exit 1"))],
            Duration::from_secs(5),
            events,
        )
    });
    let (client, mut client_rx) = state.registry.add().await;

    handle_text(&state, client, &render_frame("r", "{ c4 }", "svg", None)).await;

    let error = recv_frame(&mut client_rx).await;
    assert_eq!(error["id"], "r");
    assert_eq!(error["error"]["code"], 2);
    assert!(error["error"]["message"]
        .as_str()
        .unwrap()
        .starts_with("Internal error"));

    // After the respawn pause the slot serves again. `exit 1` children
    // keep dying, so only check it returns to a dispatchable state.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let snapshot = state.dispatcher.snapshot().await;
    assert_eq!(snapshot.local_slots, 1);
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[tokio::test]
async fn status_counts_workers_and_backlog() {
    let state = coordinator_without_slots();
    let (client, mut client_rx) = state.registry.add().await;
    let (worker, mut worker_rx) = state.registry.add().await;

    handle_text(&state, worker, &register_worker_frame(2)).await;
    handle_text(&state, client, &render_frame("x", "{ c4 }", "svg", None)).await;
    assert_eq!(recv_frame(&mut worker_rx).await["id"], "x");

    handle_text(
        &state,
        client,
        &json!({ "jsonrpc": "2.0", "id": "s", "method": "get_status" }).to_string(),
    )
    .await;

    let reply = recv_frame(&mut client_rx).await;
    assert_eq!(reply["id"], "s");
    let status = &reply["result"];
    assert_eq!(status["alive"], true);
    assert_eq!(status["backlog"], 0);
    assert_eq!(status["busy_worker_count"], 1);
    assert_eq!(status["free_worker_count"], 1);
    assert_eq!(status["remote_worker_count"], 2);
    assert_eq!(status["local_worker_count"], 0);
    assert_eq!(status["current_active_users"], 2);
    assert_eq!(status["analytics_renders"], 1);
}

#[tokio::test]
async fn undersized_worker_advertisement_is_ignored() {
    let state = coordinator_without_slots();
    let (client, mut client_rx) = state.registry.add().await;
    let (worker, mut worker_rx) = state.registry.add().await;

    handle_text(&state, worker, &register_worker_frame(1)).await;

    // With the advertisement ignored there is no capacity at all, so a
    // render is rejected as unserviceable.
    handle_text(&state, client, &render_frame("n", "{ c4 }", "svg", None)).await;
    let error = recv_frame(&mut client_rx).await;
    assert_eq!(error["error"]["code"], 3);

    assert_silent(&mut worker_rx).await;
}

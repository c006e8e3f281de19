//! Socket registry: the single source of truth for "is this peer
//! still connected?".
//!
//! Every accepted or dialed WebSocket is registered here under a fresh
//! monotonic id and owns an unbounded outbound channel. All reply
//! paths go through [`SocketRegistry::send_text`], which re-looks the
//! id up, so a connection that has gone away silently swallows the
//! frame instead of producing a dangling write.
//!
//! Outbound frames are transport-neutral ([`Outbound`]) because the
//! same registry serves axum sockets on the listening side and a
//! tungstenite socket on the worker's coordinator link.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use stave_core::types::SocketId;
use tokio::sync::{mpsc, RwLock};

/// WebSocket close code for a binary frame on the text-only protocol.
pub const CLOSE_UNSUPPORTED_DATA: u16 = 1003;

/// A frame queued for a connection's sender pump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Ping,
    /// Close the connection, optionally with a close code. The pump
    /// stops after sending this.
    Close(Option<u16>),
}

/// Channel sender half for pushing frames to one connection.
pub type SocketSender = mpsc::UnboundedSender<Outbound>;

/// Manages all active connections, client and worker alike.
///
/// Thread-safe via interior `RwLock`; wrapped in `Arc` and shared
/// across the application.
pub struct SocketRegistry {
    next_id: AtomicU64,
    connections: RwLock<HashMap<SocketId, SocketSender>>,
}

impl SocketRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Register a new connection under a fresh id.
    ///
    /// Returns the id and the receiver half the caller forwards to its
    /// WebSocket sink.
    pub async fn add(&self) -> (SocketId, mpsc::UnboundedReceiver<Outbound>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections.write().await.insert(id, tx);
        (id, rx)
    }

    /// Remove a connection. Unknown ids are a no-op.
    pub async fn remove(&self, id: SocketId) {
        self.connections.write().await.remove(&id);
    }

    /// Whether `id` is still registered.
    pub async fn contains(&self, id: SocketId) -> bool {
        self.connections.read().await.contains_key(&id)
    }

    /// Send a text frame to `id` if it is still registered.
    ///
    /// Returns `false` when the connection is gone (either unknown or
    /// its pump has stopped); the frame is dropped silently.
    pub async fn send_text(&self, id: SocketId, text: String) -> bool {
        match self.connections.read().await.get(&id) {
            Some(tx) => tx.send(Outbound::Text(text)).is_ok(),
            None => false,
        }
    }

    /// Ask a connection's pump to close the socket.
    pub async fn close(&self, id: SocketId, code: u16) {
        if let Some(tx) = self.connections.read().await.get(&id) {
            let _ = tx.send(Outbound::Close(Some(code)));
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Queue a Ping for every connection.
    ///
    /// Used by the heartbeat task to keep connections alive and detect
    /// stale ones.
    pub async fn ping_all(&self) {
        let conns = self.connections.read().await;
        for tx in conns.values() {
            let _ = tx.send(Outbound::Ping);
        }
    }

    /// Queue a Close for every connection, then clear the map.
    ///
    /// Used during graceful shutdown, after the listener has stopped
    /// accepting.
    pub async fn shutdown_all(&self) {
        let mut conns = self.connections.write().await;
        let count = conns.len();
        for tx in conns.values() {
            let _ = tx.send(Outbound::Close(None));
        }
        conns.clear();
        tracing::info!(count, "Closed all WebSocket connections");
    }
}

impl Default for SocketRegistry {
    fn default() -> Self {
        Self::new()
    }
}

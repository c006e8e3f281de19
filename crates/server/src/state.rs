//! Shared application state, cloned into every connection task.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::dispatch::Dispatcher;
use crate::identity::IdentityRelay;
use crate::sockets::SocketRegistry;

/// Monotonic service counters reported by `get_status`.
pub struct Stats {
    pub started_at: DateTime<Utc>,
    renders: AtomicU64,
    saves: AtomicU64,
    sign_ins: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            renders: AtomicU64::new(0),
            saves: AtomicU64::new(0),
            sign_ins: AtomicU64::new(0),
        }
    }

    pub fn record_render(&self) {
        self.renders.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_save(&self) {
        self.saves.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sign_in(&self) {
        self.sign_ins.fetch_add(1, Ordering::Relaxed);
    }

    pub fn renders(&self) -> u64 {
        self.renders.load(Ordering::Relaxed)
    }

    pub fn saves(&self) -> u64 {
        self.saves.load(Ordering::Relaxed)
    }

    pub fn sign_ins(&self) -> u64 {
        self.sign_ins.load(Ordering::Relaxed)
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a connection task needs, behind cheap `Arc` clones.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SocketRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    /// Present only on a coordinator configured with GitHub
    /// credentials.
    pub identity: Option<Arc<IdentityRelay>>,
    pub stats: Arc<Stats>,
}

//! Live status snapshot served by `get_status`.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::dispatch::DispatchSnapshot;

/// Wire shape of the `get_status` result. Field names are part of the
/// public protocol.
#[derive(Debug, Serialize)]
pub struct StatusSnapshot {
    pub alive: bool,
    pub total_worker_count: usize,
    pub local_worker_count: usize,
    pub remote_worker_count: usize,
    pub busy_worker_count: usize,
    pub free_worker_count: usize,
    pub backlog: usize,
    pub startup_time: String,
    pub uptime_secs: i64,
    pub current_active_users: usize,
    pub analytics_renders: u64,
    pub analytics_saves: u64,
    pub analytics_sign_in: u64,
}

impl StatusSnapshot {
    /// Combine dispatcher counts with connection and analytics
    /// counters.
    ///
    /// Slots that are busy, starting, or dead all count as busy local
    /// capacity: none of them can take a job right now.
    pub fn build(
        dispatch: DispatchSnapshot,
        active_connections: usize,
        started_at: DateTime<Utc>,
        renders: u64,
        saves: u64,
        sign_ins: u64,
    ) -> Self {
        let remote = dispatch.free_worker_entries + dispatch.busy_worker_entries;
        let total = remote + dispatch.local_slots;
        Self {
            alive: total > 0,
            total_worker_count: total,
            local_worker_count: dispatch.local_slots,
            remote_worker_count: remote,
            busy_worker_count: dispatch.busy_worker_entries + dispatch.busy_local_slots,
            free_worker_count: dispatch.free_worker_entries
                + (dispatch.local_slots - dispatch.busy_local_slots),
            backlog: dispatch.backlog,
            startup_time: started_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            uptime_secs: (Utc::now() - started_at).num_seconds(),
            current_active_users: active_connections,
            analytics_renders: renders,
            analytics_saves: saves,
            analytics_sign_in: sign_ins,
        }
    }
}

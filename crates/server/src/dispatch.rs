//! Request queue and two-tier dispatcher.
//!
//! All dispatch bookkeeping lives in one [`DispatchState`] behind a
//! single mutex: the FIFO queue, the free/busy worker lists, the slot
//! table, and the in-flight maps. Every mutation path (enqueue,
//! worker registration, worker response relay, slot events, socket
//! teardown) funnels through that lock, so the ownership invariants
//! (a request id is in at most one place; a slot holds at most one
//! request) hold at every observable point.
//!
//! Dispatch preference order: a free remote worker first, then the
//! lowest-indexed idle local slot on the request's release channel.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde_json::{json, Value};
use stave_core::protocol::{self, ERROR_INTERNAL, ERROR_INVALID_VERSION};
use stave_core::source;
use stave_core::types::{Backend, RequestId, SocketId, Version};
use stave_renderer::{RenderJob, RendererPool, SlotEvent};
use tokio::sync::Mutex;

use crate::sockets::SocketRegistry;

/// One render in the system, from enqueue until its reply (or its
/// origin's death).
#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub src: String,
    pub backend: Backend,
    pub version: Version,
    pub origin: SocketId,
    pub request_id: RequestId,
}

/// Lifecycle of one local renderer slot, as the dispatcher sees it.
#[derive(Debug)]
pub enum SlotState {
    /// Child not yet up (initial spawn).
    Starting,
    Idle,
    Busy(RenderRequest),
    /// Child down; the supervisor is respawning it.
    Dead,
}

struct DispatchState {
    queue: VecDeque<RenderRequest>,
    /// One entry per advertised unit of capacity; a worker with
    /// capacity N appears N times.
    free_workers: VecDeque<SocketId>,
    /// Request id -> worker socket currently rendering it.
    busy_workers: HashMap<RequestId, SocketId>,
    /// Request id -> the request dispatched to a remote worker.
    in_flight_remote: HashMap<RequestId, RenderRequest>,
    /// Request id -> local slot index. The slot's `Busy` state owns
    /// the request itself.
    in_flight_local: HashMap<RequestId, usize>,
    slots: Vec<SlotState>,
}

/// Counts for the status snapshot, taken under the dispatch lock.
#[derive(Debug, Clone, Copy)]
pub struct DispatchSnapshot {
    pub backlog: usize,
    pub free_worker_entries: usize,
    pub busy_worker_entries: usize,
    pub local_slots: usize,
    /// Slots that cannot take a job right now: busy, starting, or
    /// dead.
    pub busy_local_slots: usize,
}

pub struct Dispatcher {
    registry: Arc<SocketRegistry>,
    pool: RendererPool,
    state: Mutex<DispatchState>,
}

impl Dispatcher {
    pub fn new(registry: Arc<SocketRegistry>, pool: RendererPool) -> Self {
        let slots = (0..pool.slot_count()).map(|_| SlotState::Starting).collect();
        Self {
            registry,
            pool,
            state: Mutex::new(DispatchState {
                queue: VecDeque::new(),
                free_workers: VecDeque::new(),
                busy_workers: HashMap::new(),
                in_flight_remote: HashMap::new(),
                in_flight_local: HashMap::new(),
                slots,
            }),
        }
    }

    pub fn pool(&self) -> &RendererPool {
        &self.pool
    }

    /// Whether a render pinned to `version` could currently be served
    /// at all: a local slot on that channel, or any registered worker
    /// (workers advertise capacity, not channels).
    pub async fn can_serve(&self, version: Version) -> bool {
        if self.pool.supports(version) {
            return true;
        }
        let state = self.state.lock().await;
        !state.free_workers.is_empty() || !state.busy_workers.is_empty()
    }

    /// Append a validated request and immediately try to place work.
    pub async fn enqueue(&self, request: RenderRequest) {
        {
            let mut state = self.state.lock().await;
            state.queue.push_back(request);
        }
        self.try_dispatch().await;
    }

    /// Place as many queued requests as capacity allows. Reentrant-safe
    /// and never blocks on I/O: all sends go through unbounded
    /// channels.
    pub async fn try_dispatch(&self) {
        let mut state = self.state.lock().await;
        'dispatch: loop {
            if state.queue.is_empty() {
                return;
            }

            // Prefer a remote worker.
            while let Some(worker) = state.free_workers.pop_front() {
                if !self.registry.contains(worker).await {
                    tracing::debug!(socket = worker, "Discarding stale free-worker entry");
                    continue;
                }
                let Some(request) = state.queue.pop_front() else {
                    state.free_workers.push_front(worker);
                    return;
                };
                if Self::in_flight(&state, &request.request_id) {
                    state.free_workers.push_front(worker);
                    self.reject_duplicate(&request).await;
                    continue 'dispatch;
                }
                let frame = protocol::request_frame(
                    &Value::String(request.request_id.clone()),
                    "render",
                    json!({
                        "src": request.src,
                        "backend": request.backend,
                        "version": request.version,
                    }),
                );
                if !self.registry.send_text(worker, frame).await {
                    tracing::warn!(socket = worker, "Worker vanished at dispatch; requeueing");
                    state.queue.push_front(request);
                    continue;
                }
                tracing::debug!(
                    socket = worker,
                    request_id = %request.request_id,
                    "Dispatched to remote worker",
                );
                state.busy_workers.insert(request.request_id.clone(), worker);
                state
                    .in_flight_remote
                    .insert(request.request_id.clone(), request);
                continue 'dispatch;
            }

            // No remote capacity. Check the head's channel is served by
            // anything before letting it wait.
            let head_version = match state.queue.front() {
                Some(request) => request.version,
                None => return,
            };
            if !self.pool.supports(head_version) && state.busy_workers.is_empty() {
                let Some(request) = state.queue.pop_front() else {
                    return;
                };
                tracing::info!(
                    request_id = %request.request_id,
                    version = %request.version,
                    "No slot or worker serves the requested version",
                );
                self.respond_error(&request, ERROR_INVALID_VERSION, "Invalid version")
                    .await;
                continue;
            }

            // Lowest-indexed idle slot on the matching channel.
            let slot = state.slots.iter().enumerate().find_map(|(index, s)| {
                (matches!(s, SlotState::Idle)
                    && self.pool.version_of(index) == Some(head_version))
                .then_some(index)
            });
            let Some(slot) = slot else {
                // All matching slots busy or down; a completion event
                // re-enters here.
                return;
            };

            let Some(request) = state.queue.pop_front() else {
                return;
            };
            if Self::in_flight(&state, &request.request_id) {
                self.reject_duplicate(&request).await;
                continue;
            }

            let line = json!({
                "src": source::preprocess(&request.src, request.backend),
                "backend": request.backend,
            })
            .to_string();
            let job = RenderJob {
                request_id: request.request_id.clone(),
                line,
            };
            tracing::debug!(slot, request_id = %request.request_id, "Dispatched to local renderer");
            state
                .in_flight_local
                .insert(request.request_id.clone(), slot);
            state.slots[slot] = SlotState::Busy(request);

            if let Err(e) = self.pool.dispatch(slot, job) {
                tracing::error!(slot, error = %e, "Slot rejected job");
                if let SlotState::Busy(request) =
                    std::mem::replace(&mut state.slots[slot], SlotState::Dead)
                {
                    state.in_flight_local.remove(&request.request_id);
                    self.respond_error(
                        &request,
                        ERROR_INTERNAL,
                        "Internal error: renderer unavailable",
                    )
                    .await;
                }
            }
        }
    }

    /// Relay a worker's response frame to the client that asked for
    /// it, if `id` names a request currently held by a worker.
    ///
    /// The frame is forwarded verbatim (the worker is trusted to
    /// produce a well-formed JSON-RPC response) and the worker's
    /// capacity entry returns to the free list.
    pub async fn try_relay(&self, id: &str, raw_frame: &str) -> bool {
        let origin = {
            let mut state = self.state.lock().await;
            let Some(worker) = state.busy_workers.remove(id) else {
                return false;
            };
            state.free_workers.push_back(worker);
            state.in_flight_remote.remove(id).map(|r| r.origin)
        };
        tracing::debug!(request_id = id, "Relaying response from worker");
        if let Some(origin) = origin {
            if !self.registry.send_text(origin, raw_frame.to_string()).await {
                tracing::debug!(socket = origin, "Origin gone; dropping worker response");
            }
        }
        self.try_dispatch().await;
        true
    }

    /// Register `socket` as a remote worker with `max_jobs` units of
    /// capacity. An advertisement of one job or fewer is ignored: a
    /// node that small keeps its only slot for itself.
    pub async fn register_worker(&self, socket: SocketId, max_jobs: i64) {
        if max_jobs <= 1 {
            tracing::info!(socket, max_jobs, "Ignoring worker with too little capacity");
            return;
        }
        {
            let mut state = self.state.lock().await;
            for _ in 0..max_jobs {
                state.free_workers.push_back(socket);
            }
        }
        tracing::info!(socket, max_jobs, "Registered remote worker");
        self.try_dispatch().await;
    }

    /// Tear down whatever `socket` was involved in. Harmless for plain
    /// clients; for a registered worker this purges its free capacity
    /// and fails all requests it was holding.
    pub async fn socket_closed(&self, socket: SocketId) {
        let orphaned = {
            let mut state = self.state.lock().await;
            state.free_workers.retain(|s| *s != socket);
            let ids: Vec<RequestId> = state
                .busy_workers
                .iter()
                .filter(|(_, w)| **w == socket)
                .map(|(id, _)| id.clone())
                .collect();
            let mut orphaned = Vec::with_capacity(ids.len());
            for id in ids {
                state.busy_workers.remove(&id);
                if let Some(request) = state.in_flight_remote.remove(&id) {
                    orphaned.push(request);
                }
            }
            orphaned
        };
        if !orphaned.is_empty() {
            tracing::warn!(
                socket,
                count = orphaned.len(),
                "Worker disconnected with requests in flight",
            );
        }
        for request in orphaned {
            self.respond_error(&request, ERROR_INTERNAL, "Worker died")
                .await;
        }
        // The topology changed; queued requests may now be
        // unserviceable and deserve an immediate answer.
        self.try_dispatch().await;
    }

    /// Apply a slot lifecycle event from the renderer pool.
    pub async fn on_slot_event(&self, event: SlotEvent) {
        match event {
            SlotEvent::Ready { slot } => {
                {
                    let mut state = self.state.lock().await;
                    if let Some(s) = state.slots.get_mut(slot) {
                        *s = SlotState::Idle;
                    }
                }
                self.try_dispatch().await;
            }

            SlotEvent::Completed {
                slot,
                request_id,
                line,
            } => {
                let request = self.take_completed(slot, &request_id).await;
                match request {
                    Some(request) => {
                        let id = Value::String(request.request_id.clone());
                        let frame = match serde_json::from_str::<Value>(line.trim()) {
                            Ok(result) => protocol::result_frame(&id, result),
                            Err(e) => {
                                tracing::error!(slot, error = %e, "Unparseable renderer output");
                                protocol::error_frame(
                                    &id,
                                    ERROR_INTERNAL,
                                    "Internal error: could not parse response from renderer",
                                )
                            }
                        };
                        if !self.registry.send_text(request.origin, frame).await {
                            tracing::debug!(
                                socket = request.origin,
                                "Origin gone; dropping render result",
                            );
                        }
                    }
                    None => {
                        tracing::warn!(
                            slot,
                            request_id = %request_id,
                            "Renderer output with no request in flight",
                        );
                    }
                }
                self.try_dispatch().await;
            }

            SlotEvent::Failed {
                slot,
                request_id,
                error,
            } => {
                let request = self.take_failed(slot, &request_id).await;
                if let Some(request) = request {
                    self.respond_error(
                        &request,
                        ERROR_INTERNAL,
                        &format!("Internal error: {error}"),
                    )
                    .await;
                }
            }

            SlotEvent::Died { slot } => {
                let request = {
                    let mut state = self.state.lock().await;
                    match state.slots.get_mut(slot) {
                        Some(s) => match std::mem::replace(s, SlotState::Dead) {
                            SlotState::Busy(request) => {
                                state.in_flight_local.remove(&request.request_id);
                                Some(request)
                            }
                            _ => None,
                        },
                        None => None,
                    }
                };
                if let Some(request) = request {
                    self.respond_error(&request, ERROR_INTERNAL, "Internal error: renderer died")
                        .await;
                }
            }
        }
    }

    /// Live counts for `get_status`.
    pub async fn snapshot(&self) -> DispatchSnapshot {
        let state = self.state.lock().await;
        DispatchSnapshot {
            backlog: state.queue.len(),
            free_worker_entries: state.free_workers.len(),
            busy_worker_entries: state.busy_workers.len(),
            local_slots: state.slots.len(),
            busy_local_slots: state
                .slots
                .iter()
                .filter(|s| !matches!(s, SlotState::Idle))
                .count(),
        }
    }

    // ---- private helpers ----

    fn in_flight(state: &DispatchState, id: &str) -> bool {
        state.in_flight_local.contains_key(id) || state.busy_workers.contains_key(id)
    }

    /// Take the request out of a slot that just answered; the slot
    /// returns to Idle.
    async fn take_completed(&self, slot: usize, request_id: &str) -> Option<RenderRequest> {
        let mut state = self.state.lock().await;
        state.in_flight_local.remove(request_id);
        let slot_state = state.slots.get_mut(slot)?;
        match std::mem::replace(slot_state, SlotState::Idle) {
            SlotState::Busy(request) => Some(request),
            other => {
                *slot_state = other;
                None
            }
        }
    }

    /// Take the request out of a slot whose child went down with the
    /// job; the slot is Dead until its next Ready event.
    async fn take_failed(&self, slot: usize, request_id: &str) -> Option<RenderRequest> {
        let mut state = self.state.lock().await;
        state.in_flight_local.remove(request_id);
        let slot_state = state.slots.get_mut(slot)?;
        match std::mem::replace(slot_state, SlotState::Dead) {
            SlotState::Busy(request) => Some(request),
            _ => None,
        }
    }

    async fn reject_duplicate(&self, request: &RenderRequest) {
        tracing::warn!(
            request_id = %request.request_id,
            "Request id already in flight; rejecting",
        );
        self.respond_error(request, ERROR_INTERNAL, "Duplicate request id")
            .await;
    }

    async fn respond_error(&self, request: &RenderRequest, code: i64, message: &str) {
        let frame = protocol::error_frame(
            &Value::String(request.request_id.clone()),
            code,
            message,
        );
        if !self.registry.send_text(request.origin, frame).await {
            tracing::debug!(socket = request.origin, "Origin gone; dropping error reply");
        }
    }
}

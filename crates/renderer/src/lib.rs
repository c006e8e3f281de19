//! Engraver subprocess supervision.
//!
//! A [`RendererPool`](pool::RendererPool) owns one sandboxed child
//! process per configured slot. Each slot is a long-lived task that
//! accepts one job at a time, speaks newline-delimited JSON on the
//! child's stdin/stdout, and respawns the child whenever it dies or
//! stops answering. Slot lifecycle and job outcomes are reported on a
//! shared [`SlotEvent`](slot::SlotEvent) channel; the dispatcher in
//! `stave-server` consumes it.

pub mod container;
pub mod pool;
pub mod slot;

pub use pool::{RendererConfig, RendererPool};
pub use slot::{RenderJob, SlotError, SlotEvent};

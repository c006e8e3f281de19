//! The renderer pool: one supervised slot per configured job.
//!
//! When an unstable image tag is configured the upper half of the
//! slots serve the unstable channel and the lower half stable; with no
//! unstable tag every slot is stable. The pool only starts tasks and
//! routes jobs; slot state (idle/busy) is the dispatcher's
//! bookkeeping, driven by the event channel.

use std::time::Duration;

use stave_core::types::Version;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::container;
use crate::slot::{run_slot, CommandFactory, RenderJob, SlotEvent};

/// Renderer provisioning parameters.
#[derive(Debug, Clone)]
pub struct RendererConfig {
    /// Image tag for the stable engraver build.
    pub stable_tag: String,
    /// Image tag for the unstable build; enables the channel split.
    pub unstable_tag: Option<String>,
    /// Number of slots (sandboxed children).
    pub jobs: usize,
    /// How long a child may chew on one request before the slot is
    /// reset.
    pub render_timeout: Duration,
}

impl RendererConfig {
    /// Channel served by slot `index`: unstable for the upper half
    /// when an unstable tag is configured, stable otherwise.
    pub fn slot_version(&self, index: usize) -> Version {
        if self.unstable_tag.is_some() && index >= self.jobs / 2 {
            Version::Unstable
        } else {
            Version::Stable
        }
    }
}

struct SlotHandle {
    version: Version,
    jobs: mpsc::Sender<RenderJob>,
    #[allow(dead_code)]
    task: JoinHandle<()>,
}

/// Handle over all slot tasks.
pub struct RendererPool {
    slots: Vec<SlotHandle>,
    cancel: CancellationToken,
}

impl RendererPool {
    /// Start one sandboxed child per configured job.
    pub fn start(config: &RendererConfig, events: mpsc::UnboundedSender<SlotEvent>) -> Self {
        let mut commands: Vec<(Version, CommandFactory)> = Vec::with_capacity(config.jobs);
        for index in 0..config.jobs {
            let version = config.slot_version(index);
            let tag = match version {
                Version::Stable => config.stable_tag.clone(),
                Version::Unstable => config
                    .unstable_tag
                    .clone()
                    .unwrap_or_else(|| config.stable_tag.clone()),
            };
            commands.push((
                version,
                Box::new(move || container::sandbox_command(&tag)),
            ));
        }
        Self::start_with(commands, config.render_timeout, events)
    }

    /// Start slots from explicit child commands. Used by `start` and
    /// by tests that substitute a plain subprocess for the container.
    pub fn start_with(
        commands: Vec<(Version, CommandFactory)>,
        render_timeout: Duration,
        events: mpsc::UnboundedSender<SlotEvent>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let slots = commands
            .into_iter()
            .enumerate()
            .map(|(index, (version, factory))| {
                // Capacity 1: a slot holds at most the job it is
                // working on. A second dispatch is a dispatcher bug.
                let (tx, rx) = mpsc::channel(1);
                let task = tokio::spawn(run_slot(
                    index,
                    factory,
                    render_timeout,
                    rx,
                    events.clone(),
                    cancel.child_token(),
                ));
                SlotHandle {
                    version,
                    jobs: tx,
                    task,
                }
            })
            .collect();
        Self { slots, cancel }
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Channel served by `slot`, if the index exists.
    pub fn version_of(&self, slot: usize) -> Option<Version> {
        self.slots.get(slot).map(|s| s.version)
    }

    /// Whether any slot serves `version`, regardless of its current
    /// state.
    pub fn supports(&self, version: Version) -> bool {
        self.slots.iter().any(|s| s.version == version)
    }

    /// Hand a job to a specific slot.
    pub fn dispatch(&self, slot: usize, job: RenderJob) -> Result<(), PoolError> {
        let handle = self.slots.get(slot).ok_or(PoolError::NoSuchSlot { slot })?;
        handle.jobs.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PoolError::SlotBusy { slot },
            mpsc::error::TrySendError::Closed(_) => PoolError::SlotGone { slot },
        })
    }

    /// Stop all slot tasks; children are killed as their tasks wind
    /// down.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("slot {slot} does not exist")]
    NoSuchSlot { slot: usize },

    #[error("slot {slot} already holds a job")]
    SlotBusy { slot: usize },

    #[error("slot {slot} task has shut down")]
    SlotGone { slot: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(jobs: usize, unstable: bool) -> RendererConfig {
        RendererConfig {
            stable_tag: "engraver:stable".into(),
            unstable_tag: unstable.then(|| "engraver:unstable".into()),
            jobs,
            render_timeout: Duration::from_secs(120),
        }
    }

    #[test]
    fn all_slots_stable_without_unstable_tag() {
        let cfg = config(4, false);
        for i in 0..4 {
            assert_eq!(cfg.slot_version(i), Version::Stable);
        }
    }

    #[test]
    fn upper_half_unstable_with_tag() {
        let cfg = config(4, true);
        assert_eq!(cfg.slot_version(0), Version::Stable);
        assert_eq!(cfg.slot_version(1), Version::Stable);
        assert_eq!(cfg.slot_version(2), Version::Unstable);
        assert_eq!(cfg.slot_version(3), Version::Unstable);
    }

    #[test]
    fn odd_job_count_favours_unstable() {
        let cfg = config(3, true);
        assert_eq!(cfg.slot_version(0), Version::Stable);
        assert_eq!(cfg.slot_version(1), Version::Unstable);
        assert_eq!(cfg.slot_version(2), Version::Unstable);
    }

    #[test]
    fn two_jobs_split_evenly() {
        let cfg = config(2, true);
        assert_eq!(cfg.slot_version(0), Version::Stable);
        assert_eq!(cfg.slot_version(1), Version::Unstable);
    }
}

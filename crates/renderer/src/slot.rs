//! One slot = one sandboxed renderer child plus its supervision task.
//!
//! The task owns the child end to end: it spawns it, feeds it one job
//! at a time over stdin, reads the single response line from stdout,
//! and respawns it after a crash or a hang. Everything the dispatcher
//! needs to know arrives as a [`SlotEvent`] on the shared channel.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Builds the child command for (re)spawning a slot's renderer.
pub type CommandFactory = Box<dyn Fn() -> Command + Send + 'static>;

/// Pause between a child going down and the next spawn attempt, so a
/// broken image cannot hot-loop the supervisor.
const RESPAWN_DELAY: Duration = Duration::from_secs(1);

/// One render handed to a slot: the exact line to write to the child,
/// tagged with the request id for correlation in the completion event.
#[derive(Debug)]
pub struct RenderJob {
    pub request_id: String,
    pub line: String,
}

/// Lifecycle and job notifications from a slot task.
#[derive(Debug)]
pub enum SlotEvent {
    /// The child is up; the slot can accept a job.
    Ready { slot: usize },
    /// The child answered; `line` is its raw stdout line.
    Completed {
        slot: usize,
        request_id: String,
        line: String,
    },
    /// The job was lost; the child is being respawned.
    Failed {
        slot: usize,
        request_id: String,
        error: SlotError,
    },
    /// The child died with no job in flight; respawn is under way.
    Died { slot: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum SlotError {
    #[error("renderer produced no output within {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("renderer process exited before answering")]
    ChildExited,

    #[error("renderer I/O error: {0}")]
    Io(String),
}

enum ServeEnd {
    Respawn,
    Shutdown,
}

/// Supervision loop for a single slot. Runs until cancelled or until
/// the job channel closes.
pub(crate) async fn run_slot(
    index: usize,
    factory: CommandFactory,
    render_timeout: Duration,
    mut jobs: mpsc::Receiver<RenderJob>,
    events: mpsc::UnboundedSender<SlotEvent>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }

        let mut child = match factory().spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(slot = index, error = %e, "Failed to spawn renderer child");
                let _ = events.send(SlotEvent::Died { slot: index });
                if pause(&cancel).await.is_err() {
                    return;
                }
                continue;
            }
        };

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            tracing::error!(slot = index, "Renderer child spawned without piped stdio");
            let _ = child.start_kill();
            let _ = events.send(SlotEvent::Died { slot: index });
            if pause(&cancel).await.is_err() {
                return;
            }
            continue;
        };

        tracing::info!(slot = index, pid = child.id(), "Renderer child started");
        let _ = events.send(SlotEvent::Ready { slot: index });

        let mut stdin = stdin;
        let mut lines = BufReader::new(stdout).lines();
        let end = serve(
            index,
            &mut child,
            &mut stdin,
            &mut lines,
            render_timeout,
            &mut jobs,
            &events,
            &cancel,
        )
        .await;

        // Whatever ended the session, make sure the child is gone
        // before respawning or returning.
        let _ = child.start_kill();
        let _ = child.wait().await;

        match end {
            ServeEnd::Shutdown => return,
            ServeEnd::Respawn => {
                if pause(&cancel).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Accept jobs for one child until it dies, hangs, or shutdown.
#[allow(clippy::too_many_arguments)]
async fn serve(
    index: usize,
    child: &mut Child,
    stdin: &mut ChildStdin,
    lines: &mut Lines<BufReader<ChildStdout>>,
    render_timeout: Duration,
    jobs: &mut mpsc::Receiver<RenderJob>,
    events: &mpsc::UnboundedSender<SlotEvent>,
    cancel: &CancellationToken,
) -> ServeEnd {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return ServeEnd::Shutdown,

            status = child.wait() => {
                tracing::warn!(slot = index, ?status, "Renderer child exited while idle");
                let _ = events.send(SlotEvent::Died { slot: index });
                return ServeEnd::Respawn;
            }

            job = jobs.recv() => {
                let Some(job) = job else { return ServeEnd::Shutdown };
                let request_id = job.request_id.clone();
                match execute(stdin, lines, render_timeout, &job).await {
                    Ok(line) => {
                        let _ = events.send(SlotEvent::Completed {
                            slot: index,
                            request_id,
                            line,
                        });
                    }
                    Err(error) => {
                        tracing::warn!(
                            slot = index,
                            request_id = %request_id,
                            error = %error,
                            "Render failed; respawning child",
                        );
                        let _ = events.send(SlotEvent::Failed {
                            slot: index,
                            request_id,
                            error,
                        });
                        return ServeEnd::Respawn;
                    }
                }
            }
        }
    }
}

/// Write one request line, read one response line. Strictly ordered:
/// the slot never pipelines.
async fn execute(
    stdin: &mut ChildStdin,
    lines: &mut Lines<BufReader<ChildStdout>>,
    render_timeout: Duration,
    job: &RenderJob,
) -> Result<String, SlotError> {
    let mut payload = job.line.clone().into_bytes();
    payload.push(b'\n');
    stdin
        .write_all(&payload)
        .await
        .map_err(|e| SlotError::Io(e.to_string()))?;
    stdin
        .flush()
        .await
        .map_err(|e| SlotError::Io(e.to_string()))?;

    match tokio::time::timeout(render_timeout, lines.next_line()).await {
        Err(_) => Err(SlotError::Timeout {
            timeout_secs: render_timeout.as_secs(),
        }),
        Ok(Err(e)) => Err(SlotError::Io(e.to_string())),
        Ok(Ok(None)) => Err(SlotError::ChildExited),
        Ok(Ok(Some(line))) => Ok(line),
    }
}

/// Sleep out the respawn delay; `Err` means shutdown was requested.
async fn pause(cancel: &CancellationToken) -> Result<(), ()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(()),
        _ = tokio::time::sleep(RESPAWN_DELAY) => Ok(()),
    }
}

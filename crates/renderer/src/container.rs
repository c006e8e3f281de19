//! Sandbox container command construction.
//!
//! Every renderer child runs inside an isolated container: no network,
//! 1 GiB of memory, one CPU, all capabilities dropped, privilege
//! escalation disabled. The engraver image tag selects the stable or
//! unstable build.

use std::process::Stdio;

use tokio::process::Command;

/// Arguments for `docker` that run `image_tag` fully sandboxed, with
/// stdin attached and the container removed on exit.
pub fn sandbox_args(image_tag: &str) -> Vec<String> {
    [
        "run",
        "--rm",
        "-i",
        "--net=none",
        "-m1g",
        "--security-opt=no-new-privileges",
        "--cap-drop",
        "ALL",
        "--cpus=1",
        image_tag,
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Build the command that spawns one sandboxed renderer child.
///
/// stdin/stdout are piped for the line protocol; stderr passes through
/// to the supervisor's own stderr. `kill_on_drop` guarantees the
/// container's client process dies with its slot task.
pub fn sandbox_command(image_tag: &str) -> Command {
    let mut cmd = Command::new("docker");
    cmd.args(sandbox_args(image_tag))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    cmd
}

/// Build an engraver image from a build-context directory.
///
/// Runs `docker build <path> -t <tag>` to completion. Called once per
/// configured channel at startup, before any slot spawns.
pub async fn build_image(path: &str, tag: &str) -> Result<(), BuildError> {
    tracing::info!(path, tag, "Building renderer image");
    let status = Command::new("docker")
        .args(["build", path, "-t", tag])
        .status()
        .await
        .map_err(BuildError::Io)?;
    if !status.success() {
        return Err(BuildError::Failed {
            tag: tag.to_string(),
            code: status.code(),
        });
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("could not run docker build: {0}")]
    Io(std::io::Error),

    #[error("docker build for image {tag} failed (exit code {code:?})")]
    Failed { tag: String, code: Option<i32> },
}

//! Command-line surface.
//!
//! One binary, two roles, selected by subcommand: `coordinator`
//! listens for clients and workers; `worker` dials a coordinator and
//! contributes its local slots. Renderer provisioning flags are shared
//! by both roles.

use std::time::Duration;

use clap::{Parser, Subcommand};
use stave_renderer::RendererConfig;

use crate::identity::IdentityConfig;

#[derive(Debug, Parser)]
#[command(
    name = "stave-server",
    about = "Two-tier dispatcher for sandboxed music-engraving renders",
    version
)]
pub struct Cli {
    /// Build-context directory for the stable renderer image. When
    /// set, the image is built at startup.
    #[arg(long)]
    pub renderer_path: Option<String>,

    /// Image tag for the stable renderer.
    #[arg(long)]
    pub renderer_docker_tag: String,

    /// Build-context directory for the unstable renderer image.
    #[arg(long)]
    pub renderer_unstable_path: Option<String>,

    /// Image tag for the unstable renderer; configuring it moves the
    /// upper half of the slots to the unstable channel.
    #[arg(long)]
    pub renderer_unstable_docker_tag: Option<String>,

    /// Number of local renderer slots (sandboxed children).
    #[arg(long, default_value_t = 1)]
    pub jobs: usize,

    /// Seconds a renderer child may spend on one request before its
    /// slot is reset.
    #[arg(long, default_value_t = 120)]
    pub render_timeout_secs: u64,

    /// GitHub OAuth application client id (coordinator only).
    #[arg(long, env = "GITHUB_CLIENT_ID")]
    pub github_client_id: Option<String>,

    /// GitHub OAuth application secret (coordinator only).
    #[arg(long, env = "GITHUB_SECRET")]
    pub github_secret: Option<String>,

    #[command(subcommand)]
    pub role: Role,
}

#[derive(Debug, Subcommand)]
pub enum Role {
    /// Listen for clients and workers; own the global request queue.
    Coordinator {
        /// Bind address.
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// WebSocket listen port.
        #[arg(long)]
        ws_port: u16,
    },

    /// Dial a coordinator and execute renders on local slots.
    Worker {
        /// Coordinator WebSocket URL, e.g. `ws://host:2000`.
        #[arg(long)]
        coordinator: String,
    },
}

impl Cli {
    /// Cross-flag constraints clap cannot express.
    pub fn validate(&self) -> Result<(), String> {
        if self.renderer_unstable_docker_tag.is_some() && self.jobs < 2 {
            return Err(
                "--jobs must be at least 2 when an unstable docker tag is configured".to_string(),
            );
        }
        Ok(())
    }

    pub fn renderer_config(&self) -> RendererConfig {
        RendererConfig {
            stable_tag: self.renderer_docker_tag.clone(),
            unstable_tag: self.renderer_unstable_docker_tag.clone(),
            jobs: self.jobs,
            render_timeout: Duration::from_secs(self.render_timeout_secs),
        }
    }

    /// GitHub credentials, when both halves are configured.
    pub fn identity_config(&self) -> Option<IdentityConfig> {
        match (&self.github_client_id, &self.github_secret) {
            (Some(client_id), Some(client_secret))
                if !client_id.is_empty() && !client_secret.is_empty() =>
            {
                Some(IdentityConfig {
                    client_id: client_id.clone(),
                    client_secret: client_secret.clone(),
                })
            }
            _ => None,
        }
    }
}

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stave_renderer::{container, RendererPool};
use stave_server::config::{Cli, Role};
use stave_server::dispatch::Dispatcher;
use stave_server::identity::IdentityRelay;
use stave_server::sockets::SocketRegistry;
use stave_server::state::{AppState, Stats};
use stave_server::{heartbeat, worker_link, ws};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stave=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    if let Err(e) = cli.validate() {
        tracing::error!("{e}");
        std::process::exit(1);
    }

    // Build engraver images before the first slot spawns.
    if cli.jobs > 0 {
        if let Some(path) = &cli.renderer_path {
            if let Err(e) = container::build_image(path, &cli.renderer_docker_tag).await {
                tracing::error!(error = %e, "Failed to build renderer image");
                std::process::exit(1);
            }
        }
        if let (Some(path), Some(tag)) = (
            &cli.renderer_unstable_path,
            &cli.renderer_unstable_docker_tag,
        ) {
            if let Err(e) = container::build_image(path, tag).await {
                tracing::error!(error = %e, "Failed to build unstable renderer image");
                std::process::exit(1);
            }
        }
    }

    let registry = Arc::new(SocketRegistry::new());
    let stats = Arc::new(Stats::new());

    let (slot_events_tx, mut slot_events_rx) = mpsc::unbounded_channel();
    let pool = RendererPool::start(&cli.renderer_config(), slot_events_tx);
    tracing::info!(jobs = cli.jobs, "Renderer pool started");

    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&registry), pool));

    let identity = match &cli.role {
        Role::Coordinator { .. } => match cli.identity_config() {
            Some(config) => Some(Arc::new(IdentityRelay::new(
                config,
                Arc::clone(&registry),
                Arc::clone(&stats),
            ))),
            None => {
                tracing::warn!("No GitHub credentials configured; sign-in disabled");
                None
            }
        },
        Role::Worker { .. } => None,
    };

    let state = AppState {
        registry: Arc::clone(&registry),
        dispatcher: Arc::clone(&dispatcher),
        identity,
        stats,
    };

    // Pump slot lifecycle events into the dispatcher.
    let pump_dispatcher = Arc::clone(&dispatcher);
    let pump = tokio::spawn(async move {
        while let Some(event) = slot_events_rx.recv().await {
            pump_dispatcher.on_slot_event(event).await;
        }
    });

    match &cli.role {
        Role::Coordinator { host, ws_port } => {
            let heartbeat_handle = heartbeat::start_heartbeat(Arc::clone(&registry));

            let addr: SocketAddr = format!("{host}:{ws_port}")
                .parse()
                .expect("Invalid listen address");
            tracing::info!(%addr, "Starting coordinator");

            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .expect("Failed to bind WebSocket port");

            axum::serve(listener, ws::router(state.clone()))
                .with_graceful_shutdown(shutdown_signal())
                .await
                .expect("Server error");

            tracing::info!("Listener stopped; cleaning up");
            registry.shutdown_all().await;
            dispatcher.pool().shutdown();
            heartbeat_handle.abort();
        }

        Role::Worker { coordinator } => {
            let cancel = CancellationToken::new();
            let link = tokio::spawn(worker_link::run(
                state.clone(),
                coordinator.clone(),
                cli.jobs,
                cancel.clone(),
            ));

            shutdown_signal().await;

            tracing::info!("Shutting down worker");
            cancel.cancel();
            let _ = tokio::time::timeout(Duration::from_secs(5), link).await;
            registry.shutdown_all().await;
            dispatcher.pool().shutdown();
        }
    }

    pump.abort();
    tracing::info!("Graceful shutdown complete");
}

/// Wait for a termination signal to initiate graceful shutdown.
///
/// Handles both SIGINT (Ctrl-C) and SIGTERM (on Unix) so the server
/// shuts down cleanly whether stopped interactively or by a process
/// manager.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}

mod config;
mod frame;
mod protocol;
mod rate_limit;
mod routes;
mod services;
mod state;

use std::process::ExitCode;

use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use crate::services::{hub, persistence};

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let config = match config::Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(
        storage = ?config.storage,
        max_strokes = config.hub.max_strokes,
        max_connections = config.hub.max_connections,
        log_level = %config.log_level,
        "configuration loaded"
    );

    let store = persistence::open_store(&config.storage);
    let restored = persistence::load_or_empty(store.as_ref()).await;

    let (persist_tx, persist_rx) = mpsc::channel(persistence::SNAPSHOT_QUEUE_CAPACITY);
    let (handle, _hub) = hub::spawn(hub::Hub::new(config.hub, restored, Some(persist_tx)));
    let _timers = hub::spawn_timers(&handle, &config.hub);
    let snapshots = persistence::spawn_snapshot_task(handle.clone(), store.clone(), config.hub.save_interval, persist_rx);

    let addr = config.listen_addr();
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(%addr, error = %e, "failed to bind");
            return ExitCode::FAILURE;
        }
    };

    let app = routes::app(state::AppState::new(handle.clone(), config));
    tracing::info!(%addr, "inkboard listening");
    if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await {
        tracing::error!(error = %e, "server failed");
    }

    // Stop periodic saves so the final write is the last one.
    snapshots.abort();
    match handle.snapshot().await {
        Some(snapshot) => {
            if persistence::save_logged(store.as_ref(), &snapshot).await {
                tracing::info!(strokes = snapshot.strokes.len(), "final canvas snapshot saved");
            }
        }
        None => tracing::warn!("hub stopped before final snapshot"),
    }
    ExitCode::SUCCESS
}

/// `RUST_LOG` wins; otherwise `LOG_LEVEL`, otherwise `info`.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| config::DEFAULT_LOG_LEVEL.to_string());
        EnvFilter::new(level)
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    tracing::info!("shutdown signal received");
}

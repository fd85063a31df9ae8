mod config;
mod error;
mod routes;
mod services;
mod state;
mod ws;

use crate::config::{AppConfig, Args};
use crate::services::mirror_sweeper::start_mirror_sweeper;
use crate::services::retention_scheduler::RetentionScheduler;
use crate::state::AppState;
use clap::Parser;
use recovery_core::{Dependencies, MemoryLiveData, RecoveryService};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = AppConfig::from_env(&args)?;

    recovery_core::utils::logger::init(&config.log_level)?;
    tracing::info!("Starting recovery server on port {}", config.port);

    std::fs::create_dir_all(&config.core.storage.data_dir)?;

    // Live data starts empty; the business side fills it through /api/live
    let live = Arc::new(MemoryLiveData::default());
    let deps = Dependencies::open(&config.core, live.clone()).await?;
    let service = RecoveryService::new(deps, config.core.engine_settings());

    let state = Arc::new(AppState::new(service, live, config.clone()));

    // Records left LEDGER_PENDING by a previous run are picked up here
    let cancel = CancellationToken::new();
    let sweeper = start_mirror_sweeper(
        state.clone(),
        Duration::from_secs(config.mirror_sweep_secs.max(1)),
        cancel.clone(),
    );

    let scheduler = match RetentionScheduler::new(state.clone()).await {
        Ok(s) => {
            if let Err(e) = s.schedule_cleanup(&config.core.retention.cron).await {
                tracing::warn!("Failed to schedule retention cleanup: {}", e);
            }
            if let Err(e) = s.start().await {
                tracing::warn!("Failed to start scheduler: {}", e);
            }
            Some(s)
        }
        Err(e) => {
            tracing::warn!("Failed to create scheduler: {}", e);
            None
        }
    };

    let app = routes::create_router(state.clone());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    tracing::info!("Shutting down...");
    cancel.cancel();
    if let Err(e) = sweeper.await {
        tracing::warn!("Mirror sweeper join error: {}", e);
    }

    if let Some(s) = scheduler {
        if let Err(e) = s.shutdown().await {
            tracing::warn!("Scheduler shutdown error: {}", e);
        }
    }

    // Let in-flight ledger mirrors land before the stores are dropped
    state.service.backups().wait_for_mirrors().await;
    tracing::info!("Server stopped");

    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl+c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
        _ = cancel.cancelled() => {},
    }

    cancel.cancel();
}

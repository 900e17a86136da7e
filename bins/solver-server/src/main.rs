mod handlers;
mod routes;

use anyhow::Context;
use solver_common::config::EngineConfig;
use solver_common::redis::RedisBlobStore;
use solver_common::storage::{BlobStore, FsBlobStore};
use solver_engine::reaper::Reaper;
use solver_engine::ExecutionCoordinator;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};

pub struct AppState {
    pub coordinator: Arc<ExecutionCoordinator>,
    pub config: EngineConfig,
}

/// Pick the remote store: Redis when configured and reachable, then a
/// directory store, otherwise local-only sessions.
async fn blob_store(config: &EngineConfig) -> Option<Arc<dyn BlobStore>> {
    if let Some(url) = &config.redis_url {
        match RedisBlobStore::connect(url).await {
            Ok(store) => {
                info!("Connected to Redis blob store: {}", url);
                return Some(Arc::new(store));
            }
            Err(e) => warn!(error = %e, "Redis unavailable, falling back"),
        }
    }
    if let Some(dir) = &config.blob_dir {
        info!("Using directory blob store: {}", dir.display());
        return Some(Arc::new(FsBlobStore::new(dir.clone())));
    }
    warn!("No remote blob store configured; session files stay local");
    None
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
        )
        .with_target(false)
        .init();

    info!("Solver server booting...");

    let config = EngineConfig::from_env().context("Invalid configuration")?;
    info!(
        backend = ?config.backend,
        workspace = %config.workspace_root.display(),
        quota_bytes = config.quota_bytes,
        "Configuration loaded"
    );

    let backend = solver_engine::backend_from_config(&config)?;
    let store = blob_store(&config).await;
    let coordinator = Arc::new(ExecutionCoordinator::new(&config, backend, store));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reaper = Reaper::new(coordinator.registry().clone(), config.retention, config.reaper_interval)
        .spawn(shutdown_rx);

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;
    info!("HTTP server listening on {}", config.bind_addr);

    let app = routes::routes(config.max_upload_bytes).with_state(Arc::new(AppState {
        coordinator: coordinator.clone(),
        config,
    }));

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            warn!("Received shutdown signal, stopping...");
        })
        .await
        .context("Server error")?;

    let _ = shutdown_tx.send(true);
    if let Err(e) = reaper.await {
        warn!(error = %e, "Reaper task ended abnormally");
    }
    coordinator.shutdown().await;
    info!("Solver server stopped");
    Ok(())
}

//! Binary entry point: configuration, storage probe, manager, API server.

use debrid_broker::api::{self, AppState};
use debrid_broker::config::{BrokerConfig, StorageMode};
use debrid_broker::debrid::AllDebridClient;
use debrid_broker::manager::JobManager;
use debrid_broker::probe;
use debrid_broker::storage::SqliteStore;
use debrid_broker::types::StorageKind;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run().await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "fatal");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run() -> debrid_broker::Result<()> {
    let config = BrokerConfig::from_env()?;
    config.validate()?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        download_path = %config.download_path.display(),
        "starting debrid-broker"
    );

    tokio::fs::create_dir_all(&config.download_path)
        .await
        .map_err(|e| debrid_broker::BrokerError::from_io(e, &config.download_path))?;

    // Probe the medium unless the configuration pins it.
    let probed = match config.storage_type {
        StorageMode::Auto => {
            let path = config.download_path.clone();
            tokio::task::spawn_blocking(move || probe::detect_storage(&path))
                .await
                .unwrap_or(StorageKind::Hdd)
        }
        StorageMode::Hdd => StorageKind::Hdd,
        StorageMode::Ssd => StorageKind::Ssd,
    };
    let profile = config.resolve_profile(probed);
    tracing::info!(
        kind = %profile.kind,
        connections = profile.max_connections_per_job,
        buffer = profile.disk_buffer_bytes,
        preallocate = profile.preallocate,
        "tuning profile resolved"
    );

    let gateway = Arc::new(AllDebridClient::new(
        config.debrid_base_url.clone(),
        config.debrid_api_key.clone(),
    )?);
    let store = Arc::new(SqliteStore::open(config.store_path()).await?);

    let max_active = profile.max_concurrent_large + profile.max_concurrent_small;
    let manager = JobManager::new(
        profile,
        config.download_path.clone(),
        gateway,
        store,
    )
    .await?;

    let shutdown = tokio_util::sync::CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            shutdown.cancel();
        });
    }

    let state = AppState {
        manager: Arc::clone(&manager),
        max_active_downloads: max_active,
    };
    let result = api::serve(state, config.api_bind, shutdown.clone()).await;

    manager.shutdown().await;
    result
}

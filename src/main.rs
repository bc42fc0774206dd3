use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use soundbridge::cache::AudioCache;
use soundbridge::mapping::MappingStore;
use soundbridge::paths::PathConfig;
use soundbridge::server::{router, AppState};

const PORT_ENV: &str = "SOUNDBRIDGE_PORT";
const DEFAULT_PORT: u16 = 9000;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let paths = PathConfig::from_env();
    paths
        .ensure_directories_exist()
        .context("failed to create cache directories")?;
    tracing::info!(cache_dir = %paths.audio_dir.display(), "audio cache initialized");

    // No extraction can be in flight yet, so anything transitional is an
    // orphan from an earlier run.
    let swept = AudioCache::new(paths.audio_dir.clone()).cleanup_stale_temps()?;
    if swept > 0 {
        tracing::info!(count = swept, "swept stale temp files");
    }

    let store = MappingStore::with_file(paths.mapping_file.clone());
    let state = Arc::new(AppState::new(paths, store));

    let port = std::env::var(PORT_ENV)
        .ok()
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(DEFAULT_PORT);
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .with_context(|| format!("failed to bind 127.0.0.1:{}", port))?;
    tracing::info!(port, "listening");

    axum::serve(listener, router(state.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // Debounced mapping writes may still be pending.
    if let Err(e) = state.store.close() {
        tracing::warn!(error = %e, "failed to flush song mapping on shutdown");
    }

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown requested");
}

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use nazr_faces::api::routes;
use nazr_faces::pipeline;
use nazr_faces::store::{store_path_for, EmbeddingStore};
use nazr_faces::utils::config::Config;
use nazr_faces::utils::logging;
use nazr_faces::AppState;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();
    let cfg = Config::from_env();
    std::fs::create_dir_all(&cfg.data).with_context(|| format!("Failed to create data dir {:?}", cfg.data))?;
    std::fs::create_dir_all(&cfg.library).with_context(|| format!("Failed to create library dir {:?}", cfg.library))?;
    std::fs::create_dir_all(&cfg.results).with_context(|| format!("Failed to create results dir {:?}", cfg.results))?;

    let store_path = store_path_for(&cfg.data, &cfg.library)?;
    info!("library {:?} -> store {:?}", cfg.library, store_path);
    let busy_timeout = cfg.busy_timeout();
    let store = tokio::task::spawn_blocking(move || EmbeddingStore::open_with_timeout(store_path, busy_timeout))
        .await?
        .context("Failed to open embedding store")?;

    let encoder = pipeline::default_encoder(&cfg).await?;
    let state = Arc::new(AppState::new(cfg.clone(), store, encoder));

    // Warm the cache so the first search does not pay for the whole library.
    {
        let state = state.clone();
        tokio::task::spawn_blocking(move || {
            let mut store = state.store.lock();
            match store.reconcile(&state.paths.library, state.encoder.as_ref(), &state.config.reconcile_options()) {
                Ok(report) => state.stats.record_reconcile(&report),
                Err(e) => error!("startup reconcile failed: {}", e),
            }
        });
    }

    let app = routes::router(state.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("listening" = %addr);
    axum::serve(listener, app).await?;
    Ok(())
}

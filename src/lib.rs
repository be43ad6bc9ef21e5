pub mod api;
pub mod db;
pub mod error;
pub mod face;
pub mod materialize;
pub mod models;
pub mod pipeline;
pub mod stats;
pub mod store;
pub mod utils;

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::pipeline::encoder::Encoder;
use crate::store::EmbeddingStore;
use crate::utils::config::Config;

#[derive(Clone, Debug)]
pub struct AppPaths {
    pub library: PathBuf,
    pub data: PathBuf,
    pub results: PathBuf,
    pub uploads: PathBuf,
    pub store: PathBuf,
}

impl AppPaths {
    pub fn new(config: &Config, store: PathBuf) -> Self {
        Self {
            library: config.library.clone(),
            data: config.data.clone(),
            results: config.results.clone(),
            uploads: config.data.join("uploads"),
            store,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub started_at: std::time::Instant,
    pub config: Config,
    pub paths: AppPaths,
    pub stats: Arc<stats::Stats>,
    pub store: Arc<Mutex<EmbeddingStore>>,
    pub encoder: Arc<dyn Encoder>,
}

impl AppState {
    pub fn new(config: Config, store: EmbeddingStore, encoder: Arc<dyn Encoder>) -> Self {
        let paths = AppPaths::new(&config, store.path().to_path_buf());
        Self {
            started_at: std::time::Instant::now(),
            config,
            paths,
            stats: Arc::new(stats::Stats::new()),
            store: Arc::new(Mutex::new(store)),
            encoder,
        }
    }
}

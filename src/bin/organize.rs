use std::time::Instant;

use anyhow::Context;
use nazr_faces::face::cluster::{cluster_images, collect_points};
use nazr_faces::face::distance::distance_summary;
use nazr_faces::materialize::organize_clusters;
use nazr_faces::models::face::Embedding;
use nazr_faces::pipeline;
use nazr_faces::pipeline::encoder::DistanceScale;
use nazr_faces::store::{store_path_for, EmbeddingStore};
use nazr_faces::utils::config::Config;
use nazr_faces::utils::logging;
use tracing::{info, warn};

// Pairs sampled for the distance log line.
const SUMMARY_SAMPLE: usize = 50;

/// Sort every photo in the input folder into one folder per person.
///
/// Photos are encoded with the same reconcile options as the search server
/// (`NAZR_SCALE_FACTOR`, default 0.5, and `NAZR_DETECTION_MODEL`), so a folder
/// that is also a search library shares one cache. Set
/// `NAZR_SCALE_FACTOR=1.0` to detect at full resolution and catch small faces;
/// records already cached keep the settings they were encoded with.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();
    let cfg = Config::from_env();
    let started = Instant::now();

    let input = cfg.organize_input.clone();
    let output = cfg.organize_output.clone();
    if !input.is_dir() {
        anyhow::bail!("input folder {:?} not found", input);
    }
    // Catch bad overrides before the models load.
    cfg.dbscan_params(DistanceScale::default()).validate()?;

    std::fs::create_dir_all(&cfg.data).with_context(|| format!("Failed to create data dir {:?}", cfg.data))?;
    let store_path = store_path_for(&cfg.data, &input)?;
    let encoder = pipeline::default_encoder(&cfg).await?;
    let params = cfg.dbscan_params(encoder.distance_scale());
    params.validate()?;

    info!("organizing {:?} -> {:?} (eps {}, min_samples {})", input, output, params.eps, params.min_samples);
    let (report, points, photos) = tokio::task::spawn_blocking({
        let input = input.clone();
        let cfg = cfg.clone();
        move || -> anyhow::Result<_> {
            let mut store = EmbeddingStore::open_with_timeout(store_path, cfg.busy_timeout())?;
            let report = store.reconcile(&input, encoder.as_ref(), &cfg.reconcile_options())?;
            let points = collect_points(store.iter(), cfg.faces_per_image);
            Ok((report, points, store.len()))
        }
    })
    .await??;
    info!(
        "reconciled {} photo(s): {} encoded, {} re-encoded, {} failed, {} quarantined",
        report.scanned, report.encoded, report.reencoded, report.decode_failures, report.quarantined
    );

    if points.is_empty() {
        warn!("no faces found in {:?}; nothing to organize", input);
        return Ok(());
    }

    let embeddings: Vec<Embedding> = points.iter().map(|(_, e)| e.clone()).collect();
    if let Some((min, median, max)) = distance_summary(&embeddings, SUMMARY_SAMPLE)? {
        info!("pairwise distances: min {:.3}, median {:.3}, max {:.3}", min, median, max);
    }

    let (clustering, copied) = tokio::task::spawn_blocking({
        let input = input.clone();
        let output = output.clone();
        move || -> anyhow::Result<_> {
            let clustering = cluster_images(&points, &params)?;
            let copied = organize_clusters(&input, &clustering.groups(), &output)?;
            Ok((clustering, copied))
        }
    })
    .await??;

    for failure in &copied.failures {
        warn!("{}", failure);
    }
    info!(
        "done in {:.2}s: {} photo(s) processed, {} face(s) clustered, {} people identified, {} unassigned, {} file(s) copied, {} copy failure(s)",
        started.elapsed().as_secs_f64(),
        photos,
        clustering.len(),
        clustering.cluster_count,
        clustering.noise_count,
        copied.copied,
        copied.failures.len()
    );
    Ok(())
}

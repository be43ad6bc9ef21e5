pub mod discover;
pub mod encoder;
pub mod hash;
#[cfg(feature = "facial-recognition")]
pub mod face;

use std::sync::Arc;

pub use discover::{scan_library, LibraryImage};
pub use encoder::{encode_file, Encoder};

use crate::utils::config::Config;

/// The encoder both binaries run with: SCRFD + ArcFace, models fetched into
/// `models_dir` on first start unless auto-download is off.
#[cfg(feature = "facial-recognition")]
pub async fn default_encoder(cfg: &Config) -> anyhow::Result<Arc<dyn Encoder>> {
    let mut encoder = face::OnnxEncoder::new(face::OnnxSettings {
        models_dir: cfg.models_dir.clone(),
        auto_download: cfg.face_auto_download,
        confidence_threshold: cfg.face_confidence_threshold,
        nms_iou_threshold: cfg.face_nms_iou_threshold,
    });
    encoder.initialize().await?;
    // Running without models would record every library photo as a failed
    // decode and eventually quarantine the whole library.
    if !encoder.is_ready() {
        anyhow::bail!("face models are not available in {:?}", cfg.models_dir);
    }
    Ok(Arc::new(encoder))
}

#[cfg(not(feature = "facial-recognition"))]
pub async fn default_encoder(_cfg: &Config) -> anyhow::Result<Arc<dyn Encoder>> {
    anyhow::bail!("built without the facial-recognition feature; no face encoder available")
}

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::face::cluster::{DbscanParams, DEFAULT_MIN_SAMPLES};
use crate::pipeline::encoder::DistanceScale;
use crate::models::face::{DetectionModel, FacesPerImage, InvalidationPolicy};
use crate::store::{ReconcileOptions, DEFAULT_MAX_DECODE_ATTEMPTS, DEFAULT_SCALE_FACTOR};

#[derive(Clone, Debug)]
pub struct Config {
    pub library: PathBuf,
    pub data: PathBuf,
    pub results: PathBuf,
    pub port: u16,
    /// Unset means the encoder's own scale.
    pub match_threshold: Option<f32>,
    pub scale_factor: f32,
    pub detection_model: DetectionModel,
    pub query_detection_model: DetectionModel,
    pub encode_threads: usize,
    pub invalidation: InvalidationPolicy,
    pub max_decode_attempts: u32,
    pub prune_missing: bool,
    pub busy_timeout_ms: u64,
    pub cluster_eps: Option<f32>,
    pub cluster_min_samples: usize,
    pub faces_per_image: FacesPerImage,
    pub organize_input: PathBuf,
    pub organize_output: PathBuf,
    pub models_dir: PathBuf,
    pub face_auto_download: bool,
    pub face_confidence_threshold: f32,
    pub face_nms_iou_threshold: f32,
}

fn parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn optional<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

fn flag(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes"))
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        let library = env::var("NAZR_LIBRARY").unwrap_or_else(|_| "/photos".to_string());
        let data = PathBuf::from(env::var("NAZR_DATA").unwrap_or_else(|_| "/nazr-data".to_string()));
        let results = env::var("NAZR_RESULTS_DIR").map(PathBuf::from).unwrap_or_else(|_| data.join("results"));
        let models_dir = env::var("NAZR_MODELS_DIR").map(PathBuf::from).unwrap_or_else(|_| data.join("models"));
        let default_threads = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(2);
        Self {
            library: PathBuf::from(library),
            results,
            port: parsed("NAZR_PORT", 9161),
            match_threshold: optional("NAZR_MATCH_THRESHOLD"),
            scale_factor: parsed("NAZR_SCALE_FACTOR", DEFAULT_SCALE_FACTOR),
            detection_model: parsed("NAZR_DETECTION_MODEL", DetectionModel::Fast),
            query_detection_model: parsed("NAZR_QUERY_DETECTION_MODEL", DetectionModel::Fast),
            encode_threads: parsed("NAZR_ENCODE_THREADS", default_threads).max(1),
            invalidation: parsed("NAZR_INVALIDATION", InvalidationPolicy::Never),
            max_decode_attempts: parsed("NAZR_MAX_DECODE_ATTEMPTS", DEFAULT_MAX_DECODE_ATTEMPTS),
            prune_missing: flag("NAZR_PRUNE_MISSING", false),
            busy_timeout_ms: parsed("NAZR_STORE_BUSY_TIMEOUT_MS", 30_000),
            cluster_eps: optional("NAZR_CLUSTER_EPS"),
            cluster_min_samples: parsed("NAZR_CLUSTER_MIN_SAMPLES", DEFAULT_MIN_SAMPLES),
            faces_per_image: parsed("NAZR_FACES_PER_IMAGE", FacesPerImage::First),
            organize_input: PathBuf::from(env::var("NAZR_ORGANIZE_INPUT").unwrap_or_else(|_| "input_photos".to_string())),
            organize_output: PathBuf::from(
                env::var("NAZR_ORGANIZE_OUTPUT").unwrap_or_else(|_| "output_clusters".to_string()),
            ),
            models_dir,
            face_auto_download: flag("NAZR_FACE_AUTO_DOWNLOAD", true),
            face_confidence_threshold: parsed("NAZR_FACE_CONFIDENCE_THRESHOLD", 0.20),
            face_nms_iou_threshold: parsed("NAZR_FACE_NMS_IOU_THRESHOLD", 0.4),
            data,
        }
    }

    pub fn reconcile_options(&self) -> ReconcileOptions {
        ReconcileOptions {
            scale_factor: self.scale_factor,
            detection_model: self.detection_model,
            encode_threads: self.encode_threads,
            invalidation: self.invalidation,
            max_decode_attempts: self.max_decode_attempts,
            prune_missing: self.prune_missing,
        }
    }

    pub fn match_threshold(&self, scale: DistanceScale) -> f32 {
        self.match_threshold.unwrap_or(scale.match_threshold)
    }

    pub fn dbscan_params(&self, scale: DistanceScale) -> DbscanParams {
        DbscanParams {
            eps: self.cluster_eps.unwrap_or(scale.cluster_eps),
            min_samples: self.cluster_min_samples,
        }
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

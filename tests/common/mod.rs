#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use image::{DynamicImage, Rgb, RgbImage};
use nazr_faces::error::Result;
use nazr_faces::models::face::{DetectedFace, DetectionModel, Embedding, FaceRegion};
use nazr_faces::pipeline::encoder::{open_image, DistanceScale, Encoder};
use nazr_faces::store::{EmbeddingStore, ReconcileOptions};
use nazr_faces::utils::config::Config;
use nazr_faces::AppState;
use tempfile::TempDir;

pub const ALICE: [u8; 3] = [50, 0, 0];
pub const ALICE_AGAIN: [u8; 3] = [52, 0, 0];
pub const BOB: [u8; 3] = [0, 50, 0];
pub const BOB_AGAIN: [u8; 3] = [0, 51, 0];
pub const CAROL: [u8; 3] = [0, 0, 90];
pub const NOBODY: [u8; 3] = [0, 0, 0];

/// Stand-in for the ONNX models.
///
/// Each photo is an 8x8 PNG split into a left and a right half. A black left
/// half means no face; otherwise the left half is one face and a right half
/// of a different color is a second face. A face's embedding is its color
/// divided by 100, zero padded to `dim`.
pub struct FakeEncoder {
    pub dim: usize,
    pub scale: DistanceScale,
    pub decodes: AtomicUsize,
    pub detections: AtomicUsize,
}

impl FakeEncoder {
    pub fn new() -> Self {
        Self::with_dim(3)
    }

    pub fn with_dim(dim: usize) -> Self {
        Self {
            dim,
            scale: DistanceScale::default(),
            decodes: AtomicUsize::new(0),
            detections: AtomicUsize::new(0),
        }
    }

    pub fn with_scale(scale: DistanceScale) -> Self {
        Self { scale, ..Self::new() }
    }

    pub fn decodes(&self) -> usize {
        self.decodes.load(Ordering::SeqCst)
    }

    pub fn detections(&self) -> usize {
        self.detections.load(Ordering::SeqCst)
    }

    fn embed(&self, color: Rgb<u8>) -> Embedding {
        let mut v: Vec<f32> = color.0.iter().map(|c| *c as f32 / 100.0).collect();
        v.resize(self.dim, 0.0);
        Embedding::new(v).unwrap()
    }
}

impl Encoder for FakeEncoder {
    fn decode_image(&self, path: &Path) -> Result<DynamicImage> {
        self.decodes.fetch_add(1, Ordering::SeqCst);
        open_image(path)
    }

    fn detect_and_encode(&self, image: &DynamicImage, _model: DetectionModel) -> Result<Vec<DetectedFace>> {
        self.detections.fetch_add(1, Ordering::SeqCst);
        let rgb = image.to_rgb8();
        let (w, h) = rgb.dimensions();
        let left = *rgb.get_pixel(0, 0);
        let right = *rgb.get_pixel(w - 1, h - 1);
        if left.0 == NOBODY {
            return Ok(Vec::new());
        }
        let half = w as f32 / 2.0;
        let mut faces = vec![DetectedFace {
            region: FaceRegion { x1: 0.0, y1: 0.0, x2: half, y2: h as f32, confidence: 0.9 },
            embedding: self.embed(left),
        }];
        if right != left {
            faces.push(DetectedFace {
                region: FaceRegion { x1: half, y1: 0.0, x2: w as f32, y2: h as f32, confidence: 0.8 },
                embedding: self.embed(right),
            });
        }
        Ok(faces)
    }

    fn distance_scale(&self) -> DistanceScale {
        self.scale
    }
}

/// Write an 8x8 PNG with one face (or none, for `NOBODY`).
pub fn write_face(path: &Path, color: [u8; 3]) {
    write_pair(path, color, color);
}

/// Write an 8x8 PNG with a face on each half.
pub fn write_pair(path: &Path, left: [u8; 3], right: [u8; 3]) {
    let img = RgbImage::from_fn(8, 8, |x, _| if x < 4 { Rgb(left) } else { Rgb(right) });
    img.save(path).unwrap();
}

pub fn write_garbage(path: &Path) {
    std::fs::write(path, b"definitely not an image").unwrap();
}

/// Pin a file's mtime so metadata comparisons do not depend on clock
/// granularity.
pub fn set_mtime(path: &Path, secs_since_epoch: u64) {
    let file = std::fs::File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs_since_epoch)).unwrap();
}

pub struct TestLibrary {
    pub tmp: TempDir,
    pub library: PathBuf,
    pub data: PathBuf,
    pub store_path: PathBuf,
}

impl TestLibrary {
    pub fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let library = tmp.path().join("library");
        let data = tmp.path().join("data");
        std::fs::create_dir_all(&library).unwrap();
        std::fs::create_dir_all(&data).unwrap();
        let store_path = data.join("stores").join("library.db");
        Self { tmp, library, data, store_path }
    }

    pub fn photo(&self, name: &str) -> PathBuf {
        self.library.join(name)
    }

    pub fn open_store(&self) -> EmbeddingStore {
        EmbeddingStore::open(&self.store_path).unwrap()
    }
}

pub fn options() -> ReconcileOptions {
    ReconcileOptions { encode_threads: 2, ..Default::default() }
}

/// Config pointing every directory into `lib`'s temp dir.
pub fn test_config(lib: &TestLibrary) -> Config {
    let mut cfg = Config::from_env();
    cfg.library = lib.library.clone();
    cfg.data = lib.data.clone();
    cfg.results = lib.data.join("results");
    cfg.models_dir = lib.data.join("models");
    cfg.encode_threads = 2;
    cfg.face_auto_download = false;
    cfg
}

pub fn create_test_app_state(lib: &TestLibrary, encoder: Arc<FakeEncoder>) -> Arc<AppState> {
    let store = lib.open_store();
    Arc::new(AppState::new(test_config(lib), store, encoder))
}

/// Serve the router on an ephemeral port.
pub async fn spawn_server(state: Arc<AppState>) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = nazr_faces::api::routes::router(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Helper to make HTTP requests to test server
pub struct TestClient {
    pub base_url: String,
    pub client: reqwest::Client,
}

impl TestClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            base_url: format!("http://{}", addr),
            client: reqwest::Client::new(),
        }
    }

    pub async fn get(&self, path: &str) -> reqwest::Result<reqwest::Response> {
        self.client.get(&format!("{}{}", self.base_url, path)).send().await
    }

    pub async fn post(&self, path: &str) -> reqwest::Result<reqwest::Response> {
        self.client.post(&format!("{}{}", self.base_url, path)).send().await
    }

    pub async fn delete(&self, path: &str) -> reqwest::Result<reqwest::Response> {
        self.client.delete(&format!("{}{}", self.base_url, path)).send().await
    }

    /// Upload `bytes` as the `sample_photo` field.
    pub async fn search(&self, query: &str, file_name: &str, bytes: Vec<u8>) -> reqwest::Result<reqwest::Response> {
        let part = reqwest::multipart::Part::bytes(bytes).file_name(file_name.to_string());
        let form = reqwest::multipart::Form::new().part("sample_photo", part);
        self.client
            .post(&format!("{}/search{}", self.base_url, query))
            .multipart(form)
            .send()
            .await
    }
}

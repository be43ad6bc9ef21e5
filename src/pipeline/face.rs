use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use image::DynamicImage;
use ort::session::Session;
use ort::value::Value;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{FaceError, Result};
use crate::face::distance::l2_normalize;
use crate::models::face::{DetectedFace, DetectionModel, Embedding, FaceRegion};
use crate::pipeline::encoder::{DistanceScale, Encoder, ARCFACE_SCALE};

// Model URLs
const SCRFD_MODEL_URL_HF: &str = "https://huggingface.co/ykk648/face_lib/resolve/main/face_detect/scrfd_onnx/scrfd_500m_bnkps.onnx";
const SCRFD_MODEL_URL_GH: &str = "https://github.com/deepinsight/insightface/releases/download/v0.7/scrfd_500m_bnkps.onnx";
const ARCFACE_MODEL_URL: &str = "https://huggingface.co/maze/faceX/resolve/e010b5098c3685fd00b22dd2aec6f37320e3d850/w600k_r50.onnx";

const SCRFD_FILE: &str = "scrfd_500m_bnkps.onnx";
const ARCFACE_FILE: &str = "w600k_r50.onnx";

const FULL_INPUT: u32 = 640;
const FAST_INPUT: u32 = 320;
const ARCFACE_INPUT: u32 = 112;
const STRIDES: [u32; 3] = [8, 16, 32];
const MIN_FACE_PX: f32 = 8.0;

#[derive(Clone, Debug)]
pub struct OnnxSettings {
    pub models_dir: PathBuf,
    pub auto_download: bool,
    pub confidence_threshold: f32,
    pub nms_iou_threshold: f32,
}

/// SCRFD detector + ArcFace recogniser behind the `Encoder` trait.
///
/// Each session sits behind its own mutex; concurrent reconcile workers
/// queue on inference and run decode/resize in parallel.
pub struct OnnxEncoder {
    settings: OnnxSettings,
    scrfd: Option<Mutex<Session>>,
    arcface: Option<Mutex<Session>>,
    // Set once the detector rejects a non-640 input.
    fixed_input: AtomicBool,
}

impl OnnxEncoder {
    pub fn new(settings: OnnxSettings) -> Self {
        Self {
            settings,
            scrfd: None,
            arcface: None,
            fixed_input: AtomicBool::new(false),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.scrfd.is_some() && self.arcface.is_some()
    }

    /// Fetch missing model files (when enabled) and load both sessions.
    /// Failure leaves the encoder unloaded; every encode call then reports
    /// an `Encoder` error.
    pub async fn initialize(&mut self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.settings.models_dir).context("Failed to create models directory")?;

        if self.settings.auto_download {
            if let Err(e) = self.download_models().await {
                warn!("Face model auto-download failed: {}", e);
            }
        } else {
            info!("Face model auto-download disabled.");
        }

        if let Err(e) = self.load_models() {
            warn!("Face models not loaded: {}", e);
        }
        Ok(())
    }

    async fn download_models(&self) -> anyhow::Result<()> {
        let scrfd_path = self.settings.models_dir.join(SCRFD_FILE);
        let arcface_path = self.settings.models_dir.join(ARCFACE_FILE);
        let client = create_http_client()?;

        if !scrfd_path.exists() {
            info!("Downloading SCRFD face detection model...");
            if let Err(e) = download_file(&client, SCRFD_MODEL_URL_HF, &scrfd_path).await {
                warn!("Failed to download from Hugging Face: {}. Trying GitHub...", e);
                download_file(&client, SCRFD_MODEL_URL_GH, &scrfd_path).await?;
            }
        }
        if !arcface_path.exists() {
            info!("Downloading ArcFace recognition model ({})...", ARCFACE_FILE);
            download_file(&client, ARCFACE_MODEL_URL, &arcface_path).await?;
        }
        Ok(())
    }

    fn load_models(&mut self) -> anyhow::Result<()> {
        let scrfd_path = self.settings.models_dir.join(SCRFD_FILE);
        let arcface_path = self.settings.models_dir.join(ARCFACE_FILE);
        if !scrfd_path.exists() || !arcface_path.exists() {
            anyhow::bail!(
                "Face models missing; expected SCRFD at {:?} and ArcFace at {:?}",
                scrfd_path,
                arcface_path
            );
        }

        let scrfd = Session::builder()?
            .commit_from_file(&scrfd_path)
            .context("Failed to create SCRFD session")?;
        let arc = Session::builder()?
            .commit_from_file(&arcface_path)
            .context("Failed to create ArcFace session")?;

        self.scrfd = Some(Mutex::new(scrfd));
        self.arcface = Some(Mutex::new(arc));
        info!("Face models loaded: SCRFD={:?} ArcFace={:?}", scrfd_path, arcface_path);
        Ok(())
    }

    fn input_size(&self, model: DetectionModel) -> u32 {
        match model {
            DetectionModel::Fast if !self.fixed_input.load(Ordering::Relaxed) => FAST_INPUT,
            _ => FULL_INPUT,
        }
    }

    pub fn detect_faces(&self, image: &DynamicImage, model: DetectionModel) -> Result<Vec<FaceRegion>> {
        let size = self.input_size(model);
        match self.detect_at(image, size) {
            Err(e) if size != FULL_INPUT => {
                // Exported with a fixed 640 input; stick to it from now on.
                warn!("SCRFD rejected {}px input ({}); using {}px", size, e, FULL_INPUT);
                self.fixed_input.store(true, Ordering::Relaxed);
                self.detect_at(image, FULL_INPUT)
            }
            other => other,
        }
    }

    fn detect_at(&self, image: &DynamicImage, size: u32) -> Result<Vec<FaceRegion>> {
        let mut session = self
            .scrfd
            .as_ref()
            .ok_or_else(|| FaceError::Encoder("detection model not loaded".into()))?
            .lock();
        let (data, scale) = preprocess_scrfd(image, size);
        let img_w = image.width() as f32;
        let img_h = image.height() as f32;

        let input_name = session.inputs[0].name.clone();
        let input = Value::from_array((vec![1i64, 3, size as i64, size as i64], data)).map_err(ort_error)?;
        let outputs = session.run(ort::inputs![input_name => input]).map_err(ort_error)?;

        // Standard exports name the heads score_8.. / bbox_8..; anonymous
        // exports keep the same order: three score heads then three bbox heads.
        let keys: Vec<String> = outputs.keys().map(|k| k.to_string()).collect();
        let threshold = self.settings.confidence_threshold;
        let mut raw = Vec::new();

        for (i, stride) in STRIDES.iter().enumerate() {
            let score_key = format!("score_{}", stride);
            let bbox_key = format!("bbox_{}", stride);
            let (score_val, bbox_val) = match (outputs.get(&score_key), outputs.get(&bbox_key)) {
                (Some(s), Some(b)) => (s, b),
                _ => match (keys.get(i), keys.get(i + STRIDES.len())) {
                    (Some(sk), Some(bk)) => match (outputs.get(sk), outputs.get(bk)) {
                        (Some(s), Some(b)) => (s, b),
                        _ => continue,
                    },
                    _ => continue,
                },
            };
            let (_, scores) = score_val.try_extract_tensor::<f32>().map_err(ort_error)?;
            let (_, boxes) = bbox_val.try_extract_tensor::<f32>().map_err(ort_error)?;

            let grid = (size / stride) as usize;
            let points = grid * grid;
            if points == 0 || scores.len() % points != 0 || boxes.len() < scores.len() * 4 {
                warn!(
                    "SCRFD stride {}: unexpected head sizes (scores={}, boxes={}, grid={}x{})",
                    stride,
                    scores.len(),
                    boxes.len(),
                    grid,
                    grid
                );
                continue;
            }
            let anchors = scores.len() / points;
            let s = *stride as f32;

            for p in 0..points {
                let cy = (p / grid) as f32 * s;
                let cx = (p % grid) as f32 * s;
                for a in 0..anchors {
                    let idx = p * anchors + a;
                    let conf = scores[idx];
                    if conf < threshold {
                        continue;
                    }
                    let b = idx * 4;
                    let x1 = ((cx - boxes[b] * s) / scale).clamp(0.0, img_w);
                    let y1 = ((cy - boxes[b + 1] * s) / scale).clamp(0.0, img_h);
                    let x2 = ((cx + boxes[b + 2] * s) / scale).clamp(0.0, img_w);
                    let y2 = ((cy + boxes[b + 3] * s) / scale).clamp(0.0, img_h);
                    if x2 - x1 < MIN_FACE_PX || y2 - y1 < MIN_FACE_PX {
                        continue;
                    }
                    raw.push(FaceRegion { x1, y1, x2, y2, confidence: conf });
                }
            }
        }

        let kept = nms(raw, self.settings.nms_iou_threshold);
        debug!("SCRFD {}px: {} face(s) after NMS", size, kept.len());
        Ok(kept)
    }

    pub fn recognize_face(&self, face_crop: &DynamicImage) -> Result<Embedding> {
        let mut session = self
            .arcface
            .as_ref()
            .ok_or_else(|| FaceError::Encoder("recognition model not loaded".into()))?
            .lock();
        let data = preprocess_arcface(face_crop);
        let input_name = session.inputs[0].name.clone();
        let side = ARCFACE_INPUT as i64;
        let input = Value::from_array((vec![1i64, 3, side, side], data)).map_err(ort_error)?;
        let outputs = session.run(ort::inputs![input_name => input]).map_err(ort_error)?;

        // Common names first, otherwise the first head (often numeric like "683").
        let key = outputs
            .keys()
            .find(|k| matches!(*k, "output" | "embedding" | "fc1" | "features"))
            .or_else(|| outputs.keys().next())
            .map(|k| k.to_string())
            .ok_or_else(|| FaceError::Encoder("ArcFace produced no outputs".into()))?;
        let value = outputs
            .get(&key)
            .ok_or_else(|| FaceError::Encoder(format!("ArcFace output {} missing", key)))?;
        let (_, slice) = value.try_extract_tensor::<f32>().map_err(ort_error)?;
        let mut v = slice.to_vec();
        if !l2_normalize(&mut v) {
            return Err(FaceError::Encoder("ArcFace embedding has zero norm".into()));
        }
        Embedding::new(v)
    }
}

impl Encoder for OnnxEncoder {
    fn detect_and_encode(&self, image: &DynamicImage, model: DetectionModel) -> Result<Vec<DetectedFace>> {
        let regions = self.detect_faces(image, model)?;
        let mut faces = Vec::with_capacity(regions.len());
        for region in regions {
            let x1 = region.x1 as u32;
            let y1 = region.y1 as u32;
            let x2 = (region.x2 as u32).min(image.width());
            let y2 = (region.y2 as u32).min(image.height());
            if x2 <= x1 || y2 <= y1 {
                continue;
            }
            let crop = image.crop_imm(x1, y1, x2 - x1, y2 - y1);
            let embedding = self.recognize_face(&crop)?;
            faces.push(DetectedFace { region, embedding });
        }
        Ok(faces)
    }

    // recognize_face normalizes every embedding to unit length
    fn distance_scale(&self) -> DistanceScale {
        ARCFACE_SCALE
    }
}

fn ort_error(e: ort::Error) -> FaceError {
    FaceError::Encoder(e.to_string())
}

fn create_http_client() -> anyhow::Result<reqwest::Client> {
    let mut headers = reqwest::header::HeaderMap::new();
    if let Ok(token) = std::env::var("HF_TOKEN") {
        if !token.is_empty() {
            info!("Using Hugging Face token for model download.");
            headers.insert(
                reqwest::header::AUTHORIZATION,
                reqwest::header::HeaderValue::from_str(&format!("Bearer {}", token))?,
            );
        }
    }
    reqwest::Client::builder()
        .default_headers(headers)
        .build()
        .context("Failed to create HTTP client")
}

async fn download_file(client: &reqwest::Client, url: &str, path: &Path) -> anyhow::Result<()> {
    let response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("Failed to download model from {}", url))?;
    if !response.status().is_success() {
        anyhow::bail!("Failed to download model: HTTP {}", response.status());
    }
    let bytes = response.bytes().await.context("Failed to read response body")?;
    // ONNX files are never this small; an HTML error page usually is.
    if bytes.len() < 1024 {
        anyhow::bail!("Downloaded file is suspiciously small ({} bytes)", bytes.len());
    }
    // Write next to the target and rename so a partial download never
    // looks like a model.
    let tmp = path.with_extension("onnx.part");
    std::fs::write(&tmp, &bytes).with_context(|| format!("Failed to write file: {:?}", tmp))?;
    std::fs::rename(&tmp, path).with_context(|| format!("Failed to move model into place: {:?}", path))?;
    info!("Downloaded model to {:?} ({} bytes)", path, bytes.len());
    Ok(())
}

/// Letterbox into a `size`x`size` BGR tensor (NCHW) normalised to [-1, 1].
/// Returns the data and the scale applied to the original image.
fn preprocess_scrfd(image: &DynamicImage, size: u32) -> (Vec<f32>, f32) {
    let (ow, oh) = (image.width() as f32, image.height() as f32);
    let scale = size as f32 / ow.max(oh);
    let nw = ((ow * scale) as u32).clamp(1, size);
    let nh = ((oh * scale) as u32).clamp(1, size);
    let resized = image.resize_exact(nw, nh, image::imageops::FilterType::Triangle);
    let mut padded = DynamicImage::new_rgb8(size, size);
    image::imageops::overlay(&mut padded, &resized, 0, 0);
    let rgb = padded.to_rgb8();

    let plane = (size * size) as usize;
    let mut data = vec![0f32; 3 * plane];
    for (i, p) in rgb.pixels().enumerate() {
        // InsightFace detectors expect BGR
        data[i] = (p[2] as f32 - 127.5) / 128.0;
        data[plane + i] = (p[1] as f32 - 127.5) / 128.0;
        data[2 * plane + i] = (p[0] as f32 - 127.5) / 128.0;
    }
    (data, scale)
}

fn preprocess_arcface(face_crop: &DynamicImage) -> Vec<f32> {
    let resized = face_crop.resize_exact(ARCFACE_INPUT, ARCFACE_INPUT, image::imageops::FilterType::Triangle);
    let rgb = resized.to_rgb8();
    let plane = (ARCFACE_INPUT * ARCFACE_INPUT) as usize;
    let mut data = vec![0f32; 3 * plane];
    for (i, p) in rgb.pixels().enumerate() {
        for c in 0..3 {
            data[c * plane + i] = (p[c] as f32 - 127.5) / 128.0;
        }
    }
    data
}

/// Greedy non-maximum suppression, highest confidence first.
pub(crate) fn nms(mut boxes: Vec<FaceRegion>, iou_threshold: f32) -> Vec<FaceRegion> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut keep: Vec<FaceRegion> = Vec::new();
    for candidate in boxes {
        if keep.iter().all(|k| k.iou(&candidate) <= iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

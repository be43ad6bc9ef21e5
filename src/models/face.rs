use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{FaceError, Result};
use crate::face::distance;

/// File name of a photo inside a library directory.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageId(String);

impl ImageId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ImageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ImageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A face embedding. Non-empty and finite; immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f32>", into = "Vec<f32>")]
pub struct Embedding(Vec<f32>);

impl Embedding {
    pub fn new(values: Vec<f32>) -> Result<Self> {
        if values.is_empty() {
            return Err(FaceError::InvalidParameter("embedding has no components".into()));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(FaceError::InvalidParameter("embedding contains a non-finite component".into()));
        }
        Ok(Self(values))
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn dim(&self) -> usize {
        self.0.len()
    }

    /// Euclidean distance; mismatched dimensions are an error.
    pub fn distance(&self, other: &Embedding) -> Result<f32> {
        distance::euclidean(&self.0, &other.0)
    }

    /// Little-endian f32 bytes, the on-disk blob layout.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.0.iter().flat_map(|f| f.to_le_bytes()).collect()
    }

    pub fn from_le_bytes(blob: &[u8]) -> Result<Self> {
        if blob.len() % 4 != 0 {
            return Err(FaceError::StoreCorrupt(format!(
                "embedding blob length {} is not a multiple of 4",
                blob.len()
            )));
        }
        let values = blob
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Self::new(values).map_err(|e| FaceError::StoreCorrupt(e.to_string()))
    }
}

impl TryFrom<Vec<f32>> for Embedding {
    type Error = FaceError;

    fn try_from(values: Vec<f32>) -> Result<Self> {
        Self::new(values)
    }
}

impl From<Embedding> for Vec<f32> {
    fn from(e: Embedding) -> Self {
        e.0
    }
}

/// Face bounding box in the coordinates of the image given to the detector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
}

impl FaceRegion {
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn iou(&self, other: &FaceRegion) -> f32 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);
        if x2 <= x1 || y2 <= y1 {
            return 0.0;
        }
        let intersection = (x2 - x1) * (y2 - y1);
        let union = self.width() * self.height() + other.width() * other.height() - intersection;
        if union <= 0.0 {
            return 0.0;
        }
        intersection / union
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedFace {
    pub region: FaceRegion,
    pub embedding: Embedding,
}

/// Source file state captured when a record was encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub size_bytes: i64,
    pub mtime_ns: i64,
    pub xxh3: Option<i64>,
}

impl Fingerprint {
    /// Cheap metadata comparison; content hashes are only consulted when this
    /// reports a difference.
    pub fn same_metadata(&self, other: &Fingerprint) -> bool {
        self.size_bytes == other.size_bytes && self.mtime_ns == other.mtime_ns
    }
}

/// Detector variant hint passed to the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionModel {
    /// Faster, less accurate. Used for library reconciliation.
    #[default]
    Fast,
    Accurate,
}

impl DetectionModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionModel::Fast => "fast",
            DetectionModel::Accurate => "accurate",
        }
    }
}

impl FromStr for DetectionModel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fast" | "hog" => Ok(DetectionModel::Fast),
            "accurate" | "cnn" => Ok(DetectionModel::Accurate),
            other => Err(format!("unknown detection model '{}'", other)),
        }
    }
}

/// Everything known about one library image. An empty `faces` list means the
/// image was scanned and no face was found.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodingRecord {
    pub faces: Vec<DetectedFace>,
    pub fingerprint: Fingerprint,
    pub detection_model: DetectionModel,
    pub encoded_at: i64,
}

impl EncodingRecord {
    pub fn embeddings(&self) -> impl Iterator<Item = &Embedding> {
        self.faces.iter().map(|f| &f.embedding)
    }

    pub fn has_faces(&self) -> bool {
        !self.faces.is_empty()
    }
}

/// Bookkeeping for an image the encoder could not decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodeFailure {
    pub attempts: u32,
    pub last_error: String,
    pub size_bytes: i64,
    pub mtime_ns: i64,
}

/// Label assigned by one clustering run. Numbers carry no identity across runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterLabel {
    Person(usize),
    Noise,
}

impl ClusterLabel {
    pub fn is_noise(&self) -> bool {
        matches!(self, ClusterLabel::Noise)
    }
}

impl fmt::Display for ClusterLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterLabel::Person(n) => write!(f, "person_{}", n),
            ClusterLabel::Noise => f.write_str("noise"),
        }
    }
}

/// Which faces of a multi-face photo feed the clustering step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FacesPerImage {
    #[default]
    First,
    All,
}

impl FromStr for FacesPerImage {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "first" => Ok(FacesPerImage::First),
            "all" => Ok(FacesPerImage::All),
            other => Err(format!("unknown faces-per-image policy '{}'", other)),
        }
    }
}

/// When an already cached image is encoded again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationPolicy {
    /// Cached records are never rescanned; only explicit invalidation clears them.
    #[default]
    Never,
    /// Re-encode when the file's content hash changed since it was cached.
    OnChange,
}

impl FromStr for InvalidationPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "never" => Ok(InvalidationPolicy::Never),
            "on_change" | "on-change" | "onchange" => Ok(InvalidationPolicy::OnChange),
            other => Err(format!("unknown invalidation policy '{}'", other)),
        }
    }
}

use std::path::Path;

use image::imageops::FilterType;
use image::DynamicImage;

use crate::error::{FaceError, Result};
use crate::face::cluster::DEFAULT_EPS;
use crate::face::matcher::DEFAULT_MATCH_THRESHOLD;
use crate::models::face::{DetectedFace, DetectionModel};

/// Euclidean distances an encoder's embeddings are compared at. Used when
/// the match threshold or cluster eps is not configured explicitly.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistanceScale {
    pub match_threshold: f32,
    pub cluster_eps: f32,
}

impl Default for DistanceScale {
    fn default() -> Self {
        Self { match_threshold: DEFAULT_MATCH_THRESHOLD, cluster_eps: DEFAULT_EPS }
    }
}

/// Unit-length 512-d ArcFace embeddings: d = sqrt(2 - 2 cos), so 1.0 accepts
/// pairs with cosine similarity of 0.5 and up, and 0.95 roughly 0.55 and up.
pub const ARCFACE_SCALE: DistanceScale = DistanceScale { match_threshold: 1.0, cluster_eps: 0.95 };

/// Face detection + embedding backend.
///
/// Implementations must be callable from several reconcile workers at once.
/// Both methods may fail; the store records such failures and retries on a
/// later run.
pub trait Encoder: Send + Sync {
    fn decode_image(&self, path: &Path) -> Result<DynamicImage> {
        open_image(path)
    }

    /// One entry per detected face, in detector order. An empty vec means no
    /// face was found, which is not an error.
    fn detect_and_encode(&self, image: &DynamicImage, model: DetectionModel) -> Result<Vec<DetectedFace>>;

    fn distance_scale(&self) -> DistanceScale {
        DistanceScale::default()
    }
}

pub fn open_image(path: &Path) -> Result<DynamicImage> {
    image::open(path).map_err(|e| FaceError::ImageDecode {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Shrink an image by `factor` (0 < factor <= 1) before detection. Smaller
/// inputs detect faster but miss small faces.
pub fn downscale(image: DynamicImage, factor: f32) -> DynamicImage {
    if factor >= 1.0 {
        return image;
    }
    let nw = ((image.width() as f32 * factor).round() as u32).max(1);
    let nh = ((image.height() as f32 * factor).round() as u32).max(1);
    image.resize_exact(nw, nh, FilterType::Triangle)
}

pub fn check_scale_factor(factor: f32) -> Result<()> {
    if !factor.is_finite() || factor <= 0.0 || factor > 1.0 {
        return Err(FaceError::InvalidParameter(format!(
            "scale factor must be in (0, 1], got {}",
            factor
        )));
    }
    Ok(())
}

/// Decode, downscale and encode one library image.
pub fn encode_file(
    encoder: &dyn Encoder,
    path: &Path,
    scale_factor: f32,
    model: DetectionModel,
) -> Result<Vec<DetectedFace>> {
    let image = encoder.decode_image(path)?;
    let image = downscale(image, scale_factor);
    encoder.detect_and_encode(&image, model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn test_downscale_halves_dimensions() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(64, 30, Rgb([10, 20, 30])));
        let small = downscale(img, 0.5);
        assert_eq!((small.width(), small.height()), (32, 15));
    }

    #[test]
    fn test_downscale_never_reaches_zero() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(1, 1, Rgb([0, 0, 0])));
        let small = downscale(img, 0.1);
        assert_eq!((small.width(), small.height()), (1, 1));
    }

    #[test]
    fn test_scale_factor_bounds() {
        assert!(check_scale_factor(0.5).is_ok());
        assert!(check_scale_factor(1.0).is_ok());
        assert!(check_scale_factor(0.0).is_err());
        assert!(check_scale_factor(1.5).is_err());
        assert!(check_scale_factor(f32::NAN).is_err());
    }

    #[test]
    fn test_open_image_reports_decode_failure() {
        let tmp = tempfile::TempDir::new().unwrap();
        let p = tmp.path().join("broken.jpg");
        std::fs::write(&p, b"NOT AN IMAGE FILE").unwrap();
        let err = open_image(&p).unwrap_err();
        assert!(matches!(err, FaceError::ImageDecode { .. }));
        assert!(err.is_retryable());
    }
}

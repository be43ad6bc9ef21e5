use crate::error::{FaceError, Result};
use crate::models::face::Embedding;

fn check_dims(a: &[f32], b: &[f32]) -> Result<()> {
    if a.len() != b.len() {
        return Err(FaceError::DimensionMismatch { expected: a.len(), actual: b.len() });
    }
    Ok(())
}

pub fn squared_euclidean(a: &[f32], b: &[f32]) -> Result<f32> {
    check_dims(a, b)?;
    Ok(a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum())
}

pub fn euclidean(a: &[f32], b: &[f32]) -> Result<f32> {
    squared_euclidean(a, b).map(f32::sqrt)
}

/// Scale `v` to unit length in place. Zero vectors are left untouched and
/// reported as `false`.
pub fn l2_normalize(v: &mut [f32]) -> bool {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm <= 0.0 || !norm.is_finite() {
        return false;
    }
    for x in v.iter_mut() {
        *x /= norm;
    }
    true
}

/// Validates a distance threshold (match threshold or DBSCAN eps).
pub fn check_threshold(name: &str, value: f32) -> Result<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(FaceError::InvalidParameter(format!(
            "{} must be a finite, non-negative distance (got {})",
            name, value
        )));
    }
    Ok(())
}

/// Min / median / max pairwise distance over the first `sample` points.
/// Used for logging so eps and thresholds can be tuned against real data.
pub fn distance_summary(points: &[Embedding], sample: usize) -> Result<Option<(f32, f32, f32)>> {
    let n = points.len().min(sample);
    let mut distances = Vec::with_capacity(n * n.saturating_sub(1) / 2);
    for i in 0..n {
        for j in (i + 1)..n {
            distances.push(points[i].distance(&points[j])?);
        }
    }
    if distances.is_empty() {
        return Ok(None);
    }
    distances.sort_by(|a, b| a.total_cmp(b));
    Ok(Some((distances[0], distances[distances.len() / 2], distances[distances.len() - 1])))
}

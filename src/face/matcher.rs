use std::collections::BTreeSet;
use std::path::Path;

use tracing::debug;

use crate::error::{FaceError, Result};
use crate::face::distance::check_threshold;
use crate::models::face::{DetectionModel, Embedding, EncodingRecord, ImageId};
use crate::pipeline::encoder::Encoder;

/// Default match threshold, on the scale of 128-d dlib-style embeddings.
/// Encoders with another scale report their own through
/// `Encoder::distance_scale`; looser values trade precision for recall.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.55;

/// Identifiers whose record holds at least one embedding within `threshold`
/// of `query`. Each identifier is reported once; scanning a record stops at
/// its first matching face.
pub fn find_matches<'a, I>(query: &Embedding, records: I, threshold: f32) -> Result<BTreeSet<ImageId>>
where
    I: IntoIterator<Item = (&'a ImageId, &'a EncodingRecord)>,
{
    check_threshold("match threshold", threshold)?;
    let mut out = BTreeSet::new();
    for (id, record) in records {
        for embedding in record.embeddings() {
            if query.distance(embedding)? <= threshold {
                out.insert(id.clone());
                break;
            }
        }
    }
    Ok(out)
}

/// Decode a query photo at full resolution and return its first face.
///
/// A photo with no detectable face is `NoFaceDetected`, which the search
/// surface reports to the user instead of an empty match list.
pub fn encode_query(encoder: &dyn Encoder, path: &Path, model: DetectionModel) -> Result<Embedding> {
    let image = encoder.decode_image(path)?;
    let faces = encoder.detect_and_encode(&image, model)?;
    debug!("query {:?}: {} face(s) detected", path, faces.len());
    faces
        .into_iter()
        .next()
        .map(|f| f.embedding)
        .ok_or(FaceError::NoFaceDetected)
}

/// Flattened brute-force index over one store snapshot, for answering
/// several queries without walking the record map each time.
#[derive(Debug, Default, Clone)]
pub struct MatchIndex {
    owners: Vec<ImageId>,
    embeddings: Vec<Embedding>,
    dim: Option<usize>,
}

impl MatchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records<'a, I>(records: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a ImageId, &'a EncodingRecord)>,
    {
        let mut index = Self::new();
        for (id, record) in records {
            for embedding in record.embeddings() {
                index.add(id.clone(), embedding.clone())?;
            }
        }
        Ok(index)
    }

    pub fn add(&mut self, id: ImageId, embedding: Embedding) -> Result<()> {
        match self.dim {
            Some(dim) if dim != embedding.dim() => {
                return Err(FaceError::DimensionMismatch { expected: dim, actual: embedding.dim() });
            }
            None => self.dim = Some(embedding.dim()),
            _ => {}
        }
        self.owners.push(id);
        self.embeddings.push(embedding);
        Ok(())
    }

    /// Number of indexed faces (not images).
    pub fn len(&self) -> usize {
        self.embeddings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.embeddings.is_empty()
    }

    pub fn matches(&self, query: &Embedding, threshold: f32) -> Result<BTreeSet<ImageId>> {
        check_threshold("match threshold", threshold)?;
        self.check_query(query)?;
        let mut out = BTreeSet::new();
        for (owner, embedding) in self.owners.iter().zip(self.embeddings.iter()) {
            if out.contains(owner) {
                continue;
            }
            if query.distance(embedding)? <= threshold {
                out.insert(owner.clone());
            }
        }
        Ok(out)
    }

    /// The `k` closest faces in ascending distance; ties are broken by image id.
    pub fn nearest(&self, query: &Embedding, k: usize) -> Result<Vec<(ImageId, f32)>> {
        self.check_query(query)?;
        let mut results = self
            .owners
            .iter()
            .zip(self.embeddings.iter())
            .map(|(owner, embedding)| -> Result<(ImageId, f32)> { Ok((owner.clone(), query.distance(embedding)?)) })
            .collect::<Result<Vec<_>>>()?;
        results.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        results.truncate(k);
        Ok(results)
    }

    fn check_query(&self, query: &Embedding) -> Result<()> {
        match self.dim {
            Some(dim) if dim != query.dim() => Err(FaceError::DimensionMismatch { expected: dim, actual: query.dim() }),
            _ => Ok(()),
        }
    }
}

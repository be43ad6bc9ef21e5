// Density-based clustering of face embeddings
// --------------------------------------------
//
// Plain DBSCAN over Euclidean distance. Neighbourhoods are computed with an
// O(n^2) pairwise scan split across the rayon pool (rows are independent),
// followed by an O(n + E) breadth-first expansion. High-dimensional face
// embeddings defeat kd-tree style indexes, so the pairwise scan is the
// baseline; it stays interactive up to a few tens of thousands of faces.
// Neighbour lists are held in memory, so very dense inputs (most points
// within eps of each other) cost O(n^2) memory as well.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use rayon::prelude::*;

use crate::error::{FaceError, Result};
use crate::face::distance::{check_threshold, euclidean};
use crate::models::face::{ClusterLabel, Embedding, EncodingRecord, FacesPerImage, ImageId};

/// eps: 0.4 (strict) to 0.6 (loose) for 128-d dlib-style embeddings. Unit
/// length ArcFace embeddings need about 0.95, see `ARCFACE_SCALE`.
pub const DEFAULT_EPS: f32 = 0.5;
pub const DEFAULT_MIN_SAMPLES: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DbscanParams {
    /// Maximum distance for two points to be directly reachable.
    pub eps: f32,
    /// Neighbourhood size (the point itself included) that makes a core point.
    pub min_samples: usize,
}

impl Default for DbscanParams {
    fn default() -> Self {
        Self { eps: DEFAULT_EPS, min_samples: DEFAULT_MIN_SAMPLES }
    }
}

impl DbscanParams {
    pub fn new(eps: f32, min_samples: usize) -> Self {
        Self { eps, min_samples }
    }

    pub fn validate(&self) -> Result<()> {
        check_threshold("eps", self.eps)?;
        if self.min_samples == 0 {
            return Err(FaceError::InvalidParameter("min_samples must be at least 1".into()));
        }
        Ok(())
    }
}

fn check_uniform_dims(points: &[Embedding]) -> Result<()> {
    if let Some(first) = points.first() {
        let expected = first.dim();
        if let Some(bad) = points.iter().find(|p| p.dim() != expected) {
            return Err(FaceError::DimensionMismatch { expected, actual: bad.dim() });
        }
    }
    Ok(())
}

fn neighborhoods(points: &[Embedding], eps: f32) -> Result<Vec<Vec<usize>>> {
    (0..points.len())
        .into_par_iter()
        .map(|i| -> Result<Vec<usize>> {
            let mut row = Vec::new();
            for (j, other) in points.iter().enumerate() {
                if euclidean(points[i].as_slice(), other.as_slice())? <= eps {
                    row.push(j);
                }
            }
            Ok(row)
        })
        .collect()
}

/// Label every point. Points are visited in input order and clusters are
/// numbered in discovery order, so identical input yields identical labels.
/// A border point reachable from two clusters stays with the first one that
/// claimed it.
pub fn dbscan(points: &[Embedding], params: &DbscanParams) -> Result<Vec<ClusterLabel>> {
    params.validate()?;
    if points.is_empty() {
        return Ok(Vec::new());
    }
    check_uniform_dims(points)?;

    let neighbors = neighborhoods(points, params.eps)?;
    let is_core = |i: usize| neighbors[i].len() >= params.min_samples;

    let mut labels: Vec<Option<ClusterLabel>> = vec![None; points.len()];
    let mut next_cluster = 0usize;

    for i in 0..points.len() {
        if labels[i].is_some() {
            continue;
        }
        if !is_core(i) {
            // May still be claimed as a border point by a later cluster.
            labels[i] = Some(ClusterLabel::Noise);
            continue;
        }

        let label = ClusterLabel::Person(next_cluster);
        next_cluster += 1;
        labels[i] = Some(label);

        let mut queue: VecDeque<usize> = neighbors[i].iter().copied().collect();
        while let Some(j) = queue.pop_front() {
            match labels[j] {
                Some(ClusterLabel::Noise) => labels[j] = Some(label),
                None => {
                    labels[j] = Some(label);
                    if is_core(j) {
                        queue.extend(neighbors[j].iter().copied());
                    }
                }
                Some(ClusterLabel::Person(_)) => {}
            }
        }
    }

    Ok(labels.into_iter().map(|l| l.unwrap_or(ClusterLabel::Noise)).collect())
}

/// Result of clustering a set of `(ImageId, Embedding)` points.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Clustering {
    /// One entry per input point, in input order.
    pub assignments: Vec<(ImageId, ClusterLabel)>,
    pub cluster_count: usize,
    pub noise_count: usize,
}

impl Clustering {
    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    /// Label of the first point contributed by `id`.
    pub fn label_of(&self, id: &ImageId) -> Option<ClusterLabel> {
        self.assignments.iter().find(|(i, _)| i == id).map(|(_, l)| *l)
    }

    /// Images per label, noise last. An image appears once per group even if
    /// several of its faces landed there.
    pub fn groups(&self) -> BTreeMap<ClusterLabel, Vec<ImageId>> {
        let mut out: BTreeMap<ClusterLabel, Vec<ImageId>> = BTreeMap::new();
        let mut seen: BTreeSet<(ClusterLabel, &ImageId)> = BTreeSet::new();
        for (id, label) in &self.assignments {
            if seen.insert((*label, id)) {
                out.entry(*label).or_default().push(id.clone());
            }
        }
        out
    }
}

pub fn cluster_images(points: &[(ImageId, Embedding)], params: &DbscanParams) -> Result<Clustering> {
    let embeddings: Vec<Embedding> = points.iter().map(|(_, e)| e.clone()).collect();
    let labels = dbscan(&embeddings, params)?;
    let cluster_count = labels
        .iter()
        .filter_map(|l| match l {
            ClusterLabel::Person(n) => Some(*n + 1),
            ClusterLabel::Noise => None,
        })
        .max()
        .unwrap_or(0);
    let noise_count = labels.iter().filter(|l| l.is_noise()).count();
    let assignments = points.iter().map(|(id, _)| id.clone()).zip(labels).collect();
    Ok(Clustering { assignments, cluster_count, noise_count })
}

/// Clustering input drawn from store records. Images without faces are
/// skipped; with `FacesPerImage::First` a group photo is represented by its
/// first detected face only.
pub fn collect_points<'a, I>(records: I, policy: FacesPerImage) -> Vec<(ImageId, Embedding)>
where
    I: IntoIterator<Item = (&'a ImageId, &'a EncodingRecord)>,
{
    let mut out = Vec::new();
    for (id, record) in records {
        match policy {
            FacesPerImage::First => {
                if let Some(e) = record.embeddings().next() {
                    out.push((id.clone(), e.clone()));
                }
            }
            FacesPerImage::All => {
                out.extend(record.embeddings().map(|e| (id.clone(), e.clone())));
            }
        }
    }
    out
}

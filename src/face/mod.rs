//! Matching and clustering over face embeddings. Callers hand in store
//! contents and get identifiers back; only `encode_query` reads a file.

pub mod cluster;
pub mod distance;
pub mod matcher;

pub use cluster::{cluster_images, collect_points, dbscan, Clustering, DbscanParams};
pub use matcher::{encode_query, find_matches, MatchIndex, DEFAULT_MATCH_THRESHOLD};

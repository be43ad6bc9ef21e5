use std::path::PathBuf;

/// Errors raised by the face store, match and cluster engines.
///
/// Only `DimensionMismatch`, `InvalidParameter` and `Store` are meant to
/// reach the caller as hard failures. Decode failures are absorbed by
/// reconciliation, corruption is absorbed by `EmbeddingStore::open`, and
/// result copy failures are collected per file.
#[derive(Debug, thiserror::Error)]
pub enum FaceError {
    #[error("failed to decode image {path:?}: {reason}")]
    ImageDecode { path: PathBuf, reason: String },

    #[error("no face detected")]
    NoFaceDetected,

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("embedding store is corrupt: {0}")]
    StoreCorrupt(String),

    #[error("failed to write result {path:?}: {source}")]
    ResultIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("encoder failure: {0}")]
    Encoder(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FaceError {
    /// Failures the reconciler records and retries on a later run instead of
    /// aborting.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FaceError::ImageDecode { .. } | FaceError::Encoder(_))
    }
}

pub type Result<T> = std::result::Result<T, FaceError>;

//! Persistent `ImageId -> EncodingRecord` cache for one photo library.
//!
//! The SQLite file is the source of truth; the in-memory maps mirror it as
//! of the last open/reconcile. Reconcile holds an `IMMEDIATE` transaction for
//! its whole read/encode/write sequence, so two processes sharing a store
//! never encode the same image twice and never lose each other's rows.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use rayon::prelude::*;
use rusqlite::{Connection, TransactionBehavior};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::db::{self, query, writer};
use crate::error::{FaceError, Result};
use crate::models::face::{
    DecodeFailure, DetectedFace, DetectionModel, EncodingRecord, Fingerprint, ImageId, InvalidationPolicy,
};
use crate::pipeline::discover::{scan_library, LibraryImage};
use crate::pipeline::encoder::{check_scale_factor, encode_file, Encoder};
use crate::pipeline::hash::hash_file;

pub const DEFAULT_SCALE_FACTOR: f32 = 0.5;
pub const DEFAULT_MAX_DECODE_ATTEMPTS: u32 = 3;
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct ReconcileOptions {
    /// Downscale applied before detection, 0 < f <= 1.
    pub scale_factor: f32,
    pub detection_model: DetectionModel,
    pub encode_threads: usize,
    pub invalidation: InvalidationPolicy,
    /// Failed decodes before an image is skipped; 0 retries forever.
    pub max_decode_attempts: u32,
    /// Drop records whose file is gone from the library.
    pub prune_missing: bool,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            scale_factor: DEFAULT_SCALE_FACTOR,
            detection_model: DetectionModel::Fast,
            encode_threads: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(2),
            invalidation: InvalidationPolicy::Never,
            max_decode_attempts: DEFAULT_MAX_DECODE_ATTEMPTS,
            prune_missing: false,
        }
    }
}

impl ReconcileOptions {
    pub fn validate(&self) -> Result<()> {
        check_scale_factor(self.scale_factor)?;
        if self.encode_threads == 0 {
            return Err(FaceError::InvalidParameter("encode_threads must be at least 1".into()));
        }
        Ok(())
    }

    fn is_quarantined(&self, failure: &DecodeFailure, image: &LibraryImage) -> bool {
        self.max_decode_attempts > 0
            && failure.attempts >= self.max_decode_attempts
            && image.same_metadata(failure.size_bytes, failure.mtime_ns)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Library images seen on disk.
    pub scanned: usize,
    /// Images encoded for the first time.
    pub encoded: usize,
    /// Cached images encoded again after their content changed.
    pub reencoded: usize,
    /// Cached images whose size/mtime moved but whose content did not.
    pub refreshed: usize,
    pub faces_found: usize,
    pub decode_failures: usize,
    /// Images skipped because they failed too often.
    pub quarantined: usize,
    pub pruned: usize,
    /// Whether the store file was written.
    pub persisted: bool,
    pub elapsed_ms: u64,
}

/// Maps a library directory to its own store file under `data_dir`, so two
/// libraries never share identifiers.
pub fn store_path_for(data_dir: &Path, library_dir: &Path) -> Result<PathBuf> {
    let canonical = std::fs::canonicalize(library_dir)?;
    let digest = xxhash_rust::xxh3::xxh3_64(canonical.to_string_lossy().as_bytes());
    Ok(data_dir.join("stores").join(format!("{}.db", hex::encode(digest.to_be_bytes()))))
}

pub struct EmbeddingStore {
    path: PathBuf,
    busy_timeout: Duration,
    // None until the file exists; an empty library never creates it.
    conn: Option<Connection>,
    // Built on first encode, rebuilt only when the thread count changes.
    pool: Option<rayon::ThreadPool>,
    records: BTreeMap<ImageId, EncodingRecord>,
    failures: BTreeMap<ImageId, DecodeFailure>,
}

struct Candidate {
    image: LibraryImage,
    previous: Option<Fingerprint>,
}

enum Work {
    Refreshed(Fingerprint),
    Encoded(Fingerprint, Vec<DetectedFace>),
    Failed(FaceError),
}

struct Merged {
    report: ReconcileReport,
    records: BTreeMap<ImageId, EncodingRecord>,
    failures: BTreeMap<ImageId, DecodeFailure>,
}

impl EmbeddingStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    /// Load the store at `path`, or start empty if there is none. An
    /// unreadable file is moved aside and replaced by an empty store.
    pub fn open_with_timeout(path: impl Into<PathBuf>, busy_timeout: Duration) -> Result<Self> {
        let mut store = Self {
            path: path.into(),
            busy_timeout,
            conn: None,
            pool: None,
            records: BTreeMap::new(),
            failures: BTreeMap::new(),
        };
        if !store.path.exists() {
            debug!("no embedding store at {:?}; starting empty", store.path);
            return Ok(store);
        }

        match load_existing(&store.path, busy_timeout) {
            Ok((conn, records, failures)) => {
                info!(
                    "loaded embedding store {:?}: {} records, {} pending failures",
                    store.path,
                    records.len(),
                    failures.len()
                );
                store.conn = Some(conn);
                store.records = records;
                store.failures = failures;
            }
            Err(e) if db::is_corruption(&e) => {
                let moved = move_aside(&store.path)?;
                warn!(
                    "embedding store {:?} is unreadable ({}); moved to {:?}, starting empty",
                    store.path, e, moved
                );
            }
            Err(e) => return Err(e),
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, id: &ImageId) -> Option<&EncodingRecord> {
        self.records.get(id)
    }

    pub fn contains(&self, id: &ImageId) -> bool {
        self.records.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records in identifier order.
    pub fn iter(&self) -> impl Iterator<Item = (&ImageId, &EncodingRecord)> {
        self.records.iter()
    }

    pub fn records(&self) -> &BTreeMap<ImageId, EncodingRecord> {
        &self.records
    }

    pub fn face_count(&self) -> usize {
        self.records.values().map(|r| r.faces.len()).sum()
    }

    /// Dimensionality of the stored embeddings, if any face is stored.
    pub fn dimension(&self) -> Option<usize> {
        self.records.values().flat_map(|r| r.embeddings()).map(|e| e.dim()).next()
    }

    pub fn failures(&self) -> &BTreeMap<ImageId, DecodeFailure> {
        &self.failures
    }

    /// Identifiers that reached `max_attempts` failed decodes.
    pub fn quarantined(&self, max_attempts: u32) -> Vec<(&ImageId, &DecodeFailure)> {
        if max_attempts == 0 {
            return Vec::new();
        }
        self.failures.iter().filter(|(_, f)| f.attempts >= max_attempts).collect()
    }

    /// Forget one image so the next reconcile encodes it again. Clears its
    /// failure bookkeeping too. Returns whether anything was removed.
    pub fn invalidate(&mut self, id: &ImageId) -> Result<bool> {
        let mut removed = false;
        if let Some(conn) = self.conn.as_mut() {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            removed |= writer::delete_record(&tx, id)?;
            removed |= writer::delete_failure(&tx, id)?;
            if removed {
                tx.commit()?;
            }
        }
        removed |= self.records.remove(id).is_some();
        removed |= self.failures.remove(id).is_some();
        if removed {
            info!("invalidated {}", id);
        }
        Ok(removed)
    }

    /// Drop every record. Returns how many records were removed.
    pub fn clear(&mut self) -> Result<usize> {
        let mut removed = self.records.len();
        if let Some(conn) = self.conn.as_mut() {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            removed = removed.max(writer::clear_all(&tx)?);
            tx.commit()?;
        }
        self.records.clear();
        self.failures.clear();
        info!("cleared embedding store {:?} ({} records)", self.path, removed);
        Ok(removed)
    }

    /// Bring the store in line with `library_dir`: every image gets exactly
    /// one record, and images already cached are not encoded again.
    pub fn reconcile(
        &mut self,
        library_dir: &Path,
        encoder: &dyn Encoder,
        opts: &ReconcileOptions,
    ) -> Result<ReconcileReport> {
        opts.validate()?;
        let started = Instant::now();
        let images = scan_library(library_dir)?;

        if self.conn.is_none() && images.is_empty() && !self.path.exists() {
            debug!("library {:?} is empty; nothing to reconcile", library_dir);
            return Ok(ReconcileReport {
                elapsed_ms: started.elapsed().as_millis() as u64,
                ..Default::default()
            });
        }

        self.ensure_connection()?;
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| FaceError::StoreCorrupt("store connection unavailable".into()))?;
        let merged = reconcile_locked(conn, &mut self.pool, images, encoder, opts)?;

        self.records = merged.records;
        self.failures = merged.failures;
        let mut report = merged.report;
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            "reconciled {:?}: scanned={} encoded={} reencoded={} refreshed={} faces={} failures={} quarantined={} pruned={} persisted={} in {}ms",
            library_dir,
            report.scanned,
            report.encoded,
            report.reencoded,
            report.refreshed,
            report.faces_found,
            report.decode_failures,
            report.quarantined,
            report.pruned,
            report.persisted,
            report.elapsed_ms
        );
        Ok(report)
    }

    fn ensure_connection(&mut self) -> Result<()> {
        if self.conn.is_none() {
            if let Some(parent) = self.path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let conn = db::open_or_create(&self.path, self.busy_timeout)?;
            info!("created embedding store {:?}", self.path);
            self.conn = Some(conn);
        }
        Ok(())
    }
}

fn load_existing(
    path: &Path,
    busy_timeout: Duration,
) -> Result<(Connection, BTreeMap<ImageId, EncodingRecord>, BTreeMap<ImageId, DecodeFailure>)> {
    let mut conn = db::open_or_create(path, busy_timeout)?;
    let (records, failures) = {
        // one snapshot for both tables
        let tx = conn.transaction()?;
        let records = query::load_records(&tx)?;
        let failures = query::load_failures(&tx)?;
        (records, failures)
    };
    Ok((conn, records, failures))
}

/// Rename a broken store file (and its WAL siblings) to
/// `<name>.corrupt-<unix_ts>`.
fn move_aside(path: &Path) -> Result<PathBuf> {
    let ts = chrono::Utc::now().timestamp();
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "store.db".to_string());
    let target = path.with_file_name(format!("{}.corrupt-{}", name, ts));
    std::fs::rename(path, &target)?;
    for suffix in ["-wal", "-shm"] {
        let sibling = PathBuf::from(format!("{}{}", path.display(), suffix));
        if sibling.exists() {
            let moved = PathBuf::from(format!("{}{}", target.display(), suffix));
            if let Err(e) = std::fs::rename(&sibling, &moved) {
                warn!("could not move {:?} aside: {}", sibling, e);
            }
        }
    }
    Ok(target)
}

fn encode_pool(slot: &mut Option<rayon::ThreadPool>, threads: usize) -> Result<&rayon::ThreadPool> {
    if slot.as_ref().map(|p| p.current_num_threads()) != Some(threads) {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("nazr-encode-{}", i))
            .build()
            .map_err(|e| FaceError::Encoder(format!("failed to start encode pool: {}", e)))?;
        debug!("started encode pool with {} worker(s)", threads);
        let pool: &rayon::ThreadPool = slot.insert(pool);
        return Ok(pool);
    }
    slot.as_ref()
        .ok_or_else(|| FaceError::Encoder("encode pool unavailable".into()))
}

fn reconcile_locked(
    conn: &mut Connection,
    pool: &mut Option<rayon::ThreadPool>,
    images: Vec<LibraryImage>,
    encoder: &dyn Encoder,
    opts: &ReconcileOptions,
) -> Result<Merged> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    // Re-read under the lock: another process may have written since open.
    let mut records = query::load_records(&tx)?;
    let mut failures = query::load_failures(&tx)?;
    let mut report = ReconcileReport { scanned: images.len(), ..Default::default() };
    let mut changed = false;

    let mut candidates = Vec::new();
    for image in &images {
        let previous = match records.get(&image.id) {
            None => None,
            Some(rec) if opts.invalidation == InvalidationPolicy::OnChange
                && !image.same_metadata(rec.fingerprint.size_bytes, rec.fingerprint.mtime_ns) =>
            {
                Some(rec.fingerprint)
            }
            Some(_) => continue,
        };
        if let Some(failure) = failures.get(&image.id) {
            if opts.is_quarantined(failure, image) {
                debug!("skipping quarantined {} ({} failed attempts)", image.id, failure.attempts);
                report.quarantined += 1;
                continue;
            }
        }
        candidates.push(Candidate { image: image.clone(), previous });
    }

    let results: Vec<Work> = if candidates.is_empty() {
        Vec::new()
    } else {
        info!("encoding {} image(s) on {} worker(s)", candidates.len(), opts.encode_threads);
        let pool = encode_pool(pool, opts.encode_threads)?;
        pool.install(|| candidates.par_iter().map(|c| process(c, encoder, opts)).collect())
    };

    let now = chrono::Utc::now().timestamp();
    let mut dim = records.values().flat_map(|r| r.embeddings()).map(|e| e.dim()).next();

    // Candidates are in identifier order, so results apply deterministically.
    for (candidate, work) in candidates.iter().zip(results) {
        let image = &candidate.image;
        let id = &image.id;
        match work {
            Work::Refreshed(fingerprint) => {
                writer::update_fingerprint(&tx, id, &fingerprint)?;
                if let Some(rec) = records.get_mut(id) {
                    rec.fingerprint = fingerprint;
                }
                debug!("{} touched but unchanged; fingerprint refreshed", id);
                report.refreshed += 1;
                changed = true;
            }
            Work::Encoded(fingerprint, faces) => {
                for face in &faces {
                    match dim {
                        Some(expected) if expected != face.embedding.dim() => {
                            return Err(FaceError::DimensionMismatch { expected, actual: face.embedding.dim() });
                        }
                        None => dim = Some(face.embedding.dim()),
                        _ => {}
                    }
                }
                if candidate.previous.is_some() {
                    info!("photo changed: {}. re-scanned, {} face(s)", id, faces.len());
                    report.reencoded += 1;
                } else {
                    info!("new photo detected: {}. scanned, {} face(s)", id, faces.len());
                    report.encoded += 1;
                }
                report.faces_found += faces.len();
                let record = EncodingRecord {
                    faces,
                    fingerprint,
                    detection_model: opts.detection_model,
                    encoded_at: now,
                };
                writer::upsert_record(&tx, id, &record)?;
                if failures.remove(id).is_some() {
                    writer::delete_failure(&tx, id)?;
                }
                records.insert(id.clone(), record);
                changed = true;
            }
            Work::Failed(e) if e.is_retryable() => {
                // A file that changed since its last failure starts over.
                let attempts = match failures.get(id) {
                    Some(f) if image.same_metadata(f.size_bytes, f.mtime_ns) => f.attempts.saturating_add(1),
                    _ => 1,
                };
                warn!("could not encode {} (attempt {}): {}", id, attempts, e);
                let failure = DecodeFailure {
                    attempts,
                    last_error: e.to_string(),
                    size_bytes: image.size_bytes,
                    mtime_ns: image.mtime_ns,
                };
                writer::upsert_failure(&tx, id, &failure, now)?;
                failures.insert(id.clone(), failure);
                report.decode_failures += 1;
                changed = true;
            }
            Work::Failed(e) => return Err(e),
        }
    }

    if opts.prune_missing {
        let present: BTreeSet<&ImageId> = images.iter().map(|i| &i.id).collect();
        let stale: Vec<ImageId> = records.keys().filter(|id| !present.contains(id)).cloned().collect();
        for id in stale {
            writer::delete_record(&tx, &id)?;
            records.remove(&id);
            debug!("pruned {} (file no longer in library)", id);
            report.pruned += 1;
            changed = true;
        }
        let gone: Vec<ImageId> = failures.keys().filter(|id| !present.contains(id)).cloned().collect();
        for id in gone {
            writer::delete_failure(&tx, &id)?;
            failures.remove(&id);
            changed = true;
        }
    }

    if changed {
        tx.commit()?;
        report.persisted = true;
    } else {
        tx.rollback()?;
    }
    Ok(Merged { report, records, failures })
}

fn process(candidate: &Candidate, encoder: &dyn Encoder, opts: &ReconcileOptions) -> Work {
    let image = &candidate.image;
    let xxh3 = match hash_file(&image.path) {
        Ok(h) => h,
        Err(e) => {
            return Work::Failed(FaceError::ImageDecode {
                path: image.path.clone(),
                reason: e.to_string(),
            })
        }
    };
    let fingerprint = Fingerprint {
        size_bytes: image.size_bytes,
        mtime_ns: image.mtime_ns,
        xxh3: Some(xxh3),
    };
    if let Some(previous) = &candidate.previous {
        if previous.xxh3 == fingerprint.xxh3 {
            return Work::Refreshed(fingerprint);
        }
    }
    match encode_file(encoder, &image.path, opts.scale_factor, opts.detection_model) {
        Ok(faces) => Work::Encoded(fingerprint, faces),
        Err(e) => Work::Failed(e),
    }
}

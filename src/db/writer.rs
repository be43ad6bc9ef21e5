use rusqlite::{params, Connection};

use crate::error::{FaceError, Result};
use crate::models::face::{DecodeFailure, EncodingRecord, Fingerprint, ImageId};

/// Replace the record for `id`, faces included.
pub fn upsert_record(conn: &Connection, id: &ImageId, record: &EncodingRecord) -> Result<()> {
    conn.execute("DELETE FROM face_embeddings WHERE image_id = ?1", params![id.as_str()])?;
    conn.execute(
        "INSERT INTO images (id, size_bytes, mtime_ns, xxh3, detection_model, encoded_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(id) DO UPDATE SET size_bytes=excluded.size_bytes, mtime_ns=excluded.mtime_ns, xxh3=excluded.xxh3, detection_model=excluded.detection_model, encoded_at=excluded.encoded_at",
        params![
            id.as_str(),
            record.fingerprint.size_bytes,
            record.fingerprint.mtime_ns,
            record.fingerprint.xxh3,
            record.detection_model.as_str(),
            record.encoded_at,
        ],
    )?;
    let mut stmt = conn.prepare_cached(
        "INSERT INTO face_embeddings (image_id, face_index, embedding_blob, bbox_json, confidence) VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    for (idx, face) in record.faces.iter().enumerate() {
        let bbox_json = serde_json::to_string(&face.region).map_err(|e| FaceError::StoreCorrupt(e.to_string()))?;
        stmt.execute(params![
            id.as_str(),
            idx as i64,
            face.embedding.to_le_bytes(),
            bbox_json,
            face.region.confidence as f64,
        ])?;
    }
    Ok(())
}

pub fn update_fingerprint(conn: &Connection, id: &ImageId, fingerprint: &Fingerprint) -> Result<bool> {
    let n = conn.execute(
        "UPDATE images SET size_bytes = ?2, mtime_ns = ?3, xxh3 = ?4 WHERE id = ?1",
        params![id.as_str(), fingerprint.size_bytes, fingerprint.mtime_ns, fingerprint.xxh3],
    )?;
    Ok(n > 0)
}

pub fn delete_record(conn: &Connection, id: &ImageId) -> Result<bool> {
    conn.execute("DELETE FROM face_embeddings WHERE image_id = ?1", params![id.as_str()])?;
    let n = conn.execute("DELETE FROM images WHERE id = ?1", params![id.as_str()])?;
    Ok(n > 0)
}

pub fn upsert_failure(conn: &Connection, id: &ImageId, failure: &DecodeFailure, updated_at: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO decode_failures (image_id, attempts, last_error, size_bytes, mtime_ns, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(image_id) DO UPDATE SET attempts=excluded.attempts, last_error=excluded.last_error, size_bytes=excluded.size_bytes, mtime_ns=excluded.mtime_ns, updated_at=excluded.updated_at",
        params![
            id.as_str(),
            failure.attempts as i64,
            failure.last_error,
            failure.size_bytes,
            failure.mtime_ns,
            updated_at,
        ],
    )?;
    Ok(())
}

pub fn delete_failure(conn: &Connection, id: &ImageId) -> Result<bool> {
    let n = conn.execute("DELETE FROM decode_failures WHERE image_id = ?1", params![id.as_str()])?;
    Ok(n > 0)
}

/// Drop every record and failure. Returns the number of image records removed.
pub fn clear_all(conn: &Connection) -> Result<usize> {
    conn.execute("DELETE FROM face_embeddings", [])?;
    let images = conn.execute("DELETE FROM images", [])?;
    conn.execute("DELETE FROM decode_failures", [])?;
    Ok(images)
}

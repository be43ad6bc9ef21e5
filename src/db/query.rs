use std::collections::BTreeMap;

use rusqlite::Connection;

use crate::error::{FaceError, Result};
use crate::models::face::{DecodeFailure, DetectedFace, DetectionModel, Embedding, EncodingRecord, FaceRegion, Fingerprint, ImageId};

/// Every persisted record, faces in detector order. Rows that cannot be
/// decoded are reported as `StoreCorrupt`.
pub fn load_records(conn: &Connection) -> Result<BTreeMap<ImageId, EncodingRecord>> {
    let mut records = BTreeMap::new();
    {
        let mut stmt = conn.prepare("SELECT id, size_bytes, mtime_ns, xxh3, detection_model, encoded_at FROM images")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, Option<i64>>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;
        for row in rows {
            let (id, size_bytes, mtime_ns, xxh3, model, encoded_at) = row?;
            let detection_model: DetectionModel = model.parse().map_err(FaceError::StoreCorrupt)?;
            records.insert(
                ImageId::new(id),
                EncodingRecord {
                    faces: Vec::new(),
                    fingerprint: Fingerprint { size_bytes, mtime_ns, xxh3 },
                    detection_model,
                    encoded_at,
                },
            );
        }
    }

    let mut stmt = conn.prepare(
        "SELECT image_id, embedding_blob, bbox_json, confidence FROM face_embeddings ORDER BY image_id, face_index",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, Vec<u8>>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, f64>(3)?,
        ))
    })?;
    for row in rows {
        let (image_id, blob, bbox_json, confidence) = row?;
        let record = records
            .get_mut(&ImageId::new(image_id.as_str()))
            .ok_or_else(|| FaceError::StoreCorrupt(format!("face row for unknown image {}", image_id)))?;
        let embedding = Embedding::from_le_bytes(&blob)?;
        let mut region: FaceRegion = serde_json::from_str(&bbox_json)
            .map_err(|e| FaceError::StoreCorrupt(format!("bad bbox for {}: {}", image_id, e)))?;
        region.confidence = confidence as f32;
        record.faces.push(DetectedFace { region, embedding });
    }
    Ok(records)
}

pub fn load_failures(conn: &Connection) -> Result<BTreeMap<ImageId, DecodeFailure>> {
    let mut stmt = conn.prepare("SELECT image_id, attempts, last_error, size_bytes, mtime_ns FROM decode_failures")?;
    let rows = stmt.query_map([], |row| {
        Ok((
            ImageId::new(row.get::<_, String>(0)?),
            DecodeFailure {
                attempts: row.get::<_, i64>(1)?.max(0) as u32,
                last_error: row.get(2)?,
                size_bytes: row.get(3)?,
                mtime_ns: row.get(4)?,
            },
        ))
    })?;
    let mut out = BTreeMap::new();
    for row in rows {
        let (id, failure) = row?;
        out.insert(id, failure);
    }
    Ok(out)
}

use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{FaceError, Result};

pub const SCHEMA_VERSION: &str = "1";

pub fn apply_pragmas(conn: &Connection, busy_timeout: Duration) -> Result<()> {
    conn.busy_timeout(busy_timeout)?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.pragma_update(None, "mmap_size", 268435456i64)?;
    Ok(())
}

pub fn apply_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS store_meta (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS images (
  id TEXT PRIMARY KEY,
  size_bytes INTEGER NOT NULL,
  mtime_ns INTEGER NOT NULL,
  xxh3 INTEGER,
  detection_model TEXT NOT NULL,
  encoded_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS face_embeddings (
  id INTEGER PRIMARY KEY,
  image_id TEXT NOT NULL,
  face_index INTEGER NOT NULL,
  embedding_blob BLOB NOT NULL,
  bbox_json TEXT NOT NULL,
  confidence REAL NOT NULL,
  FOREIGN KEY(image_id) REFERENCES images(id)
);

CREATE INDEX IF NOT EXISTS idx_face_embeddings_image ON face_embeddings(image_id, face_index);

CREATE TABLE IF NOT EXISTS decode_failures (
  image_id TEXT PRIMARY KEY,
  attempts INTEGER NOT NULL,
  last_error TEXT NOT NULL,
  size_bytes INTEGER NOT NULL,
  mtime_ns INTEGER NOT NULL,
  updated_at INTEGER NOT NULL
);
    "#,
    )?;

    let version: Option<String> = conn
        .query_row("SELECT value FROM store_meta WHERE key = 'schema_version'", [], |row| row.get(0))
        .optional()?;
    match version.as_deref() {
        // Only a brand new file gets the version row, so reopening an
        // existing store never writes.
        None => {
            conn.execute(
                "INSERT INTO store_meta (key, value) VALUES ('schema_version', ?1)",
                params![SCHEMA_VERSION],
            )?;
        }
        Some(SCHEMA_VERSION) => {}
        Some(other) => {
            return Err(FaceError::StoreCorrupt(format!(
                "unsupported schema version {} (expected {})",
                other, SCHEMA_VERSION
            )));
        }
    }
    Ok(())
}

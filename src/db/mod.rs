pub mod schema;
pub mod writer;
pub mod query;

use rusqlite::{Connection, ErrorCode};
use std::path::Path;
use std::time::Duration;

use crate::error::{FaceError, Result};

pub fn open_or_create<P: AsRef<Path>>(db_path: P, busy_timeout: Duration) -> Result<Connection> {
    let conn = Connection::open(db_path)?;
    schema::apply_pragmas(&conn, busy_timeout)?;
    schema::apply_schema(&conn)?;
    Ok(conn)
}

/// Whether an error means the file is unusable as a store (as opposed to
/// locked, missing permissions, or out of disk).
pub fn is_corruption(err: &FaceError) -> bool {
    match err {
        FaceError::StoreCorrupt(_) => true,
        FaceError::Store(rusqlite::Error::SqliteFailure(e, msg)) => {
            matches!(e.code, ErrorCode::NotADatabase | ErrorCode::DatabaseCorrupt)
                || msg
                    .as_deref()
                    .map(|m| m.contains("no such column") || m.contains("no such table"))
                    .unwrap_or(false)
        }
        FaceError::Store(rusqlite::Error::InvalidColumnType(..))
        | FaceError::Store(rusqlite::Error::FromSqlConversionFailure(..)) => true,
        _ => false,
    }
}

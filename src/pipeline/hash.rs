use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use memmap2::MmapOptions;
use xxhash_rust::xxh3::Xxh3;

use crate::error::Result;

// Memory mapping wins over buffered reads past this size.
const MMAP_THRESHOLD: u64 = 8 * 1024 * 1024;
const CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// xxh3 of the file contents, stored as i64 the way SQLite wants it.
pub fn hash_file(path: &Path) -> Result<i64> {
    let file = File::open(path)?;
    let len = file.metadata()?.len();
    let mut xx = Xxh3::new();

    if len >= MMAP_THRESHOLD {
        // Safety: the map is read-only and dropped before returning. A file
        // truncated underneath us can fault; library files are not expected
        // to change during a reconcile.
        let mmap = unsafe { MmapOptions::new().map(&file)? };
        for chunk in mmap.chunks(CHUNK_SIZE) {
            xx.update(chunk);
        }
    } else {
        let mut reader = BufReader::with_capacity(64 * 1024, file);
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            xx.update(&buf[..n]);
        }
    }

    Ok(xx.digest() as i64)
}

pub fn mtime_ns(md: &std::fs::Metadata) -> i64 {
    md.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| (d.as_secs() as i64) * 1_000_000_000 + (d.subsec_nanos() as i64))
        .unwrap_or(0)
}

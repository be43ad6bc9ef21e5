use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use crate::error::Result;
use crate::models::face::ImageId;
use crate::pipeline::hash::mtime_ns;

/// A photo sitting directly inside the library directory.
#[derive(Clone, Debug)]
pub struct LibraryImage {
    pub id: ImageId,
    pub path: PathBuf,
    pub size_bytes: i64,
    pub mtime_ns: i64,
}

impl LibraryImage {
    /// Whether the file on disk still has the size/mtime recorded elsewhere.
    pub fn same_metadata(&self, size_bytes: i64, mtime_ns: i64) -> bool {
        self.size_bytes == size_bytes && self.mtime_ns == mtime_ns
    }
}

pub(crate) fn is_hidden(p: &Path) -> bool {
    p.file_name()
        .and_then(|s| s.to_str())
        .map(|s| s.starts_with('.'))
        .unwrap_or(false)
}

/// `.png`, `.jpg` and `.jpeg`, any case.
pub fn is_library_image(path: &Path) -> bool {
    if let Some(ext) = path.extension().and_then(|s| s.to_str()) {
        let ext_lower = ext.to_lowercase();
        matches!(ext_lower.as_str(), "jpg" | "jpeg" | "png")
    } else {
        false
    }
}

pub(crate) fn library_image_from_metadata(path: &Path, md: &fs::Metadata) -> Option<LibraryImage> {
    if !md.is_file() {
        return None;
    }
    let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
        debug!("skipping non utf-8 file name: {:?}", path);
        return None;
    };
    Some(LibraryImage {
        id: ImageId::from(name),
        path: path.to_path_buf(),
        size_bytes: md.len() as i64,
        mtime_ns: mtime_ns(md),
    })
}

/// Flat listing of the library directory, sorted by identifier.
///
/// Only the top level is scanned. Hidden files and anything that is not a
/// regular file after following symlinks are skipped.
pub fn scan_library(dir: &Path) -> Result<Vec<LibraryImage>> {
    // Fail loudly on a missing or unreadable directory rather than
    // reporting an empty library.
    fs::read_dir(dir)?;

    let mut out = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).follow_links(false) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                debug!("scan error under {:?}: {}", dir, e);
                continue;
            }
        };
        let path = entry.path();
        if is_hidden(path) || !is_library_image(path) {
            continue;
        }
        // fs::metadata follows symlinks
        let md = match fs::metadata(path) {
            Ok(md) => md,
            Err(e) => {
                debug!("stat failed for {:?}: {}", path, e);
                continue;
            }
        };
        if let Some(img) = library_image_from_metadata(path, &md) {
            out.push(img);
        }
    }
    out.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_extension_filter() {
        assert!(is_library_image(Path::new("a.jpg")));
        assert!(is_library_image(Path::new("a.JPEG")));
        assert!(is_library_image(Path::new("a.Png")));
        assert!(!is_library_image(Path::new("a.gif")));
        assert!(!is_library_image(Path::new("a.mp4")));
        assert!(!is_library_image(Path::new("README")));
    }

    #[test]
    fn test_scan_is_flat_sorted_and_skips_hidden() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        for name in ["b.jpg", "a.PNG", ".hidden.jpg", "notes.txt", "c.jpeg"] {
            fs::write(root.join(name), b"x").unwrap();
        }
        fs::create_dir(root.join("nested")).unwrap();
        fs::write(root.join("nested").join("deep.jpg"), b"x").unwrap();
        fs::create_dir(root.join("folder.jpg")).unwrap();

        let found = scan_library(root).unwrap();
        let ids: Vec<&str> = found.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["a.PNG", "b.jpg", "c.jpeg"]);
        assert!(found.iter().all(|i| i.size_bytes == 1));
    }

    #[test]
    fn test_scan_missing_directory_is_error() {
        let tmp = TempDir::new().unwrap();
        assert!(scan_library(&tmp.path().join("missing")).is_err());
    }

    #[test]
    fn test_empty_directory_scans_empty() {
        let tmp = TempDir::new().unwrap();
        assert!(scan_library(tmp.path()).unwrap().is_empty());
    }
}

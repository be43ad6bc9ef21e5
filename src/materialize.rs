use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{FaceError, Result};
use crate::models::face::{ClusterLabel, ImageId};

pub const NOISE_FOLDER: &str = "Unknown_or_Single_Photos";

/// Outcome of copying result files. Individual copy failures never abort the
/// run; they are collected here.
#[derive(Debug, Default, Serialize)]
pub struct MaterializeReport {
    pub copied: usize,
    #[serde(serialize_with = "serialize_failures")]
    pub failures: Vec<FaceError>,
}

fn serialize_failures<S: serde::Serializer>(failures: &[FaceError], s: S) -> std::result::Result<S::Ok, S::Error> {
    s.collect_seq(failures.iter().map(|f| f.to_string()))
}

impl MaterializeReport {
    fn copy_into(&mut self, src: &Path, dest_dir: &Path) {
        let Some(name) = src.file_name() else {
            return;
        };
        let dest = dest_dir.join(name);
        match fs::copy(src, &dest) {
            Ok(_) => {
                debug!("copied {:?} -> {:?}", src, dest);
                self.copied += 1;
            }
            Err(e) => {
                warn!("failed to copy {:?} -> {:?}: {}", src, dest, e);
                self.failures.push(FaceError::ResultIo { path: dest, source: e });
            }
        }
    }
}

/// `Person_<n>` for clusters, a fixed folder for noise.
pub fn folder_name(label: ClusterLabel) -> String {
    match label {
        ClusterLabel::Person(n) => format!("Person_{}", n),
        ClusterLabel::Noise => NOISE_FOLDER.to_string(),
    }
}

/// Replace the contents of `results_dir` with copies of the matched photos.
///
/// Files left over from a previous search are deleted first; subdirectories
/// are left alone.
pub fn publish_matches(library_dir: &Path, matches: &BTreeSet<ImageId>, results_dir: &Path) -> Result<MaterializeReport> {
    fs::create_dir_all(results_dir).map_err(|e| FaceError::ResultIo { path: results_dir.to_path_buf(), source: e })?;
    let mut report = MaterializeReport::default();

    for entry in fs::read_dir(results_dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type().map(|t| t.is_file() || t.is_symlink()).unwrap_or(false) {
            if let Err(e) = fs::remove_file(&path) {
                warn!("failed to remove old result {:?}: {}", path, e);
                report.failures.push(FaceError::ResultIo { path, source: e });
            }
        }
    }

    for id in matches {
        report.copy_into(&library_dir.join(id.as_str()), results_dir);
    }
    info!("published {} match(es) to {:?} ({} failure(s))", report.copied, results_dir, report.failures.len());
    Ok(report)
}

/// Recreate `output_dir` with one folder per cluster plus the noise folder.
pub fn organize_clusters(
    input_dir: &Path,
    groups: &BTreeMap<ClusterLabel, Vec<ImageId>>,
    output_dir: &Path,
) -> Result<MaterializeReport> {
    if output_dir.exists() {
        info!("cleaning up old results in {:?}", output_dir);
        fs::remove_dir_all(output_dir).map_err(|e| FaceError::ResultIo { path: output_dir.to_path_buf(), source: e })?;
    }
    fs::create_dir_all(output_dir).map_err(|e| FaceError::ResultIo { path: output_dir.to_path_buf(), source: e })?;

    let mut report = MaterializeReport::default();
    for (label, ids) in groups {
        let dir: PathBuf = output_dir.join(folder_name(*label));
        if let Err(e) = fs::create_dir_all(&dir) {
            warn!("failed to create {:?}: {}", dir, e);
            report.failures.push(FaceError::ResultIo { path: dir, source: e });
            continue;
        }
        for id in ids {
            report.copy_into(&input_dir.join(id.as_str()), &dir);
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ids(names: &[&str]) -> Vec<ImageId> {
        names.iter().map(|n| ImageId::from(*n)).collect()
    }

    #[test]
    fn test_folder_names() {
        assert_eq!(folder_name(ClusterLabel::Person(0)), "Person_0");
        assert_eq!(folder_name(ClusterLabel::Person(12)), "Person_12");
        assert_eq!(folder_name(ClusterLabel::Noise), "Unknown_or_Single_Photos");
    }

    #[test]
    fn test_publish_replaces_previous_results() {
        let tmp = TempDir::new().unwrap();
        let lib = tmp.path().join("lib");
        let out = tmp.path().join("results");
        fs::create_dir_all(&lib).unwrap();
        fs::create_dir_all(&out).unwrap();
        fs::write(lib.join("a.jpg"), b"a").unwrap();
        fs::write(lib.join("b.jpg"), b"b").unwrap();
        fs::write(out.join("stale.jpg"), b"old").unwrap();

        let matches: BTreeSet<ImageId> = ids(&["a.jpg", "missing.jpg"]).into_iter().collect();
        let report = publish_matches(&lib, &matches, &out).unwrap();

        assert_eq!(report.copied, 1);
        assert_eq!(report.failures.len(), 1);
        assert!(matches!(report.failures[0], FaceError::ResultIo { .. }));
        assert!(out.join("a.jpg").exists());
        assert!(!out.join("b.jpg").exists());
        assert!(!out.join("stale.jpg").exists());
    }

    #[test]
    fn test_organize_creates_person_and_noise_folders() {
        let tmp = TempDir::new().unwrap();
        let input = tmp.path().join("in");
        let output = tmp.path().join("out");
        fs::create_dir_all(&input).unwrap();
        fs::create_dir_all(output.join("leftover")).unwrap();
        for n in ["a.jpg", "b.jpg", "c.jpg"] {
            fs::write(input.join(n), n.as_bytes()).unwrap();
        }
        let mut groups = BTreeMap::new();
        groups.insert(ClusterLabel::Person(0), ids(&["a.jpg", "b.jpg"]));
        groups.insert(ClusterLabel::Noise, ids(&["c.jpg"]));

        let report = organize_clusters(&input, &groups, &output).unwrap();
        assert_eq!(report.copied, 3);
        assert!(report.failures.is_empty());
        assert!(output.join("Person_0").join("a.jpg").exists());
        assert!(output.join("Person_0").join("b.jpg").exists());
        assert!(output.join(NOISE_FOLDER).join("c.jpg").exists());
        assert!(!output.join("leftover").exists());
    }

    #[test]
    fn test_report_serializes_failures_as_messages() {
        let report = MaterializeReport {
            copied: 2,
            failures: vec![FaceError::ResultIo {
                path: PathBuf::from("/x/y.jpg"),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
            }],
        };
        let v = serde_json::to_value(&report).unwrap();
        assert_eq!(v["copied"], 2);
        assert!(v["failures"][0].as_str().unwrap().contains("y.jpg"));
    }
}

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

use crate::store::ReconcileReport;

/// Process-wide counters for the HTTP surface.
pub struct Stats {
    searches_total: AtomicU64,
    searches_no_face: AtomicU64,
    matches_total: AtomicU64,
    reconciles_total: AtomicU64,
    images_encoded: AtomicU64,
    faces_encoded: AtomicU64,
    decode_failures: AtomicU64,
    started: Instant,
    last_reconcile: parking_lot::Mutex<Option<ReconcileReport>>,
    last_search_secs: parking_lot::Mutex<Option<f64>>,
}

#[derive(Debug, Serialize)]
pub struct StatsSnapshot {
    pub uptime_secs: u64,
    pub searches_total: u64,
    pub searches_no_face: u64,
    pub matches_total: u64,
    pub reconciles_total: u64,
    pub images_encoded: u64,
    pub faces_encoded: u64,
    pub decode_failures: u64,
    pub last_search_secs: Option<f64>,
    pub last_reconcile: Option<ReconcileReport>,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        Self {
            searches_total: AtomicU64::new(0),
            searches_no_face: AtomicU64::new(0),
            matches_total: AtomicU64::new(0),
            reconciles_total: AtomicU64::new(0),
            images_encoded: AtomicU64::new(0),
            faces_encoded: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            started: Instant::now(),
            last_reconcile: parking_lot::Mutex::new(None),
            last_search_secs: parking_lot::Mutex::new(None),
        }
    }

    pub fn record_search(&self, matches: usize, elapsed_secs: f64) {
        self.searches_total.fetch_add(1, Ordering::Relaxed);
        self.matches_total.fetch_add(matches as u64, Ordering::Relaxed);
        *self.last_search_secs.lock() = Some(elapsed_secs);
    }

    pub fn record_no_face(&self) {
        self.searches_total.fetch_add(1, Ordering::Relaxed);
        self.searches_no_face.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconcile(&self, report: &ReconcileReport) {
        self.reconciles_total.fetch_add(1, Ordering::Relaxed);
        self.images_encoded
            .fetch_add((report.encoded + report.reencoded) as u64, Ordering::Relaxed);
        self.faces_encoded.fetch_add(report.faces_found as u64, Ordering::Relaxed);
        self.decode_failures.fetch_add(report.decode_failures as u64, Ordering::Relaxed);
        *self.last_reconcile.lock() = Some(report.clone());
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub fn searches_total(&self) -> u64 {
        self.searches_total.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            uptime_secs: self.uptime_secs(),
            searches_total: self.searches_total(),
            searches_no_face: self.searches_no_face.load(Ordering::Relaxed),
            matches_total: self.matches_total.load(Ordering::Relaxed),
            reconciles_total: self.reconciles_total.load(Ordering::Relaxed),
            images_encoded: self.images_encoded.load(Ordering::Relaxed),
            faces_encoded: self.faces_encoded.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            last_search_secs: *self.last_search_secs.lock(),
            last_reconcile: self.last_reconcile.lock().clone(),
        }
    }

    pub fn metrics_text(&self) -> String {
        let snap = self.snapshot();
        let mut s = String::new();
        s.push_str(&format!("nazr_faces_uptime_seconds {}\n", snap.uptime_secs));
        s.push_str(&format!("nazr_faces_searches_total {}\n", snap.searches_total));
        s.push_str(&format!("nazr_faces_searches_no_face_total {}\n", snap.searches_no_face));
        s.push_str(&format!("nazr_faces_matches_total {}\n", snap.matches_total));
        s.push_str(&format!("nazr_faces_reconciles_total {}\n", snap.reconciles_total));
        s.push_str(&format!("nazr_faces_images_encoded_total {}\n", snap.images_encoded));
        s.push_str(&format!("nazr_faces_faces_encoded_total {}\n", snap.faces_encoded));
        s.push_str(&format!("nazr_faces_decode_failures_total {}\n", snap.decode_failures));
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = Stats::new();
        stats.record_search(3, 0.25);
        stats.record_no_face();
        stats.record_reconcile(&ReconcileReport { encoded: 2, reencoded: 1, faces_found: 4, decode_failures: 1, ..Default::default() });
        let snap = stats.snapshot();
        assert_eq!(snap.searches_total, 2);
        assert_eq!(snap.searches_no_face, 1);
        assert_eq!(snap.matches_total, 3);
        assert_eq!(snap.images_encoded, 3);
        assert_eq!(snap.faces_encoded, 4);
        assert_eq!(snap.decode_failures, 1);
        assert_eq!(snap.last_search_secs, Some(0.25));
        assert_eq!(snap.last_reconcile.map(|r| r.encoded), Some(2));
    }

    #[test]
    fn test_metrics_text_lists_counters() {
        let stats = Stats::new();
        stats.record_search(1, 0.1);
        let text = stats.metrics_text();
        assert!(text.contains("nazr_faces_searches_total 1"));
        assert!(text.contains("nazr_faces_matches_total 1"));
    }
}

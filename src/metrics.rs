//! Process-wide counters
//!
//! Plain atomics, exposed as JSON by the `/metrics` endpoint. No exporter:
//! consumers scrape the HTTP surface.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    jobs_added: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    bytes_downloaded: AtomicU64,
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub jobs_added: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub bytes_downloaded: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_added(&self) {
        self.jobs_added.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_completed(&self) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_downloaded(&self, bytes: u64) {
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_added: self.jobs_added.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = Metrics::new();
        metrics.job_added();
        metrics.job_added();
        metrics.job_completed();
        metrics.bytes_downloaded(1000);
        metrics.bytes_downloaded(24);

        let snap = metrics.snapshot();
        assert_eq!(snap.jobs_added, 2);
        assert_eq!(snap.jobs_completed, 1);
        assert_eq!(snap.jobs_failed, 0);
        assert_eq!(snap.bytes_downloaded, 1024);
    }
}

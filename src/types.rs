//! Core types for debrid-broker
//!
//! This module contains the fundamental data types used throughout the
//! broker: the job record, its state machine states, the file list reported
//! by the debrid service, and the storage tuning profile.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// BitTorrent info-hash: 40 lowercase hex characters, the unique job key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InfoHash(String);

impl InfoHash {
    /// Create from raw SHA-1 digest bytes.
    pub fn from_bytes(bytes: &[u8; 20]) -> Self {
        Self(hex::encode(bytes))
    }

    /// Parse from a hex string. Accepts mixed case, normalizes to lowercase.
    pub fn parse(s: &str) -> Option<Self> {
        if s.len() != 40 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        Some(Self(s.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Current state of a job.
///
/// Transitions are monotonic through queued → debrid_pending → debrid_ready →
/// downloading → completed, with paused and error as sidetracks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for a submission slot
    Queued,
    /// Magnet submitted, debrid service still processing
    DebridPending,
    /// Debrid reported the file list; waiting for a run slot
    DebridReady,
    /// Actively streaming to disk
    Downloading,
    /// Paused by the caller; partial file kept
    Paused,
    /// All files fully written and fsynced
    Completed,
    /// Terminal failure; `last_error` holds the cause
    Error,
}

impl JobState {
    /// States where a worker task may be bound to the job.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Queued | Self::DebridPending | Self::DebridReady | Self::Downloading
        )
    }

    /// Terminal states that survive a restart untouched.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }

    /// Map to the qBittorrent state string consumed by Sonarr/Radarr.
    pub fn to_qbit_state(&self) -> &'static str {
        match self {
            Self::Queued | Self::DebridPending => "queuedDL",
            Self::DebridReady => "stalledDL",
            Self::Downloading => "downloading",
            Self::Paused => "pausedDL",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::DebridPending => "debrid_pending",
            Self::DebridReady => "debrid_ready",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Byte window owned by one download connection. Persisted so a restart can
/// continue each window without rewriting data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentSpan {
    /// Start byte offset (inclusive)
    pub start: u64,
    /// End byte offset (inclusive)
    pub end: u64,
    /// Bytes written into this window so far
    pub done: u64,
}

impl SegmentSpan {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end, done: 0 }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    pub fn is_complete(&self) -> bool {
        self.done >= self.len()
    }

    pub fn remaining(&self) -> u64 {
        self.len().saturating_sub(self.done)
    }
}

/// One file of a job, as reported by the debrid service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobFile {
    /// Debrid-reported file name (sanitized before touching disk)
    pub name: String,
    /// File size in bytes
    pub size: u64,
    /// Hosted URL to be unlocked into a direct URL
    pub hosted_url: String,
    /// Bytes persisted to the destination file
    pub done: u64,
    /// Multi-connection watermarks; empty for sequential transfers
    #[serde(default)]
    pub segments: Vec<SegmentSpan>,
}

impl JobFile {
    pub fn is_complete(&self) -> bool {
        self.done >= self.size
    }
}

/// The unit of work: one magnet forwarded to the debrid service and
/// streamed to local storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique key
    pub info_hash: InfoHash,
    /// Original magnet URI (retained until completion)
    pub source: String,
    /// Best-known human name: magnet `dn`, else debrid-reported, else hash
    pub display_name: String,
    /// Opaque caller tag (e.g. "radarr")
    pub category: String,
    /// Absolute destination directory
    pub save_path: PathBuf,
    /// State machine position
    pub state: JobState,
    /// Identifier returned by the debrid submit call
    pub debrid_id: Option<u64>,
    /// Ordered file list; empty until the debrid service reports Ready
    #[serde(default)]
    pub files: Vec<JobFile>,
    /// Sum of file sizes; 0 before the debrid service reports
    pub size_total: u64,
    /// Sum of bytes persisted across all files
    pub size_done: u64,
    /// Instantaneous download rate (EWMA over a 3 s window)
    pub speed_bps: u64,
    /// Unlocked direct URL for the file currently downloading
    #[serde(skip)]
    pub direct_url: Option<String>,
    /// Monotonic deadline after which `direct_url` must be re-unlocked
    #[serde(skip)]
    pub url_expires_at: Option<std::time::Instant>,
    /// Retry counter within the current state
    pub attempt: u32,
    /// Human-readable cause, populated only in `error`
    pub last_error: Option<String>,
    /// Wall-clock timestamps
    pub added_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(
        info_hash: InfoHash,
        source: String,
        display_name: String,
        category: String,
        save_path: PathBuf,
    ) -> Self {
        Self {
            info_hash,
            source,
            display_name,
            category,
            save_path,
            state: JobState::Queued,
            debrid_id: None,
            files: Vec::new(),
            size_total: 0,
            size_done: 0,
            speed_bps: 0,
            direct_url: None,
            url_expires_at: None,
            attempt: 0,
            last_error: None,
            added_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Progress fraction in 0..=1.
    pub fn progress(&self) -> f64 {
        if self.size_total == 0 {
            return 0.0;
        }
        (self.size_done as f64 / self.size_total as f64).min(1.0)
    }

    /// Seconds remaining at the current rate, or `None` when unknowable.
    pub fn eta_seconds(&self) -> Option<u64> {
        if self.speed_bps == 0 || self.size_total == 0 {
            return None;
        }
        Some(self.size_total.saturating_sub(self.size_done) / self.speed_bps)
    }

    /// Recompute `size_done` from the per-file counters.
    pub fn recount_done(&mut self) {
        self.size_done = self.files.iter().map(|f| f.done).sum();
    }

    /// Whether this job occupies a large run slot under the given threshold.
    pub fn is_large(&self, threshold: u64) -> bool {
        self.size_total >= threshold
    }
}

/// Detected class of the download medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Hdd,
    Ssd,
}

impl std::fmt::Display for StorageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hdd => write!(f, "hdd"),
            Self::Ssd => write!(f, "ssd"),
        }
    }
}

impl std::str::FromStr for StorageKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hdd" => Ok(Self::Hdd),
            "ssd" => Ok(Self::Ssd),
            _ => Err(format!("Invalid storage kind: {}", s)),
        }
    }
}

/// Tuning knobs derived from the storage medium. The hdd profile trades
/// parallelism for strictly sequential writes; the ssd profile fans out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TuningProfile {
    pub kind: StorageKind,
    /// HTTP connections per job (1 = pure sequential stream)
    pub max_connections_per_job: usize,
    /// Concurrent jobs at or above the large threshold
    pub max_concurrent_large: usize,
    /// Concurrent jobs below the large threshold
    pub max_concurrent_small: usize,
    /// Size boundary between the two classes, in bytes
    pub large_threshold: u64,
    /// Ring buffer capacity per job, in bytes
    pub disk_buffer_bytes: usize,
    /// Disk write batch size, in bytes
    pub write_batch_bytes: usize,
    /// fsync interval while streaming
    pub flush_interval: std::time::Duration,
    /// Reserve the full file length before the first write
    pub preallocate: bool,
}

/// 20 GiB: the boundary between small and large jobs.
pub const LARGE_THRESHOLD_BYTES: u64 = 20 * 1024 * 1024 * 1024;

impl TuningProfile {
    pub fn hdd() -> Self {
        Self {
            kind: StorageKind::Hdd,
            max_connections_per_job: 1,
            max_concurrent_large: 1,
            max_concurrent_small: 3,
            large_threshold: LARGE_THRESHOLD_BYTES,
            disk_buffer_bytes: 64 * 1024 * 1024,
            write_batch_bytes: 64 * 1024 * 1024,
            flush_interval: std::time::Duration::from_secs(5),
            preallocate: true,
        }
    }

    pub fn ssd() -> Self {
        Self {
            kind: StorageKind::Ssd,
            max_connections_per_job: 4,
            max_concurrent_large: 3,
            max_concurrent_small: 5,
            large_threshold: LARGE_THRESHOLD_BYTES,
            disk_buffer_bytes: 8 * 1024 * 1024,
            write_batch_bytes: 64 * 1024 * 1024,
            flush_interval: std::time::Duration::from_secs(1),
            preallocate: false,
        }
    }

    pub fn for_kind(kind: StorageKind) -> Self {
        match kind {
            StorageKind::Hdd => Self::hdd(),
            StorageKind::Ssd => Self::ssd(),
        }
    }
}

/// Events emitted by the job manager. Consumers (the metrics endpoint, tests)
/// subscribe through a broadcast channel.
#[derive(Debug, Clone)]
pub enum JobEvent {
    Added {
        hash: InfoHash,
    },
    StateChanged {
        hash: InfoHash,
        from: JobState,
        to: JobState,
    },
    Progress {
        hash: InfoHash,
        done: u64,
        speed_bps: u64,
    },
    Completed {
        hash: InfoHash,
    },
    Failed {
        hash: InfoHash,
        error: String,
    },
    Removed {
        hash: InfoHash,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_hash_parse_normalizes_case() {
        let h = InfoHash::parse("0123456789ABCDEF0123456789abcdef01234567").unwrap();
        assert_eq!(h.as_str(), "0123456789abcdef0123456789abcdef01234567");
    }

    #[test]
    fn info_hash_rejects_bad_input() {
        assert!(InfoHash::parse("too-short").is_none());
        assert!(InfoHash::parse("zz23456789abcdef0123456789abcdef01234567").is_none());
        assert!(InfoHash::parse("0123456789abcdef0123456789abcdef0123456").is_none());
    }

    #[test]
    fn segment_span_accounting() {
        let mut span = SegmentSpan::new(0, 999);
        assert_eq!(span.len(), 1000);
        assert_eq!(span.remaining(), 1000);
        span.done = 1000;
        assert!(span.is_complete());
    }

    #[test]
    fn job_progress_and_eta() {
        let hash = InfoHash::parse("0123456789abcdef0123456789abcdef01234567").unwrap();
        let mut job = Job::new(
            hash,
            "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567".into(),
            "test".into(),
            "radarr".into(),
            PathBuf::from("/downloads/radarr"),
        );
        assert_eq!(job.progress(), 0.0);
        assert_eq!(job.eta_seconds(), None);

        job.size_total = 1000;
        job.size_done = 250;
        job.speed_bps = 250;
        assert!((job.progress() - 0.25).abs() < f64::EPSILON);
        assert_eq!(job.eta_seconds(), Some(3));
    }

    #[test]
    fn state_mapping_matches_qbittorrent() {
        assert_eq!(JobState::Queued.to_qbit_state(), "queuedDL");
        assert_eq!(JobState::DebridPending.to_qbit_state(), "queuedDL");
        assert_eq!(JobState::DebridReady.to_qbit_state(), "stalledDL");
        assert_eq!(JobState::Downloading.to_qbit_state(), "downloading");
        assert_eq!(JobState::Paused.to_qbit_state(), "pausedDL");
        assert_eq!(JobState::Completed.to_qbit_state(), "completed");
        assert_eq!(JobState::Error.to_qbit_state(), "error");
    }

    #[test]
    fn profile_tables() {
        let hdd = TuningProfile::hdd();
        assert_eq!(hdd.max_connections_per_job, 1);
        assert_eq!(hdd.max_concurrent_large, 1);
        assert!(hdd.preallocate);

        let ssd = TuningProfile::ssd();
        assert_eq!(ssd.max_connections_per_job, 4);
        assert_eq!(ssd.max_concurrent_small, 5);
        assert!(!ssd.preallocate);
    }
}

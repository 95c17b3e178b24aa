//! Storage probe
//!
//! Classifies the download directory as rotational (hdd) or solid-state
//! (ssd). The preferred method reads the block layer's rotational attribute
//! for the device backing the path; when that cannot be resolved, a short
//! random-read micro-benchmark over a scratch file decides, with 400 IOPS as
//! the boundary.

use crate::types::StorageKind;
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// IOPS at or above which the medium is treated as solid-state.
const IOPS_THRESHOLD: f64 = 400.0;

/// Scratch file size for the micro-benchmark.
const SCRATCH_BYTES: u64 = 16 * 1024 * 1024;

/// Number of random 4 KiB reads the benchmark issues.
const BENCH_READS: u32 = 256;

/// Classify the medium backing `path`.
///
/// Falls back to hdd when nothing can be determined: the rotational profile
/// is the conservative one (sequential writes, preallocation).
pub fn detect_storage(path: &Path) -> StorageKind {
    match rotational_attribute(path) {
        Some(true) => {
            tracing::info!(path = %path.display(), "storage probe: rotational device");
            StorageKind::Hdd
        }
        Some(false) => {
            tracing::info!(path = %path.display(), "storage probe: non-rotational device");
            StorageKind::Ssd
        }
        None => match bench_random_reads(path) {
            Some(iops) => {
                let kind = if iops >= IOPS_THRESHOLD {
                    StorageKind::Ssd
                } else {
                    StorageKind::Hdd
                };
                tracing::info!(path = %path.display(), iops = iops as u64, %kind, "storage probe: benchmark");
                kind
            }
            None => {
                tracing::warn!(path = %path.display(), "storage probe failed, assuming hdd");
                StorageKind::Hdd
            }
        },
    }
}

/// Read `/sys/block/<dev>/queue/rotational` for the device mounted under
/// `path`. Returns `None` when the device cannot be resolved.
fn rotational_attribute(path: &Path) -> Option<bool> {
    let resolved = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let device = device_for_path(&resolved)?;
    let attr = PathBuf::from("/sys/block")
        .join(&device)
        .join("queue/rotational");
    let value = fs::read_to_string(attr).ok()?;
    Some(value.trim() == "1")
}

/// Resolve the base block device name for a path via `/proc/mounts`,
/// using the longest mount-point prefix match.
fn device_for_path(path: &Path) -> Option<String> {
    let mounts = fs::read_to_string("/proc/mounts").ok()?;

    let mut best: Option<(&str, &str)> = None;
    for line in mounts.lines() {
        let mut fields = line.split_whitespace();
        let device = fields.next()?;
        let mount_point = fields.next()?;
        if !device.starts_with("/dev/") {
            continue;
        }
        if path.starts_with(mount_point)
            && best.map(|(_, m)| mount_point.len() > m.len()).unwrap_or(true)
        {
            best = Some((device, mount_point));
        }
    }

    let (device, _) = best?;
    Some(base_device_name(device.trim_start_matches("/dev/")))
}

/// Strip the partition suffix: `sda1` → `sda`, `nvme0n1p2` → `nvme0n1`.
fn base_device_name(device: &str) -> String {
    if let Some(idx) = device.rfind('p') {
        let (head, tail) = device.split_at(idx);
        if head.chars().last().map(|c| c.is_ascii_digit()).unwrap_or(false)
            && tail[1..].chars().all(|c| c.is_ascii_digit())
            && !tail[1..].is_empty()
        {
            return head.to_string();
        }
    }
    device.trim_end_matches(|c: char| c.is_ascii_digit()).to_string()
}

/// Time random 4 KiB reads over a freshly written scratch file and return the
/// achieved IOPS. Page-cache hits inflate the figure, which errs toward the
/// ssd profile on machines with ample free memory.
fn bench_random_reads(dir: &Path) -> Option<f64> {
    let scratch = dir.join(".storage-probe.tmp");
    let result = run_bench(&scratch);
    let _ = fs::remove_file(&scratch);
    result
}

fn run_bench(scratch: &Path) -> Option<f64> {
    let mut file = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(scratch)
        .ok()?;

    let block = vec![0u8; 1024 * 1024];
    for _ in 0..(SCRATCH_BYTES / block.len() as u64) {
        file.write_all(&block).ok()?;
    }
    file.sync_all().ok()?;

    let mut buf = [0u8; 4096];
    let slots = SCRATCH_BYTES / buf.len() as u64;
    let mut rng = rand::thread_rng();

    let start = Instant::now();
    let time_limit = Duration::from_millis(500);
    let mut reads = 0u32;

    while reads < BENCH_READS && start.elapsed() < time_limit {
        let slot = rand::Rng::gen_range(&mut rng, 0..slots);
        file.seek(SeekFrom::Start(slot * buf.len() as u64)).ok()?;
        file.read_exact(&mut buf).ok()?;
        reads += 1;
    }

    let elapsed = start.elapsed().as_secs_f64();
    if elapsed <= 0.0 || reads == 0 {
        return None;
    }
    Some(reads as f64 / elapsed)
}

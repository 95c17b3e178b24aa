//! Memory-bounded streaming HTTP downloader
//!
//! Streams a direct URL into a single destination file under a strict
//! per-job memory bound. Network readers (one per connection) push chunks
//! into a byte-bounded ring; a single disk writer drains the ring in large
//! batches, issues sequential writes at the batch offset, and fsyncs on the
//! profile's flush interval. The HTTP side blocks on ring space, so ingress
//! can never outrun the disk by more than the buffer capacity.
//!
//! With one connection (rotational profile) the transfer is a pure
//! sequential stream. With more, the remaining range is partitioned into
//! disjoint byte windows, each streamed independently to its absolute
//! offset.

pub mod ring;
pub mod speed;

use crate::error::{BrokerError, NetworkErrorKind, Result};
use crate::types::{SegmentSpan, TuningProfile};
use bytes::Bytes;
use futures::StreamExt;
use ring::{RingConsumer, RingProducer};
use speed::SpeedMeter;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio_util::sync::CancellationToken;

/// Segments are never planned smaller than this.
pub const MIN_SEGMENT_LEN: u64 = 1024 * 1024;

/// Cadence of progress publication.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// One file transfer: where to fetch from, where to write, and how much of
/// it already exists on disk.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    pub path: PathBuf,
    pub size_total: u64,
    /// Saved byte windows from a previous run; empty plans a fresh layout
    pub segments: Vec<SegmentSpan>,
    /// Contiguous watermark used when no saved segments exist
    pub offset: u64,
}

/// Snapshot published on every progress tick and at the end of a transfer.
#[derive(Debug, Clone)]
pub struct FetchProgress {
    /// Bytes persisted for this file
    pub done: u64,
    /// EWMA rate over the 3 s window
    pub speed_bps: u64,
    /// Per-window watermarks, suitable for persistence
    pub segments: Vec<SegmentSpan>,
}

/// Internal outcome of a reader task.
enum FetchFailure {
    /// Server answered 200 to a ranged request: ranges unsupported,
    /// restart the whole transfer from byte zero on one connection.
    RangeIgnored,
    Failed(BrokerError),
}

impl From<BrokerError> for FetchFailure {
    fn from(e: BrokerError) -> Self {
        Self::Failed(e)
    }
}

/// Streaming downloader bound to a tuning profile.
pub struct Downloader {
    client: reqwest::Client,
    profile: TuningProfile,
}

impl Downloader {
    pub fn new(profile: TuningProfile) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .read_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| BrokerError::Internal(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client, profile })
    }

    pub fn profile(&self) -> &TuningProfile {
        &self.profile
    }

    /// Plan byte windows for a transfer: one open-ended window for a single
    /// connection, otherwise the remaining range split evenly.
    pub fn plan_segments(total: u64, offset: u64, connections: usize) -> Vec<SegmentSpan> {
        if total == 0 {
            return Vec::new();
        }
        let offset = offset.min(total);
        let remaining = total - offset;

        if connections <= 1 || remaining < 2 * MIN_SEGMENT_LEN {
            let mut span = SegmentSpan::new(0, total - 1);
            span.done = offset;
            return vec![span];
        }

        let count = connections.min((remaining / MIN_SEGMENT_LEN) as usize).max(1);
        let window = remaining / count as u64;
        (0..count)
            .map(|i| {
                let start = offset + i as u64 * window;
                let end = if i == count - 1 {
                    total - 1
                } else {
                    offset + (i as u64 + 1) * window - 1
                };
                SegmentSpan::new(start, end)
            })
            .collect()
    }

    /// Stream one file to disk. Blocks until the transfer completes, fails,
    /// or is cancelled; `on_progress` fires every 500 ms and once at the end.
    pub async fn fetch<F>(
        &self,
        req: &FetchRequest,
        cancel: &CancellationToken,
        mut on_progress: F,
    ) -> Result<()>
    where
        F: FnMut(FetchProgress) + Send,
    {
        if req.size_total == 0 {
            // Zero-length files just need to exist.
            prepare_parent(&req.path).await?;
            File::create(&req.path)
                .await
                .map_err(|e| BrokerError::from_io(e, &req.path))?;
            return Ok(());
        }

        let mut segments = if req.segments.is_empty() {
            Self::plan_segments(
                req.size_total,
                req.offset,
                self.profile.max_connections_per_job,
            )
        } else {
            req.segments.clone()
        };

        let mut restarted = false;
        loop {
            match self
                .run_transfer(req, segments.clone(), cancel, &mut on_progress)
                .await
            {
                Err(failure) => match failure {
                    FetchFailure::RangeIgnored if !restarted => {
                        tracing::debug!(url = %req.url, "server ignored range request, restarting from zero");
                        restarted = true;
                        segments = vec![SegmentSpan::new(0, req.size_total - 1)];
                        continue;
                    }
                    FetchFailure::RangeIgnored => {
                        return Err(BrokerError::network(
                            NetworkErrorKind::Other,
                            "server ignored range request after restart",
                        ));
                    }
                    FetchFailure::Failed(e) => return Err(e),
                },
                Ok(done) => {
                    // Completion predicate: every byte written and the file
                    // is exactly the expected length.
                    let observed_len = tokio::fs::metadata(&req.path)
                        .await
                        .map(|m| m.len())
                        .map_err(|e| BrokerError::from_io(e, &req.path))?;
                    if done == req.size_total && observed_len == req.size_total {
                        return Ok(());
                    }
                    return Err(BrokerError::SizeMismatch {
                        expected: req.size_total,
                        observed: done.min(observed_len),
                    });
                }
            }
        }
    }

    /// One attempt over a fixed segment layout. Returns total bytes done.
    async fn run_transfer<F>(
        &self,
        req: &FetchRequest,
        segments: Vec<SegmentSpan>,
        cancel: &CancellationToken,
        on_progress: &mut F,
    ) -> std::result::Result<u64, FetchFailure>
    where
        F: FnMut(FetchProgress) + Send,
    {
        let file = self.prepare_file(req, &segments).await?;
        let whole_file = segments.len() == 1;

        let (producer, consumer) = ring::ring(self.profile.disk_buffer_bytes);

        // Sibling readers stop as soon as one of them fails.
        let abort = cancel.child_token();

        let mut readers = Vec::new();
        for (idx, span) in segments.iter().enumerate() {
            if span.is_complete() {
                continue;
            }
            readers.push(tokio::spawn(stream_segment(
                self.client.clone(),
                req.url.clone(),
                idx,
                span.clone(),
                whole_file,
                producer.clone(),
                abort.clone(),
            )));
        }
        drop(producer);

        let write_result = self
            .write_loop(file, &req.path, consumer, segments, cancel, on_progress)
            .await;

        abort.cancel();
        let mut reader_failure: Option<FetchFailure> = None;
        for handle in readers {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(f)) => {
                    if reader_failure.is_none() {
                        reader_failure = Some(f);
                    }
                }
                Err(e) => {
                    if reader_failure.is_none() {
                        reader_failure =
                            Some(BrokerError::Internal(format!("reader panicked: {}", e)).into());
                    }
                }
            }
        }

        let done = write_result?;
        if cancel.is_cancelled() {
            return Err(BrokerError::Cancelled.into());
        }
        if let Some(failure) = reader_failure {
            return Err(failure);
        }
        Ok(done)
    }

    /// Drain the ring into the file: contiguous chunks are coalesced into
    /// batches of up to `write_batch_bytes`, each written with one seek.
    async fn write_loop<F>(
        &self,
        mut file: File,
        path: &Path,
        mut consumer: RingConsumer,
        mut segments: Vec<SegmentSpan>,
        cancel: &CancellationToken,
        on_progress: &mut F,
    ) -> std::result::Result<u64, FetchFailure>
    where
        F: FnMut(FetchProgress) + Send,
    {
        let mut done: u64 = segments.iter().map(|s| s.done).sum();
        let mut meter = SpeedMeter::new(SpeedMeter::WINDOW);
        let mut batch: Vec<ring::Chunk> = Vec::new();
        let mut batch_bytes: usize = 0;
        let mut dirty = false;

        let mut flush_tick = tokio::time::interval(self.profile.flush_interval);
        flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut progress_tick = tokio::time::interval(PROGRESS_INTERVAL);
        progress_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let write_batch = self.profile.write_batch_bytes.max(1);

        macro_rules! flush_batch {
            () => {
                if !batch.is_empty() {
                    write_out(&mut file, path, &batch).await?;
                    for chunk in batch.drain(..) {
                        let len = chunk.len() as u64;
                        if let Some(span) = segments.get_mut(chunk.segment) {
                            span.done += len;
                        }
                        done += len;
                        meter.record(len);
                    }
                    batch_bytes = 0;
                    dirty = true;
                }
            };
        }

        let cancelled = loop {
            // Biased order puts the timers ahead of the data path, otherwise
            // a saturated ring would starve the flush and progress ticks.
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break true,

                _ = flush_tick.tick() => {
                    flush_batch!();
                    if dirty {
                        file.sync_data()
                            .await
                            .map_err(|e| BrokerError::from_io(e, path))?;
                        dirty = false;
                    }
                }

                _ = progress_tick.tick() => {
                    let speed_bps = meter.sample();
                    on_progress(FetchProgress {
                        done,
                        speed_bps,
                        segments: segments.clone(),
                    });
                }

                maybe_chunk = consumer.pop() => {
                    let chunk = match maybe_chunk {
                        Some(c) => c,
                        None => break false,
                    };

                    let contiguous = batch
                        .last()
                        .map(|prev: &ring::Chunk| prev.end_offset() == chunk.offset)
                        .unwrap_or(true);
                    if !contiguous || batch_bytes >= write_batch {
                        flush_batch!();
                    }
                    batch_bytes += chunk.len();
                    batch.push(chunk);

                    // Opportunistically coalesce whatever is already queued.
                    while batch_bytes < write_batch {
                        match consumer.try_pop() {
                            Some(next) => {
                                let contiguous = batch
                                    .last()
                                    .map(|prev| prev.end_offset() == next.offset)
                                    .unwrap_or(true);
                                if !contiguous {
                                    flush_batch!();
                                }
                                batch_bytes += next.len();
                                batch.push(next);
                            }
                            None => break,
                        }
                    }
                    if batch_bytes >= write_batch {
                        flush_batch!();
                    }
                }
            }
        };

        // A write in flight completes its batch before stopping; that keeps
        // the on-disk watermarks consistent with the published segments.
        flush_batch!();
        if dirty || !cancelled {
            file.sync_all()
                .await
                .map_err(|e| BrokerError::from_io(e, path))?;
        }

        let speed_bps = meter.sample();
        on_progress(FetchProgress {
            done,
            speed_bps: if cancelled { 0 } else { speed_bps },
            segments: segments.clone(),
        });

        if cancelled {
            return Err(BrokerError::Cancelled.into());
        }
        Ok(done)
    }

    /// Open the destination and apply the profile's allocation policy.
    async fn prepare_file(
        &self,
        req: &FetchRequest,
        segments: &[SegmentSpan],
    ) -> std::result::Result<File, FetchFailure> {
        prepare_parent(&req.path).await?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&req.path)
            .await
            .map_err(|e| BrokerError::from_io(e, &req.path))?;

        let len = file
            .metadata()
            .await
            .map_err(|e| BrokerError::from_io(e, &req.path))?
            .len();

        if self.profile.preallocate {
            if len != req.size_total {
                file.set_len(req.size_total)
                    .await
                    .map_err(|e| BrokerError::from_io(e, &req.path))?;
            }
        } else if segments.len() == 1 {
            // Sequential file: anything past the watermark was written but
            // never acknowledged; drop it so the stream stays append-only.
            let watermark = segments[0].start + segments[0].done;
            if len > watermark {
                file.set_len(watermark)
                    .await
                    .map_err(|e| BrokerError::from_io(e, &req.path))?;
            }
        }

        Ok(file)
    }
}

async fn prepare_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| BrokerError::from_io(e, parent))?;
    }
    Ok(())
}

/// Write a contiguous batch with a single seek.
async fn write_out(
    file: &mut File,
    path: &Path,
    batch: &[ring::Chunk],
) -> std::result::Result<(), FetchFailure> {
    let start = batch[0].offset;
    file.seek(SeekFrom::Start(start))
        .await
        .map_err(|e| BrokerError::from_io(e, path))?;
    for chunk in batch {
        file.write_all(&chunk.data)
            .await
            .map_err(|e| BrokerError::from_io(e, path))?;
    }
    Ok(())
}

/// Stream one byte window into the ring.
async fn stream_segment(
    client: reqwest::Client,
    url: String,
    index: usize,
    span: SegmentSpan,
    whole_file: bool,
    producer: RingProducer,
    abort: CancellationToken,
) -> std::result::Result<(), FetchFailure> {
    let resume_start = span.start + span.done;
    if resume_start > span.end {
        return Ok(());
    }

    let range = if whole_file {
        format!("bytes={}-", resume_start)
    } else {
        format!("bytes={}-{}", resume_start, span.end)
    };

    let response = tokio::select! {
        r = client
            .get(&url)
            .header("Range", range)
            .header("Accept-Encoding", "identity")
            .send() => r.map_err(BrokerError::from)?,
        _ = abort.cancelled() => return Ok(()),
    };

    let status = response.status();
    match status.as_u16() {
        206 => {
            if let Some(content_range) = response
                .headers()
                .get("content-range")
                .and_then(|v| v.to_str().ok())
            {
                if let Some((actual_start, _, _)) = parse_content_range(content_range) {
                    if actual_start != resume_start {
                        return Err(BrokerError::network(
                            NetworkErrorKind::Other,
                            format!(
                                "content-range mismatch: requested {}, got {}",
                                resume_start, actual_start
                            ),
                        )
                        .into());
                    }
                }
            }
        }
        200 => {
            // Full-body answer to a ranged request: only usable when we
            // asked for the file from byte zero anyway.
            if resume_start != 0 || !whole_file {
                return Err(FetchFailure::RangeIgnored);
            }
        }
        410 => return Err(BrokerError::UrlExpired.into()),
        code => return Err(BrokerError::from_status(code, "download").into()),
    }

    let mut offset = resume_start;
    let limit = span.end + 1;
    let mut stream = response.bytes_stream();

    loop {
        let maybe_chunk = tokio::select! {
            c = stream.next() => c,
            _ = abort.cancelled() => return Ok(()),
        };

        let chunk: Bytes = match maybe_chunk {
            Some(Ok(c)) => c,
            Some(Err(e)) => {
                return Err(BrokerError::network(
                    NetworkErrorKind::ConnectionReset,
                    format!("stream error: {}", e),
                )
                .into())
            }
            None => break,
        };

        // Bounded windows ignore anything the server sends past their end.
        let allowed = (limit - offset).min(chunk.len() as u64) as usize;
        if allowed == 0 {
            break;
        }
        let data = chunk.slice(..allowed);
        let pushed_len = data.len() as u64;
        if !producer.push(index, offset, data).await {
            // Writer gone; the writer's own error is authoritative.
            return Ok(());
        }
        offset += pushed_len;
        if offset >= limit {
            break;
        }
    }

    if !whole_file && offset < limit {
        return Err(BrokerError::network(
            NetworkErrorKind::ShortRead,
            format!("segment {} ended at {} of {}", index, offset, limit),
        )
        .into());
    }
    Ok(())
}

/// Parse a `Content-Range: bytes start-end/total` header.
fn parse_content_range(header: &str) -> Option<(u64, u64, Option<u64>)> {
    let rest = header.strip_prefix("bytes ")?;
    let (range, total) = rest.split_once('/')?;
    let (start, end) = range.split_once('-')?;
    let total = if total == "*" {
        None
    } else {
        Some(total.parse().ok()?)
    };
    Some((start.parse().ok()?, end.parse().ok()?, total))
}

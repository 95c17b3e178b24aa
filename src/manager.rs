//! Job manager
//!
//! Owns every job's state machine and mediates between the persistence
//! layer, the debrid gateway, the scheduler, and the downloader. Each
//! accepted job runs in its own task that walks the pipeline:
//!
//! ```text
//! queued → debrid_pending → debrid_ready → downloading → completed
//! ```
//!
//! with `paused` and `error` as sidetracks. Transient download failures
//! bounce the job back to `debrid_ready` under exponential backoff and
//! re-enter through the scheduler; fatal failures land in `error` with
//! `last_error` populated.
//!
//! Job records are persisted synchronously on every state transition and at
//! most once per second while downloading.

use crate::debrid::{poll_interval, DebridGateway, DebridStatus, PROCESSING_CAP};
use crate::downloader::{Downloader, FetchRequest};
use crate::error::{BrokerError, Result};
use crate::magnet::{torrent_info_hash, Magnet};
use crate::metrics::Metrics;
use crate::retry::BackoffPolicy;
use crate::scheduler::{Scheduler, SizeClass};
use crate::storage::JobStore;
use crate::types::{InfoHash, Job, JobEvent, JobFile, JobState, TuningProfile};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Maximum number of events to buffer for slow subscribers.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Consecutive transient failures without byte progress before giving up.
const MAX_STALLED_ATTEMPTS: u32 = 5;

/// Retries for the submission phase before declaring the gateway down.
const MAX_SUBMIT_ATTEMPTS: u32 = 5;

/// Persistence cadence while downloading.
const PERSIST_INTERVAL: Duration = Duration::from_secs(1);

/// One managed job: the record under its per-job lock, plus the running
/// task's cancellation token when a worker is bound.
struct JobSlot {
    job: Mutex<Job>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl JobSlot {
    fn new(job: Job) -> Arc<Self> {
        Arc::new(Self {
            job: Mutex::new(job),
            cancel: Mutex::new(None),
        })
    }

    fn snapshot(&self) -> Job {
        self.job.lock().clone()
    }
}

/// Coordinator of all jobs.
pub struct JobManager {
    jobs: RwLock<HashMap<InfoHash, Arc<JobSlot>>>,
    gateway: Arc<dyn DebridGateway>,
    store: Arc<dyn JobStore>,
    scheduler: Arc<Scheduler>,
    downloader: Arc<Downloader>,
    profile: TuningProfile,
    download_root: PathBuf,
    backoff: BackoffPolicy,
    metrics: Arc<Metrics>,
    event_tx: broadcast::Sender<JobEvent>,
    shutdown: CancellationToken,
}

impl JobManager {
    /// Build the manager and recover persisted jobs.
    ///
    /// Jobs found in `downloading` are rewound to `debrid_ready` (the direct
    /// URL is gone and must be re-unlocked); jobs in `debrid_pending` resume
    /// polling. Terminal jobs are left untouched.
    pub async fn new(
        profile: TuningProfile,
        download_root: PathBuf,
        gateway: Arc<dyn DebridGateway>,
        store: Arc<dyn JobStore>,
    ) -> Result<Arc<Self>> {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let scheduler = Scheduler::new(profile.max_concurrent_large, profile.max_concurrent_small);
        let downloader = Arc::new(Downloader::new(profile.clone())?);

        let manager = Arc::new(Self {
            jobs: RwLock::new(HashMap::new()),
            gateway,
            store,
            scheduler,
            downloader,
            profile,
            download_root,
            backoff: BackoffPolicy::default(),
            metrics: Arc::new(Metrics::new()),
            event_tx,
            shutdown: CancellationToken::new(),
        });

        manager.recover().await?;
        Ok(manager)
    }

    /// Restart rewind: a job caught mid-download re-enters through the
    /// scheduler (the direct URL is gone), a pending job without a recorded
    /// debrid id starts over.
    fn rewound_state(job: &Job) -> Option<JobState> {
        match job.state {
            JobState::Downloading => Some(JobState::DebridReady),
            JobState::DebridPending if job.debrid_id.is_none() => Some(JobState::Queued),
            _ => None,
        }
    }

    async fn recover(self: &Arc<Self>) -> Result<()> {
        let persisted = self.store.iter().await?;

        for mut job in persisted {
            if let Some(state) = Self::rewound_state(&job) {
                tracing::info!(hash = %job.info_hash, from = %job.state, to = %state, "rewinding job after restart");
                job.state = state;
                job.speed_bps = 0;
                self.store.put(&job).await?;
            }

            let hash = job.info_hash.clone();
            let active = job.state.is_active();
            self.jobs
                .write()
                .insert(hash.clone(), JobSlot::new(job));

            if active {
                self.spawn_driver(hash);
            }
        }

        Ok(())
    }

    // -- Operations ---------------------------------------------------------

    /// Add a job from a magnet URI. Re-adding an existing hash is idempotent
    /// and returns the existing record.
    pub async fn add_magnet(
        self: &Arc<Self>,
        magnet_uri: &str,
        category: &str,
        save_path: Option<PathBuf>,
    ) -> Result<Job> {
        let magnet = Magnet::parse(magnet_uri)?;
        let display_name = magnet.name();
        self.add_job(
            magnet.info_hash,
            magnet.original_uri,
            display_name,
            category,
            save_path,
        )
        .await
    }

    /// Add a job from uploaded .torrent bytes. The info-hash is extracted
    /// from the metainfo and submitted to the gateway as a bare magnet.
    pub async fn add_torrent_bytes(
        self: &Arc<Self>,
        torrent: &[u8],
        category: &str,
        save_path: Option<PathBuf>,
    ) -> Result<Job> {
        let hash = torrent_info_hash(torrent)?;
        let source = format!("magnet:?xt=urn:btih:{}", hash);
        let display_name = hash.as_str().to_string();
        self.add_job(hash, source, display_name, category, save_path)
            .await
    }

    async fn add_job(
        self: &Arc<Self>,
        hash: InfoHash,
        source: String,
        display_name: String,
        category: &str,
        save_path: Option<PathBuf>,
    ) -> Result<Job> {
        if let Some(existing) = self.get(&hash) {
            tracing::debug!(%hash, "job already present, add is a no-op");
            return Ok(existing);
        }

        let save_path = save_path.unwrap_or_else(|| {
            if category.is_empty() {
                self.download_root.clone()
            } else {
                self.download_root.join(category)
            }
        });

        let job = Job::new(
            hash.clone(),
            source,
            display_name,
            category.to_string(),
            save_path,
        );

        self.jobs
            .write()
            .insert(hash.clone(), JobSlot::new(job.clone()));
        self.store.put(&job).await?;
        self.metrics.job_added();
        let _ = self.event_tx.send(JobEvent::Added { hash: hash.clone() });

        self.spawn_driver(hash);
        Ok(job)
    }

    /// Pause a job: the worker stops at the next buffer boundary and the
    /// partial file is kept. Pausing a non-active job is a no-op.
    pub async fn pause(&self, hash: &InfoHash) -> Result<()> {
        let slot = self.slot(hash)?;

        let to_persist = {
            let mut job = slot.job.lock();
            if !job.state.is_active() {
                return Ok(());
            }
            let from = job.state.clone();
            job.state = JobState::Paused;
            job.speed_bps = 0;
            let _ = self.event_tx.send(JobEvent::StateChanged {
                hash: hash.clone(),
                from,
                to: JobState::Paused,
            });
            job.clone()
        };
        self.store.put(&to_persist).await?;

        // State is already Paused, so the driver observing cancellation
        // leaves it alone.
        if let Some(cancel) = slot.cancel.lock().take() {
            cancel.cancel();
        }
        self.scheduler.kick();
        Ok(())
    }

    /// Resume a paused job; it re-enters the pipeline through the scheduler
    /// at the point its record allows. Resuming a non-paused job is a no-op.
    pub async fn resume(self: &Arc<Self>, hash: &InfoHash) -> Result<()> {
        let slot = self.slot(hash)?;

        let to_persist = {
            let mut job = slot.job.lock();
            if job.state != JobState::Paused {
                return Ok(());
            }
            let to = if !job.files.is_empty() {
                JobState::DebridReady
            } else if job.debrid_id.is_some() {
                JobState::DebridPending
            } else {
                JobState::Queued
            };
            job.state = to.clone();
            let _ = self.event_tx.send(JobEvent::StateChanged {
                hash: hash.clone(),
                from: JobState::Paused,
                to,
            });
            job.clone()
        };
        self.store.put(&to_persist).await?;

        self.spawn_driver(hash.clone());
        Ok(())
    }

    /// Delete a job, cancelling any work and optionally removing its files.
    /// Deleting an unknown hash is a no-op.
    pub async fn delete(&self, hash: &InfoHash, also_files: bool) -> Result<()> {
        let slot = match self.jobs.write().remove(hash) {
            Some(slot) => slot,
            None => return Ok(()),
        };

        if let Some(cancel) = slot.cancel.lock().take() {
            cancel.cancel();
        }

        let job = slot.snapshot();
        self.store.delete(hash).await?;

        // Best-effort: drop the magnet on the service side too.
        if let Some(debrid_id) = job.debrid_id {
            let gateway = Arc::clone(&self.gateway);
            tokio::spawn(async move {
                if let Err(e) = gateway.forget(debrid_id).await {
                    tracing::debug!(debrid_id, error = %e, "failed to forget magnet on delete");
                }
            });
        }

        if also_files {
            for file in &job.files {
                let path = job.save_path.join(sanitize_file_name(&file.name));
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!(path = %path.display(), error = %e, "failed to remove file on delete");
                    }
                }
            }
        }

        let _ = self.event_tx.send(JobEvent::Removed { hash: hash.clone() });
        self.scheduler.kick();
        Ok(())
    }

    /// Snapshot of every job.
    pub fn list(&self) -> Vec<Job> {
        self.jobs.read().values().map(|s| s.snapshot()).collect()
    }

    /// Snapshot of one job.
    pub fn get(&self, hash: &InfoHash) -> Option<Job> {
        self.jobs.read().get(hash).map(|s| s.snapshot())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.event_tx.subscribe()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn profile(&self) -> &TuningProfile {
        &self.profile
    }

    pub fn download_root(&self) -> &PathBuf {
        &self.download_root
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Graceful shutdown: cancel every worker.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let cancels: Vec<_> = self
            .jobs
            .read()
            .values()
            .filter_map(|s| s.cancel.lock().take())
            .collect();
        for cancel in cancels {
            cancel.cancel();
        }
    }

    // -- Pipeline -----------------------------------------------------------

    fn slot(&self, hash: &InfoHash) -> Result<Arc<JobSlot>> {
        self.jobs
            .read()
            .get(hash)
            .cloned()
            .ok_or_else(|| BrokerError::NotFound(hash.to_string()))
    }

    fn spawn_driver(self: &Arc<Self>, hash: InfoHash) {
        let slot = match self.slot(&hash) {
            Ok(slot) => slot,
            Err(_) => return,
        };

        let cancel = self.shutdown.child_token();
        {
            let mut guard = slot.cancel.lock();
            if guard.is_some() {
                // A worker is already bound to this job.
                return;
            }
            *guard = Some(cancel.clone());
        }

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let result = manager.run_pipeline(&hash, &slot, &cancel).await;

            // Unbind the worker. A cancelled token means pause or delete
            // already took it (and may have bound a successor).
            if !cancel.is_cancelled() {
                *slot.cancel.lock() = None;
            }

            match result {
                Ok(()) => {}
                Err(BrokerError::Cancelled) => {
                    // Pause and delete set the target state before
                    // cancelling; nothing more to do.
                    tracing::debug!(%hash, "worker cancelled");
                }
                Err(e) => manager.fail_job(&hash, &slot, e).await,
            }
        });
    }

    async fn fail_job(&self, hash: &InfoHash, slot: &JobSlot, error: BrokerError) {
        let message = error.to_string();
        tracing::warn!(%hash, error = %message, "job failed");

        let to_persist = {
            let mut job = slot.job.lock();
            let from = job.state.clone();
            job.state = JobState::Error;
            job.last_error = Some(message.clone());
            job.speed_bps = 0;
            let _ = self.event_tx.send(JobEvent::StateChanged {
                hash: hash.clone(),
                from,
                to: JobState::Error,
            });
            job.clone()
        };
        if let Err(e) = self.store.put(&to_persist).await {
            tracing::warn!(%hash, error = %e, "failed to persist error state");
        }

        self.metrics.job_failed();
        let _ = self.event_tx.send(JobEvent::Failed {
            hash: hash.clone(),
            error: message,
        });
        self.scheduler.kick();
    }

    /// Apply a transition only if the job is still in the expected state.
    /// Persists and emits on success.
    async fn try_transition(
        &self,
        hash: &InfoHash,
        slot: &JobSlot,
        from: JobState,
        to: JobState,
    ) -> Result<bool> {
        let to_persist = {
            let mut job = slot.job.lock();
            if job.state != from {
                return Ok(false);
            }
            job.state = to.clone();
            let _ = self.event_tx.send(JobEvent::StateChanged {
                hash: hash.clone(),
                from,
                to,
            });
            job.clone()
        };
        self.store.put(&to_persist).await?;
        Ok(true)
    }

    async fn run_pipeline(
        self: &Arc<Self>,
        hash: &InfoHash,
        slot: &Arc<JobSlot>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        // Phase 1+2: submission and polling. The submission permit is held
        // through the whole debrid_pending phase — pending jobs are what the
        // cap of outstanding submissions bounds.
        if matches!(
            slot.job.lock().state,
            JobState::Queued | JobState::DebridPending
        ) {
            let _permit = tokio::select! {
                permit = self.scheduler.acquire_submission() => permit,
                _ = cancel.cancelled() => return Err(BrokerError::Cancelled),
            };
            self.submit_and_poll(hash, slot, cancel).await?;
        }

        // Phase 3: download with retry under backoff.
        loop {
            if cancel.is_cancelled() {
                return Err(BrokerError::Cancelled);
            }

            let (size_total, threshold) = {
                let job = slot.job.lock();
                (job.size_total, self.profile.large_threshold)
            };
            let class = SizeClass::of(size_total, threshold);

            let permit = tokio::select! {
                permit = self.scheduler.acquire_run(hash.clone(), class) => permit,
                _ = cancel.cancelled() => return Err(BrokerError::Cancelled),
            };

            if !self
                .try_transition(hash, slot, JobState::DebridReady, JobState::Downloading)
                .await?
            {
                // Paused or deleted while waiting for the slot.
                return Err(BrokerError::Cancelled);
            }

            let done_before = slot.job.lock().size_done;
            let result = self.download_files(hash, slot, cancel).await;
            drop(permit);

            match result {
                Ok(()) => {
                    let to_persist = {
                        let mut job = slot.job.lock();
                        // A pause that raced the last write wins; the bytes
                        // are on disk and resume will observe completion.
                        if job.state != JobState::Downloading {
                            return Err(BrokerError::Cancelled);
                        }
                        job.state = JobState::Completed;
                        job.completed_at = Some(Utc::now());
                        job.speed_bps = 0;
                        job.attempt = 0;
                        let _ = self.event_tx.send(JobEvent::StateChanged {
                            hash: hash.clone(),
                            from: JobState::Downloading,
                            to: JobState::Completed,
                        });
                        job.clone()
                    };
                    self.store.put(&to_persist).await?;
                    self.metrics.job_completed();
                    let _ = self.event_tx.send(JobEvent::Completed { hash: hash.clone() });
                    self.scheduler.kick();
                    tracing::info!(%hash, "job completed");
                    return Ok(());
                }
                Err(BrokerError::Cancelled) => return Err(BrokerError::Cancelled),
                Err(e) if e.is_transient() => {
                    let attempt = {
                        let mut job = slot.job.lock();
                        // Byte progress resets the stall counter.
                        if job.size_done > done_before {
                            job.attempt = 0;
                        }
                        job.attempt += 1;
                        job.speed_bps = 0;
                        if matches!(e, BrokerError::UrlExpired) {
                            job.direct_url = None;
                            job.url_expires_at = None;
                        }
                        job.attempt
                    };

                    if attempt > MAX_STALLED_ATTEMPTS {
                        // Exhaustion escalates the transient cause to the
                        // terminal error state, keeping its message.
                        tracing::warn!(%hash, attempt, error = %e, "retries exhausted without progress");
                        return Err(e);
                    }

                    tracing::debug!(%hash, attempt, error = %e, "transient failure, backing off");
                    if !self
                        .try_transition(hash, slot, JobState::Downloading, JobState::DebridReady)
                        .await?
                    {
                        return Err(BrokerError::Cancelled);
                    }
                    if !self.backoff.wait(attempt - 1, cancel).await {
                        return Err(BrokerError::Cancelled);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Submit the magnet and poll until the debrid service reports ready.
    async fn submit_and_poll(
        &self,
        hash: &InfoHash,
        slot: &JobSlot,
        cancel: &CancellationToken,
    ) -> Result<()> {
        // Submission (skipped when recovering a debrid_pending job).
        let current_debrid_id = slot.job.lock().debrid_id;
        let debrid_id = match current_debrid_id {
            Some(id) => id,
            None => {
                if !self
                    .try_transition(hash, slot, JobState::Queued, JobState::DebridPending)
                    .await?
                {
                    return Err(BrokerError::Cancelled);
                }

                let source = slot.job.lock().source.clone();
                let mut attempt = 0;
                let id = loop {
                    match self.gateway.submit(&source).await {
                        Ok(id) => break id,
                        Err(BrokerError::DebridUnavailable(msg)) => {
                            attempt += 1;
                            if attempt >= MAX_SUBMIT_ATTEMPTS {
                                return Err(BrokerError::DebridUnavailable(msg));
                            }
                            if !self.backoff.wait(attempt, cancel).await {
                                return Err(BrokerError::Cancelled);
                            }
                        }
                        Err(e) => return Err(e),
                    }
                };

                let to_persist = {
                    let mut job = slot.job.lock();
                    job.debrid_id = Some(id);
                    job.clone()
                };
                self.store.put(&to_persist).await?;
                id
            }
        };

        // Polling: 2 s for the first 30 s, then 5 s, up to the 5-minute cap.
        let started = Instant::now();
        loop {
            if cancel.is_cancelled() {
                return Err(BrokerError::Cancelled);
            }
            if started.elapsed() > PROCESSING_CAP {
                return Err(BrokerError::DebridProcessingFailed(
                    "debrid processing timed out".to_string(),
                ));
            }

            match self.gateway.status(debrid_id).await {
                Ok(DebridStatus::Ready { files }) => {
                    let to_persist = {
                        let mut job = slot.job.lock();
                        if job.state != JobState::DebridPending {
                            return Err(BrokerError::Cancelled);
                        }
                        // Keep watermarks when recovery re-reports the same
                        // file list; otherwise adopt the reported one.
                        if job.files.len() != files.len()
                            || job
                                .files
                                .iter()
                                .zip(files.iter())
                                .any(|(a, b)| a.hosted_url != b.hosted_url || a.size != b.size)
                        {
                            job.files = files
                                .iter()
                                .map(|f| JobFile {
                                    name: f.name.clone(),
                                    size: f.size,
                                    hosted_url: f.hosted_url.clone(),
                                    done: 0,
                                    segments: Vec::new(),
                                })
                                .collect();
                        }
                        job.size_total = job.files.iter().map(|f| f.size).sum();
                        job.recount_done();
                        // A magnet without a display name inherits the
                        // debrid-reported one.
                        if job.display_name == job.info_hash.as_str() {
                            if let Some(first) = job.files.first() {
                                job.display_name = first.name.clone();
                            }
                        }
                        job.state = JobState::DebridReady;
                        let _ = self.event_tx.send(JobEvent::StateChanged {
                            hash: hash.clone(),
                            from: JobState::DebridPending,
                            to: JobState::DebridReady,
                        });
                        job.clone()
                    };
                    self.store.put(&to_persist).await?;
                    return Ok(());
                }
                Ok(DebridStatus::Error { reason }) => {
                    return Err(BrokerError::DebridProcessingFailed(reason));
                }
                Ok(DebridStatus::Processing) => {}
                Err(BrokerError::DebridUnavailable(e)) => {
                    tracing::debug!(%hash, error = %e, "status poll failed, will retry");
                }
                Err(e) => return Err(e),
            }

            let interval = poll_interval(started.elapsed());
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.cancelled() => return Err(BrokerError::Cancelled),
            }
        }
    }

    /// Download every file of the job sequentially. A per-second persister
    /// runs alongside; progress callbacks update the job record in place.
    async fn download_files(
        self: &Arc<Self>,
        hash: &InfoHash,
        slot: &Arc<JobSlot>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let persister = self.spawn_persister(hash.clone(), Arc::clone(slot));

        let result = self.download_files_inner(hash, slot, cancel).await;

        persister.abort();
        // One final persisted snapshot so restart resumes from the tail.
        let snapshot = slot.snapshot();
        if let Err(e) = self.store.put(&snapshot).await {
            tracing::warn!(%hash, error = %e, "failed to persist final download snapshot");
        }

        result
    }

    async fn download_files_inner(
        &self,
        hash: &InfoHash,
        slot: &Arc<JobSlot>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let file_count = slot.job.lock().files.len();

        for index in 0..file_count {
            let (file, save_path) = {
                let job = slot.job.lock();
                (job.files[index].clone(), job.save_path.clone())
            };
            if file.size > 0 && file.is_complete() {
                continue;
            }

            let direct_url = self.ensure_unlocked(slot, index, &file).await?;

            // The unlock may have filled in a missing size.
            let file = slot.job.lock().files[index].clone();

            let req = FetchRequest {
                url: direct_url,
                path: save_path.join(sanitize_file_name(&file.name)),
                size_total: file.size,
                segments: file.segments.clone(),
                offset: file.done,
            };

            let slot_cb = Arc::clone(slot);
            let event_tx = self.event_tx.clone();
            let metrics = Arc::clone(&self.metrics);
            let hash_cb = hash.clone();
            self.downloader
                .fetch(&req, cancel, move |progress| {
                    let mut job = slot_cb.job.lock();
                    if let Some(f) = job.files.get_mut(index) {
                        let previous = f.done;
                        f.done = progress.done;
                        f.segments = progress.segments.clone();
                        metrics.bytes_downloaded(progress.done.saturating_sub(previous));
                    }
                    job.recount_done();
                    job.speed_bps = progress.speed_bps;
                    let _ = event_tx.send(JobEvent::Progress {
                        hash: hash_cb.clone(),
                        done: job.size_done,
                        speed_bps: job.speed_bps,
                    });
                })
                .await?;

            let mut job = slot.job.lock();
            if let Some(f) = job.files.get_mut(index) {
                f.done = f.size;
                f.segments.clear();
            }
            job.recount_done();
            // The next file needs its own unlock.
            job.direct_url = None;
            job.url_expires_at = None;
        }

        Ok(())
    }

    /// Make sure the job holds a live direct URL for the file at `index`,
    /// unlocking (or re-unlocking) through the gateway when needed.
    async fn ensure_unlocked(
        &self,
        slot: &JobSlot,
        index: usize,
        file: &JobFile,
    ) -> Result<String> {
        {
            let job = slot.job.lock();
            if let (Some(url), Some(expires_at)) = (&job.direct_url, job.url_expires_at) {
                if Instant::now() < expires_at {
                    return Ok(url.clone());
                }
            }
        }

        let unlocked = self.gateway.unlock(&file.hosted_url).await?;

        let mut job = slot.job.lock();
        job.direct_url = Some(unlocked.direct_url.clone());
        job.url_expires_at = Some(Instant::now() + unlocked.ttl);

        // Plain-link listings sometimes omit sizes; the unlock response is
        // the first place the real size shows up.
        if let (Some(f), Some(size)) = (job.files.get_mut(index), unlocked.size_hint) {
            if f.size == 0 {
                f.size = size;
                job.size_total = job.files.iter().map(|f| f.size).sum();
            }
        }

        Ok(unlocked.direct_url)
    }

    fn spawn_persister(&self, hash: InfoHash, slot: Arc<JobSlot>) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PERSIST_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let job = slot.snapshot();
                if job.state != JobState::Downloading {
                    break;
                }
                if let Err(e) = store.put(&job).await {
                    tracing::debug!(%hash, error = %e, "progress persist failed");
                }
            }
        })
    }
}

/// Derive an on-disk file name from a debrid-reported one: path separators
/// and NUL are stripped, whitespace collapsed, and the result truncated to
/// 200 bytes of valid UTF-8.
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| !matches!(c, '/' | '\\' | '\0'))
        .collect();
    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");

    let mut out = collapsed;
    if out.is_empty() {
        out = "download".to_string();
    }
    while out.len() > 200 {
        let mut cut = out.len() - 1;
        while !out.is_char_boundary(cut) {
            cut -= 1;
        }
        out.truncate(cut);
    }
    out
}

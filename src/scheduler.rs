//! Admission scheduler
//!
//! Maintains the ready set partitioned by size class and enforces the tuning
//! profile's concurrency limits:
//!
//! - FIFO within each class; a job is granted a run slot only when it is at
//!   the front of its class queue and a slot is free.
//! - Jobs waiting on the debrid service hold a submission permit (cap 16)
//!   instead of a run slot.
//! - A free large slot with no large job waiting may carry up to two extra
//!   small jobs; small slots never upgrade to large.
//!
//! Permits are RAII: dropping one releases the slot and wakes every waiter
//! for a re-check. Running jobs are never interrupted by admission decisions.

use crate::types::InfoHash;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

/// Cap on outstanding debrid submissions.
pub const MAX_PENDING_SUBMISSIONS: usize = 16;

/// Size class of a job relative to the profile threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
    Small,
    Large,
}

impl SizeClass {
    pub fn of(size_total: u64, threshold: u64) -> Self {
        if size_total >= threshold {
            Self::Large
        } else {
            Self::Small
        }
    }
}

#[derive(Debug)]
struct Ticket {
    hash: InfoHash,
    sequence: u64,
}

struct Inner {
    large_limit: usize,
    small_limit: usize,
    large_running: usize,
    small_running: usize,
    /// Small jobs running beyond `small_limit` on lent large capacity
    small_borrowed: usize,
    waiting_large: VecDeque<Ticket>,
    waiting_small: VecDeque<Ticket>,
}

impl Inner {
    /// Large slots consumed by borrowed smalls (two smalls per slot).
    fn borrowed_slots(&self) -> usize {
        self.small_borrowed.div_ceil(2)
    }

    fn can_grant_large(&self) -> bool {
        self.large_running + self.borrowed_slots() < self.large_limit
    }

    /// Whether a small grant is possible, and whether it borrows.
    fn can_grant_small(&self) -> Option<bool> {
        if self.small_running < self.small_limit {
            return Some(false);
        }
        let free_large = self.large_limit.saturating_sub(self.large_running);
        if self.waiting_large.is_empty() && (self.small_borrowed + 1).div_ceil(2) <= free_large {
            return Some(true);
        }
        None
    }
}

/// Run-slot and submission admission over pending jobs.
pub struct Scheduler {
    submissions: Arc<Semaphore>,
    inner: Mutex<Inner>,
    sequence: AtomicU64,
    notify: Notify,
}

/// A granted run slot. Dropping it frees the slot and wakes waiters.
pub struct RunPermit {
    scheduler: Arc<Scheduler>,
    class: SizeClass,
    borrowed: bool,
}

impl Drop for RunPermit {
    fn drop(&mut self) {
        {
            let mut inner = self.scheduler.inner.lock();
            match self.class {
                SizeClass::Large => inner.large_running -= 1,
                SizeClass::Small => {
                    inner.small_running -= 1;
                    if self.borrowed {
                        inner.small_borrowed -= 1;
                    }
                }
            }
        }
        self.scheduler.notify.notify_waiters();
    }
}

impl Scheduler {
    pub fn new(large_limit: usize, small_limit: usize) -> Arc<Self> {
        Arc::new(Self {
            submissions: Arc::new(Semaphore::new(MAX_PENDING_SUBMISSIONS)),
            inner: Mutex::new(Inner {
                large_limit,
                small_limit,
                large_running: 0,
                small_running: 0,
                small_borrowed: 0,
                waiting_large: VecDeque::new(),
                waiting_small: VecDeque::new(),
            }),
            sequence: AtomicU64::new(0),
            notify: Notify::new(),
        })
    }

    /// Acquire a submission permit before posting a magnet to the gateway.
    /// Polling a pending magnet is cheap, so these do not consume run slots,
    /// but the cap keeps a flood of adds from hammering the service.
    pub async fn acquire_submission(&self) -> OwnedSemaphorePermit {
        Arc::clone(&self.submissions)
            .acquire_owned()
            .await
            .expect("submission semaphore never closed")
    }

    /// Wait for a run slot in FIFO order within the job's size class.
    pub async fn acquire_run(self: &Arc<Self>, hash: InfoHash, class: SizeClass) -> RunPermit {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        {
            let mut inner = self.inner.lock();
            let ticket = Ticket {
                hash: hash.clone(),
                sequence,
            };
            match class {
                SizeClass::Large => inner.waiting_large.push_back(ticket),
                SizeClass::Small => inner.waiting_small.push_back(ticket),
            }
        }

        // Guard removes the ticket if this future is dropped before a grant
        // (pause/delete while queued).
        let mut guard = WaitGuard {
            scheduler: Arc::clone(self),
            sequence,
            granted: false,
        };

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock();
                let front_seq = match class {
                    SizeClass::Large => inner.waiting_large.front().map(|t| t.sequence),
                    SizeClass::Small => inner.waiting_small.front().map(|t| t.sequence),
                };
                if front_seq == Some(sequence) {
                    match class {
                        SizeClass::Large if inner.can_grant_large() => {
                            inner.waiting_large.pop_front();
                            inner.large_running += 1;
                            guard.granted = true;
                            tracing::debug!(%hash, "run slot granted (large)");
                            return RunPermit {
                                scheduler: Arc::clone(self),
                                class,
                                borrowed: false,
                            };
                        }
                        SizeClass::Small => {
                            if let Some(borrowed) = inner.can_grant_small() {
                                inner.waiting_small.pop_front();
                                inner.small_running += 1;
                                if borrowed {
                                    inner.small_borrowed += 1;
                                }
                                guard.granted = true;
                                tracing::debug!(%hash, borrowed, "run slot granted (small)");
                                return RunPermit {
                                    scheduler: Arc::clone(self),
                                    class,
                                    borrowed,
                                };
                            }
                        }
                        _ => {}
                    }
                }
            }

            notified.await;
        }
    }

    /// Remove a waiting ticket by sequence number.
    fn remove_ticket(&self, sequence: u64) {
        let mut inner = self.inner.lock();
        inner.waiting_large.retain(|t| t.sequence != sequence);
        inner.waiting_small.retain(|t| t.sequence != sequence);
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Wake all waiters for a re-check. Called on admission-relevant events
    /// that do not release a permit themselves.
    pub fn kick(&self) {
        self.notify.notify_waiters();
    }

    /// (large, small) jobs currently holding run slots.
    pub fn running_counts(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        (inner.large_running, inner.small_running)
    }

    /// Jobs waiting for a run slot, both classes combined.
    pub fn waiting_count(&self) -> usize {
        let inner = self.inner.lock();
        inner.waiting_large.len() + inner.waiting_small.len()
    }
}

struct WaitGuard {
    scheduler: Arc<Scheduler>,
    sequence: u64,
    granted: bool,
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        if !self.granted {
            self.scheduler.remove_ticket(self.sequence);
        }
    }
}

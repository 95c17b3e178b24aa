//! Bounded byte ring between the network readers and the disk writer
//!
//! Capacity is accounted in bytes through a semaphore: a producer awaits
//! permits for a chunk's length before it enters the ring, and the permits
//! travel with the chunk so they are released only once the writer has
//! finished with it. Resident bytes — queued plus held by the writer — can
//! therefore never exceed the configured capacity, which is what gives each
//! job its memory bound.

use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};

/// One span of downloaded bytes, tagged with its absolute file offset and
/// the index of the segment that produced it.
pub struct Chunk {
    pub offset: u64,
    pub data: Bytes,
    pub segment: usize,
    _permit: Option<OwnedSemaphorePermit>,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Offset one past the last byte of this chunk.
    pub fn end_offset(&self) -> u64 {
        self.offset + self.data.len() as u64
    }
}

/// Create a ring with the given byte capacity.
pub fn ring(capacity: usize) -> (RingProducer, RingConsumer) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sem = Arc::new(Semaphore::new(capacity));
    (
        RingProducer {
            tx,
            sem: Arc::clone(&sem),
            capacity,
        },
        RingConsumer { rx, sem, capacity },
    )
}

/// Producing side; one clone per download connection.
#[derive(Clone)]
pub struct RingProducer {
    tx: mpsc::UnboundedSender<Chunk>,
    sem: Arc<Semaphore>,
    capacity: usize,
}

impl RingProducer {
    /// Enqueue a chunk, waiting for buffer space. Returns `false` when the
    /// consumer is gone.
    pub async fn push(&self, segment: usize, offset: u64, data: Bytes) -> bool {
        if data.is_empty() {
            return true;
        }
        // A chunk larger than the whole ring would never fit; clamp so it
        // still passes through (alone) rather than deadlocking.
        let want = data.len().min(self.capacity) as u32;
        let permit = match Arc::clone(&self.sem).acquire_many_owned(want).await {
            Ok(p) => p,
            Err(_) => return false,
        };
        self.tx
            .send(Chunk {
                offset,
                data,
                segment,
                _permit: Some(permit),
            })
            .is_ok()
    }
}

/// Consuming side; owned by the disk writer.
pub struct RingConsumer {
    rx: mpsc::UnboundedReceiver<Chunk>,
    sem: Arc<Semaphore>,
    capacity: usize,
}

impl RingConsumer {
    /// Wait for the next chunk. `None` once every producer has dropped and
    /// the ring has drained.
    pub async fn pop(&mut self) -> Option<Chunk> {
        self.rx.recv().await
    }

    /// Take a chunk only if one is already queued.
    pub fn try_pop(&mut self) -> Option<Chunk> {
        self.rx.try_recv().ok()
    }

    /// Bytes currently resident (queued or held by un-dropped chunks).
    pub fn buffered(&self) -> usize {
        self.capacity - self.sem.available_permits()
    }
}

//! Job persistence
//!
//! Durable map from info-hash to serialized job record. SQLite (WAL mode)
//! backs the production store; an in-memory variant keeps tests hermetic.
//! Writes on state transitions are awaited by the caller; progress writes
//! while downloading are throttled upstream to once per second.

pub mod sqlite;

pub use sqlite::SqliteStore;

use crate::error::Result;
use crate::types::{InfoHash, Job};
use async_trait::async_trait;

/// Storage trait for persisting job state across restarts.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert or replace a job record.
    async fn put(&self, job: &Job) -> Result<()>;

    /// Load a job by info-hash.
    async fn get(&self, hash: &InfoHash) -> Result<Option<Job>>;

    /// Remove a job record.
    async fn delete(&self, hash: &InfoHash) -> Result<()>;

    /// Load every stored job.
    async fn iter(&self) -> Result<Vec<Job>>;
}

/// In-memory store for testing.
#[derive(Debug, Default)]
pub struct MemoryStore {
    jobs: parking_lot::RwLock<std::collections::HashMap<InfoHash, Job>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn put(&self, job: &Job) -> Result<()> {
        self.jobs
            .write()
            .insert(job.info_hash.clone(), job.clone());
        Ok(())
    }

    async fn get(&self, hash: &InfoHash) -> Result<Option<Job>> {
        Ok(self.jobs.read().get(hash).cloned())
    }

    async fn delete(&self, hash: &InfoHash) -> Result<()> {
        self.jobs.write().remove(hash);
        Ok(())
    }

    async fn iter(&self) -> Result<Vec<Job>> {
        Ok(self.jobs.read().values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobState;
    use std::path::PathBuf;

    fn test_job(n: u8) -> Job {
        let hash = InfoHash::parse(&format!("{:040x}", n)).unwrap();
        Job::new(
            hash.clone(),
            format!("magnet:?xt=urn:btih:{}", hash),
            format!("job-{}", n),
            "radarr".into(),
            PathBuf::from("/downloads/radarr"),
        )
    }

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryStore::new();
        let mut job = test_job(1);
        job.state = JobState::DebridPending;
        job.size_total = 4096;

        store.put(&job).await.unwrap();

        let loaded = store.get(&job.info_hash).await.unwrap().unwrap();
        assert_eq!(loaded.state, JobState::DebridPending);
        assert_eq!(loaded.size_total, 4096);

        assert_eq!(store.iter().await.unwrap().len(), 1);

        store.delete(&job.info_hash).await.unwrap();
        assert!(store.get(&job.info_hash).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn put_overwrites() {
        let store = MemoryStore::new();
        let mut job = test_job(2);
        store.put(&job).await.unwrap();

        job.size_done = 1000;
        store.put(&job).await.unwrap();

        let loaded = store.get(&job.info_hash).await.unwrap().unwrap();
        assert_eq!(loaded.size_done, 1000);
        assert_eq!(store.iter().await.unwrap().len(), 1);
    }
}

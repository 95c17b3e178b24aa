//! SQLite store
//!
//! Single-table layout: the job record is stored as serialized JSON keyed by
//! info-hash, with the state mirrored into an indexed column for inspection.
//! WAL mode keeps commits atomic across crashes. Connection access is
//! serialized through a mutex and every call runs on the blocking pool.

use super::JobStore;
use crate::error::{BrokerError, Result};
use crate::types::{InfoHash, Job};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

/// SQLite-backed job store.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

/// Current schema version — bump when adding migrations.
const CURRENT_SCHEMA_VERSION: u32 = 1;

const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    info_hash TEXT PRIMARY KEY,
    state TEXT NOT NULL,
    record TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state);
"#;

fn migrate(conn: &Connection) -> std::result::Result<(), rusqlite::Error> {
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if version < 1 {
        conn.execute_batch(SCHEMA_V1)?;
        conn.pragma_update(None, "user_version", 1)?;
    }

    debug_assert_eq!(
        conn.pragma_query_value(None, "user_version", |row| row.get::<_, u32>(0))
            .unwrap(),
        CURRENT_SCHEMA_VERSION
    );

    Ok(())
}

impl SqliteStore {
    /// Open (or create) the store at the given path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    BrokerError::Store(format!("failed to create store directory: {}", e))
                })?;
            }
        }

        let path = path.to_path_buf();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            let conn = Connection::open(&path)?;

            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;

            migrate(&conn)?;
            Ok(conn)
        })
        .await
        .map_err(|e| BrokerError::Store(format!("failed to initialize store: {}", e)))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database for testing.
    pub async fn in_memory() -> Result<Self> {
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            let conn = Connection::open_in_memory()?;
            migrate(&conn)?;
            Ok(conn)
        })
        .await
        .map_err(|e| BrokerError::Store(format!("failed to create in-memory store: {}", e)))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn put(&self, job: &Job) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        let record = serde_json::to_string(job)?;
        let hash = job.info_hash.as_str().to_string();
        let state = job.state.to_string();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = conn.blocking_lock();
            conn.execute(
                r#"
                INSERT INTO jobs (info_hash, state, record, updated_at)
                VALUES (?1, ?2, ?3, datetime('now'))
                ON CONFLICT(info_hash) DO UPDATE SET
                    state = excluded.state,
                    record = excluded.record,
                    updated_at = excluded.updated_at
                "#,
                params![hash, state, record],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| BrokerError::Store(format!("failed to save job: {}", e)))?
    }

    async fn get(&self, hash: &InfoHash) -> Result<Option<Job>> {
        let conn = Arc::clone(&self.conn);
        let hash = hash.as_str().to_string();

        tokio::task::spawn_blocking(move || -> Result<Option<Job>> {
            let conn = conn.blocking_lock();
            let record: Option<String> = conn
                .query_row(
                    "SELECT record FROM jobs WHERE info_hash = ?1",
                    params![hash],
                    |row| row.get(0),
                )
                .optional()?;

            match record {
                Some(json) => Ok(Some(serde_json::from_str(&json)?)),
                None => Ok(None),
            }
        })
        .await
        .map_err(|e| BrokerError::Store(format!("failed to load job: {}", e)))?
    }

    async fn delete(&self, hash: &InfoHash) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        let hash = hash.as_str().to_string();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = conn.blocking_lock();
            conn.execute("DELETE FROM jobs WHERE info_hash = ?1", params![hash])?;
            Ok(())
        })
        .await
        .map_err(|e| BrokerError::Store(format!("failed to delete job: {}", e)))?
    }

    async fn iter(&self) -> Result<Vec<Job>> {
        let conn = Arc::clone(&self.conn);

        tokio::task::spawn_blocking(move || -> Result<Vec<Job>> {
            let conn = conn.blocking_lock();
            let mut stmt = conn.prepare("SELECT record FROM jobs ORDER BY updated_at ASC")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

            let mut jobs = Vec::new();
            for row in rows {
                let json = row?;
                match serde_json::from_str(&json) {
                    Ok(job) => jobs.push(job),
                    Err(e) => {
                        // A record that no longer deserializes is dropped
                        // rather than wedging startup.
                        tracing::warn!(error = %e, "skipping undecodable job record");
                    }
                }
            }
            Ok(jobs)
        })
        .await
        .map_err(|e| BrokerError::Store(format!("failed to load jobs: {}", e)))?
    }
}

//! # debrid-broker
//!
//! A download broker that accepts magnet links through a
//! qBittorrent-compatible HTTP surface, forwards them to a debrid service,
//! and streams the resulting direct HTTP(S) files to local storage under a
//! strict per-job memory bound.
//!
//! ## Architecture
//!
//! - **qBittorrent API adapter**: what Sonarr/Radarr talk to
//! - **Job manager**: one state machine per job, from magnet to fsync
//! - **Debrid gateway**: submit / poll / unlock against the external service
//! - **Scheduler**: size-class FIFO admission tuned to the storage medium
//! - **Downloader**: ring-buffered streaming writes with resume support
//! - **Storage probe**: classifies the download disk as hdd or ssd
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use debrid_broker::{
//!     debrid::AllDebridClient, manager::JobManager, storage::SqliteStore,
//!     types::TuningProfile,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let gateway = Arc::new(AllDebridClient::new(
//!         "https://api.alldebrid.com/v4",
//!         "api-key",
//!     )?);
//!     let store = Arc::new(SqliteStore::open("/config/jobs.db").await?);
//!     let manager = JobManager::new(
//!         TuningProfile::hdd(),
//!         "/downloads".into(),
//!         gateway,
//!         store,
//!     )
//!     .await?;
//!
//!     let job = manager
//!         .add_magnet("magnet:?xt=urn:btih:...", "radarr", None)
//!         .await?;
//!     println!("tracking {}", job.info_hash);
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod debrid;
pub mod downloader;
pub mod error;
pub mod magnet;
pub mod manager;
pub mod metrics;
pub mod probe;
pub mod retry;
pub mod scheduler;
pub mod storage;
pub mod types;

pub use config::{BrokerConfig, StorageMode};
pub use debrid::{AllDebridClient, DebridGateway, DebridStatus};
pub use downloader::Downloader;
pub use error::{BrokerError, Result};
pub use manager::JobManager;
pub use scheduler::Scheduler;
pub use storage::{JobStore, MemoryStore, SqliteStore};
pub use types::{InfoHash, Job, JobState, StorageKind, TuningProfile};

//! Broker configuration
//!
//! Configuration is read from environment-style key/value pairs, the way the
//! container image is driven. Storage-dependent defaults (connection count,
//! buffer size, flush interval) stay unset until the storage probe runs and
//! are then resolved into a [`TuningProfile`].

use crate::error::{BrokerError, Result};
use crate::types::{StorageKind, TuningProfile};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Storage classification mode: probe or forced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// Probe the download directory at startup
    #[default]
    Auto,
    /// Skip the probe, assume rotational
    Hdd,
    /// Skip the probe, assume solid-state
    Ssd,
}

impl std::str::FromStr for StorageMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "hdd" => Ok(Self::Hdd),
            "ssd" => Ok(Self::Ssd),
            _ => Err(format!("Invalid storage type: {}", s)),
        }
    }
}

/// Main configuration for the broker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Debrid API key (required)
    pub debrid_api_key: String,

    /// Debrid API base URL
    pub debrid_base_url: String,

    /// Address the qBittorrent-compatible API binds to
    pub api_bind: SocketAddr,

    /// Root directory for downloaded files
    pub download_path: PathBuf,

    /// Directory for the job store database
    pub state_path: PathBuf,

    /// Storage classification mode
    pub storage_type: StorageMode,

    /// Profile overrides; `None` falls back to the probed profile's value
    pub max_concurrent_large: Option<usize>,
    pub max_concurrent_small: Option<usize>,
    pub large_threshold_bytes: Option<u64>,
    pub disk_buffer_bytes: Option<usize>,
    pub write_batch_bytes: Option<usize>,
    pub flush_interval_seconds: Option<u64>,
    pub max_connections_per_job: Option<usize>,
    pub file_allocate: Option<bool>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            debrid_api_key: String::new(),
            debrid_base_url: "https://api.alldebrid.com/v4".to_string(),
            api_bind: "0.0.0.0:6500".parse().expect("static addr"),
            download_path: PathBuf::from("/downloads"),
            state_path: PathBuf::from("/config"),
            storage_type: StorageMode::Auto,
            max_concurrent_large: None,
            max_concurrent_small: None,
            large_threshold_bytes: None,
            disk_buffer_bytes: None,
            write_batch_bytes: None,
            flush_interval_seconds: None,
            max_connections_per_job: None,
            file_allocate: None,
        }
    }
}

impl BrokerConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        config.debrid_api_key = std::env::var("DEBRID_API_KEY").map_err(|_| {
            BrokerError::invalid_input("DEBRID_API_KEY", "environment variable is required")
        })?;

        if let Ok(v) = std::env::var("DEBRID_BASE_URL") {
            config.debrid_base_url = v;
        }
        if let Ok(v) = std::env::var("API_BIND") {
            config.api_bind = v.parse().map_err(|e| {
                BrokerError::invalid_input("API_BIND", format!("not a socket address: {}", e))
            })?;
        }
        if let Ok(v) = std::env::var("DOWNLOAD_PATH") {
            config.download_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("STATE_PATH") {
            config.state_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("STORAGE_TYPE") {
            config.storage_type = v
                .parse()
                .map_err(|e: String| BrokerError::invalid_input("STORAGE_TYPE", e))?;
        }

        config.max_concurrent_large = parse_env("MAX_CONCURRENT_LARGE")?;
        config.max_concurrent_small = parse_env("MAX_CONCURRENT_SMALL")?;
        config.large_threshold_bytes = parse_env("LARGE_THRESHOLD_BYTES")?;
        config.disk_buffer_bytes = parse_env("DISK_BUFFER_BYTES")?;
        config.write_batch_bytes = parse_env("WRITE_BATCH_BYTES")?;
        config.flush_interval_seconds = parse_env("FLUSH_INTERVAL_SECONDS")?;
        config.max_connections_per_job = parse_env("MAX_CONNECTIONS_PER_JOB")?;
        config.file_allocate = parse_env("FILE_ALLOCATE")?;

        Ok(config)
    }

    /// Resolve the effective tuning profile: probed/forced base values with
    /// explicit overrides applied on top.
    pub fn resolve_profile(&self, probed: StorageKind) -> TuningProfile {
        let kind = match self.storage_type {
            StorageMode::Auto => probed,
            StorageMode::Hdd => StorageKind::Hdd,
            StorageMode::Ssd => StorageKind::Ssd,
        };
        let mut profile = TuningProfile::for_kind(kind);

        if let Some(v) = self.max_concurrent_large {
            profile.max_concurrent_large = v;
        }
        if let Some(v) = self.max_concurrent_small {
            profile.max_concurrent_small = v;
        }
        if let Some(v) = self.large_threshold_bytes {
            profile.large_threshold = v;
        }
        if let Some(v) = self.disk_buffer_bytes {
            profile.disk_buffer_bytes = v;
        }
        if let Some(v) = self.write_batch_bytes {
            profile.write_batch_bytes = v;
        }
        if let Some(v) = self.flush_interval_seconds {
            profile.flush_interval = Duration::from_secs(v);
        }
        if let Some(v) = self.max_connections_per_job {
            profile.max_connections_per_job = v;
        }
        if let Some(v) = self.file_allocate {
            profile.preallocate = v;
        }

        profile
    }

    /// Path of the job store database inside `state_path`.
    pub fn store_path(&self) -> PathBuf {
        self.state_path.join("jobs.db")
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.debrid_api_key.is_empty() {
            return Err(BrokerError::invalid_input(
                "DEBRID_API_KEY",
                "must not be empty",
            ));
        }

        if !self.download_path.is_absolute() {
            return Err(BrokerError::invalid_input(
                "DOWNLOAD_PATH",
                format!("must be absolute: {:?}", self.download_path),
            ));
        }

        if let Some(0) = self.max_concurrent_small {
            return Err(BrokerError::invalid_input(
                "MAX_CONCURRENT_SMALL",
                "must be at least 1",
            ));
        }

        if let Some(0) = self.max_connections_per_job {
            return Err(BrokerError::invalid_input(
                "MAX_CONNECTIONS_PER_JOB",
                "must be at least 1",
            ));
        }

        if let Some(buf) = self.disk_buffer_bytes {
            if buf < 1024 * 1024 {
                return Err(BrokerError::invalid_input(
                    "DISK_BUFFER_BYTES",
                    "must be at least 1 MiB",
                ));
            }
        }

        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &'static str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(v) => v
            .parse()
            .map(Some)
            .map_err(|e| BrokerError::invalid_input(key, format!("{}", e))),
        Err(_) => Ok(None),
    }
}

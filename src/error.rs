//! Typed error hierarchy for debrid-broker
//!
//! Every error carries enough context to decide between the two recovery
//! paths: retry under backoff (transient) or surface as the job's terminal
//! `error` state (fatal).

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the broker
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Malformed magnet, missing hash, unusable upload body
    #[error("Invalid input for '{field}': {message}")]
    InputInvalid {
        field: &'static str,
        message: String,
    },

    /// Debrid service unreachable or shedding load (5xx, 429, network)
    #[error("Debrid service unavailable: {0}")]
    DebridUnavailable(String),

    /// Debrid service rejected the request (auth, quota, other 4xx)
    #[error("Debrid service rejected request: {0}")]
    DebridReject(String),

    /// Debrid service reported an explicit processing failure
    #[error("Debrid processing failed: {0}")]
    DebridProcessingFailed(String),

    /// Direct URL no longer valid; must be re-unlocked
    #[error("Direct URL expired")]
    UrlExpired,

    /// Recoverable network failure on the download path
    #[error("Network error: {message}")]
    NetworkTransient {
        kind: NetworkErrorKind,
        message: String,
    },

    /// Destination device out of space (recoverable once space frees)
    #[error("Disk full at {path:?}")]
    DiskFull { path: PathBuf },

    /// Unrecoverable storage failure (permissions, bad path, I/O)
    #[error("Storage error at {path:?}: {message}")]
    DiskPermanent { path: PathBuf, message: String },

    /// Written bytes or file length disagree with the expected total
    #[error("Size mismatch: expected {expected} bytes, observed {observed}")]
    SizeMismatch { expected: u64, observed: u64 },

    /// Worker stopped by pause, delete, or shutdown
    #[error("Cancelled")]
    Cancelled,

    /// Job not found
    #[error("Job not found: {0}")]
    NotFound(String),

    /// Persistence layer failure
    #[error("Store error: {0}")]
    Store(String),

    /// Internal error (bug)
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Network error subtypes on the transient path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    /// Connection reset by peer
    ConnectionReset,
    /// Connect or read timeout
    Timeout,
    /// Server returned a retryable status (5xx, 408, 429)
    HttpStatus(u16),
    /// Body ended before Content-Length was satisfied
    ShortRead,
    /// Other transport failure
    Other,
}

impl BrokerError {
    /// Whether the backoff-and-retry path applies.
    ///
    /// Transient: connection reset, read timeout, 5xx, 408/429, short reads,
    /// expired URLs, debrid unavailability, disk full, size mismatch.
    /// Everything else is terminal.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NetworkTransient { .. }
                | Self::UrlExpired
                | Self::DebridUnavailable(_)
                | Self::DiskFull { .. }
                | Self::SizeMismatch { .. }
        )
    }

    /// Classify an HTTP status on the download or gateway path.
    pub fn from_status(status: u16, context: &str) -> Self {
        match status {
            408 | 429 | 500..=599 => Self::NetworkTransient {
                kind: NetworkErrorKind::HttpStatus(status),
                message: format!("{}: HTTP {}", context, status),
            },
            410 => Self::UrlExpired,
            _ => Self::DebridReject(format!("{}: HTTP {}", context, status)),
        }
    }

    pub fn network(kind: NetworkErrorKind, message: impl Into<String>) -> Self {
        Self::NetworkTransient {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_input(field: &'static str, message: impl Into<String>) -> Self {
        Self::InputInvalid {
            field,
            message: message.into(),
        }
    }

    /// Classify a filesystem error against a destination path.
    pub fn from_io(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if err.raw_os_error() == Some(libc_enospc()) {
            return Self::DiskFull { path };
        }
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::Interrupted => Self::network(
                NetworkErrorKind::Timeout,
                format!("I/O timeout at {:?}: {}", path, err),
            ),
            _ => Self::DiskPermanent {
                path,
                message: err.to_string(),
            },
        }
    }
}

// ENOSPC without pulling in libc just for one constant.
const fn libc_enospc() -> i32 {
    28
}

/// Result type alias for broker operations
pub type Result<T> = std::result::Result<T, BrokerError>;

impl From<reqwest::Error> for BrokerError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::network(NetworkErrorKind::Timeout, err.to_string())
        } else if err.is_connect() {
            Self::network(NetworkErrorKind::ConnectionReset, err.to_string())
        } else if let Some(status) = err.status() {
            Self::from_status(status.as_u16(), "request")
        } else {
            Self::network(NetworkErrorKind::Other, err.to_string())
        }
    }
}

impl From<url::ParseError> for BrokerError {
    fn from(err: url::ParseError) -> Self {
        Self::invalid_input("url", err.to_string())
    }
}

impl From<rusqlite::Error> for BrokerError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Store(err.to_string())
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Store(format!("JSON error: {}", err))
    }
}

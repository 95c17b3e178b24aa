//! Debrid gateway
//!
//! Client of the external unrestricting service. Three logical operations:
//! submit a magnet, poll its processing status, and unlock a hosted link
//! into a short-lived direct download URL.
//!
//! All calls share one token-bucket rate limiter (burst 8, sustained 4
//! requests per second) and retry 5xx/429 responses under the same backoff
//! policy the download path uses.

use crate::error::{BrokerError, Result};
use crate::retry::BackoffPolicy;
use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::Deserialize;
use std::num::NonZeroU32;
use std::time::Duration;

/// Poll every 2 s for the first 30 s after submission.
pub const POLL_FAST: Duration = Duration::from_secs(2);
/// Then every 5 s.
pub const POLL_SLOW: Duration = Duration::from_secs(5);
/// Fast-poll window after submission.
pub const POLL_FAST_WINDOW: Duration = Duration::from_secs(30);
/// Give up on a magnet the service has not readied within this bound.
pub const PROCESSING_CAP: Duration = Duration::from_secs(300);

/// Direct URL lifetime assumed when the service does not report one.
const DEFAULT_URL_TTL: Duration = Duration::from_secs(3600);

/// Poll interval as a function of time since submission.
pub fn poll_interval(elapsed: Duration) -> Duration {
    if elapsed < POLL_FAST_WINDOW {
        POLL_FAST
    } else {
        POLL_SLOW
    }
}

/// One file of a processed magnet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebridFile {
    pub name: String,
    pub size: u64,
    pub hosted_url: String,
}

/// Processing status of a submitted magnet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebridStatus {
    /// Still joining the swarm or fetching
    Processing,
    /// All files cached and ready to unlock
    Ready { files: Vec<DebridFile> },
    /// The service gave up on the magnet
    Error { reason: String },
}

/// An unlocked direct URL and its assumed lifetime.
#[derive(Debug, Clone)]
pub struct Unlocked {
    pub direct_url: String,
    pub ttl: Duration,
    /// File size reported alongside the unlock, when the status endpoint
    /// did not carry one.
    pub size_hint: Option<u64>,
}

/// Capability set of the unrestricting service.
///
/// Selected at startup: the real REST client in production, a scripted
/// in-memory variant in tests.
#[async_trait]
pub trait DebridGateway: Send + Sync {
    /// Post a magnet; returns the service's opaque identifier.
    async fn submit(&self, magnet: &str) -> Result<u64>;

    /// Poll the processing status of a submitted magnet.
    async fn status(&self, debrid_id: u64) -> Result<DebridStatus>;

    /// Convert a hosted URL into a direct downloadable URL.
    async fn unlock(&self, hosted_url: &str) -> Result<Unlocked>;

    /// Drop the magnet on the service side. Best-effort cleanup on delete.
    async fn forget(&self, debrid_id: u64) -> Result<()>;
}

// ---------------------------------------------------------------------------
// AllDebrid v4 REST client
// ---------------------------------------------------------------------------

/// Client for the AllDebrid v4 API.
pub struct AllDebridClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    limiter: DefaultDirectRateLimiter,
    backoff: BackoffPolicy,
}

/// Status codes the service reports: 4 is ready, these are terminal failures.
const STATUS_READY: i64 = 4;
const STATUS_FAILED: [i64; 5] = [5, 6, 7, 8, 11];

impl AllDebridClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| BrokerError::Internal(format!("failed to build HTTP client: {}", e)))?;

        let quota = Quota::per_second(NonZeroU32::new(4).expect("nonzero"))
            .allow_burst(NonZeroU32::new(8).expect("nonzero"));

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            limiter: RateLimiter::direct(quota),
            backoff: BackoffPolicy::default(),
        })
    }

    /// Issue one API call: rate-limited, retried on 5xx/429.
    async fn request(
        &self,
        method: reqwest::Method,
        endpoint: &str,
        query: &[(&str, String)],
        form: Option<&[(&str, String)]>,
    ) -> Result<serde_json::Value> {
        let url = format!("{}/{}", self.base_url, endpoint);
        let mut last_err = None;

        for attempt in 0..3u32 {
            self.limiter.until_ready().await;

            let mut req = self
                .client
                .request(method.clone(), &url)
                .query(&[("agent", "debrid-broker"), ("apikey", self.api_key.as_str())])
                .query(query);
            if let Some(form) = form {
                req = req.form(form);
            }

            let outcome = match req.send().await {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if status == 429 || (500..=599).contains(&status) {
                        Err(BrokerError::DebridUnavailable(format!(
                            "{}: HTTP {}",
                            endpoint, status
                        )))
                    } else if status >= 400 {
                        return Err(BrokerError::DebridReject(format!(
                            "{}: HTTP {}",
                            endpoint, status
                        )));
                    } else {
                        resp.json::<serde_json::Value>()
                            .await
                            .map_err(BrokerError::from)
                    }
                }
                Err(e) => Err(BrokerError::DebridUnavailable(e.to_string())),
            };

            match outcome {
                Ok(body) => return self.unwrap_envelope(body, endpoint),
                Err(e) if e.is_transient() || matches!(e, BrokerError::DebridUnavailable(_)) => {
                    tracing::debug!(endpoint, attempt, error = %e, "debrid call failed, retrying");
                    tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err
            .unwrap_or_else(|| BrokerError::DebridUnavailable("retries exhausted".to_string())))
    }

    /// All v4 responses wrap the payload: `{status: "success", data: {...}}`
    /// or `{status: "error", error: {code, message}}`.
    fn unwrap_envelope(&self, body: serde_json::Value, endpoint: &str) -> Result<serde_json::Value> {
        if body.get("status").and_then(|s| s.as_str()) == Some("error") {
            let message = body
                .pointer("/error/message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error")
                .to_string();
            let code = body
                .pointer("/error/code")
                .and_then(|c| c.as_str())
                .unwrap_or("");
            tracing::warn!(endpoint, code, message, "debrid API error");
            return Err(BrokerError::DebridReject(message));
        }
        Ok(body.get("data").cloned().unwrap_or(body))
    }
}

/// `magnets` entry of the upload response.
#[derive(Debug, Deserialize)]
struct UploadedMagnet {
    id: u64,
    #[serde(default)]
    error: Option<WireError>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    #[serde(default)]
    message: String,
}

/// `magnets` object of the status response.
#[derive(Debug, Deserialize)]
struct MagnetStatus {
    #[serde(default)]
    status: String,
    #[serde(rename = "statusCode")]
    status_code: i64,
    #[serde(default)]
    links: Vec<WireLink>,
    #[serde(default)]
    files: Option<Vec<WireFile>>,
}

/// The service has shipped links both as bare URL strings and as
/// `{link, filename, size}` objects; accept either.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireLink {
    Plain(String),
    Entry {
        link: String,
        #[serde(default)]
        filename: Option<String>,
        #[serde(default)]
        size: Option<u64>,
    },
}

/// `{n, s}` file node paired with links by index.
#[derive(Debug, Deserialize)]
struct WireFile {
    n: String,
    #[serde(default)]
    s: u64,
}

#[derive(Debug, Deserialize)]
struct UnlockBody {
    link: String,
    #[serde(default)]
    filesize: u64,
    #[serde(default)]
    ttl: Option<u64>,
}

fn files_from_status(status: MagnetStatus) -> Result<Vec<DebridFile>> {
    let fallback = status.files.unwrap_or_default();
    let mut files = Vec::with_capacity(status.links.len());

    for (idx, link) in status.links.into_iter().enumerate() {
        let file = match link {
            WireLink::Entry {
                link,
                filename,
                size,
            } => DebridFile {
                name: filename
                    .or_else(|| fallback.get(idx).map(|f| f.n.clone()))
                    .unwrap_or_else(|| format!("file-{}", idx)),
                size: size.or_else(|| fallback.get(idx).map(|f| f.s)).unwrap_or(0),
                hosted_url: link,
            },
            WireLink::Plain(link) => DebridFile {
                name: fallback
                    .get(idx)
                    .map(|f| f.n.clone())
                    .unwrap_or_else(|| format!("file-{}", idx)),
                size: fallback.get(idx).map(|f| f.s).unwrap_or(0),
                hosted_url: link,
            },
        };
        files.push(file);
    }

    if files.is_empty() {
        return Err(BrokerError::DebridProcessingFailed(
            "no download links available".to_string(),
        ));
    }
    Ok(files)
}

#[async_trait]
impl DebridGateway for AllDebridClient {
    async fn submit(&self, magnet: &str) -> Result<u64> {
        let data = self
            .request(
                reqwest::Method::POST,
                "magnet/upload",
                &[],
                Some(&[("magnets[]", magnet.to_string())]),
            )
            .await?;

        let magnets: Vec<UploadedMagnet> =
            serde_json::from_value(data.get("magnets").cloned().unwrap_or_default())?;
        let magnet = magnets.into_iter().next().ok_or_else(|| {
            BrokerError::DebridReject("no magnet returned from upload".to_string())
        })?;

        if let Some(err) = magnet.error {
            return Err(BrokerError::DebridReject(err.message));
        }
        Ok(magnet.id)
    }

    async fn status(&self, debrid_id: u64) -> Result<DebridStatus> {
        let data = self
            .request(
                reqwest::Method::GET,
                "magnet/status",
                &[("id", debrid_id.to_string())],
                None,
            )
            .await?;

        let status: MagnetStatus =
            serde_json::from_value(data.get("magnets").cloned().unwrap_or_default())?;

        if STATUS_FAILED.contains(&status.status_code) {
            let reason = if status.status.is_empty() {
                format!("status code {}", status.status_code)
            } else {
                status.status
            };
            return Ok(DebridStatus::Error { reason });
        }
        if status.status_code != STATUS_READY {
            return Ok(DebridStatus::Processing);
        }

        Ok(DebridStatus::Ready {
            files: files_from_status(status)?,
        })
    }

    async fn unlock(&self, hosted_url: &str) -> Result<Unlocked> {
        let data = self
            .request(
                reqwest::Method::GET,
                "link/unlock",
                &[("link", hosted_url.to_string())],
                None,
            )
            .await?;

        let body: UnlockBody = serde_json::from_value(data)?;
        Ok(Unlocked {
            direct_url: body.link,
            ttl: body.ttl.map(Duration::from_secs).unwrap_or(DEFAULT_URL_TTL),
            size_hint: (body.filesize > 0).then_some(body.filesize),
        })
    }

    async fn forget(&self, debrid_id: u64) -> Result<()> {
        self.request(
            reqwest::Method::GET,
            "magnet/delete",
            &[("id", debrid_id.to_string())],
            None,
        )
        .await
        .map(|_| ())
    }
}

// ---------------------------------------------------------------------------
// Scripted in-memory gateway for tests
// ---------------------------------------------------------------------------

/// In-memory gateway for deterministic tests. Each submitted magnet is
/// assigned the next id; statuses and unlock results are scripted up front.
#[derive(Default)]
pub struct MockGateway {
    inner: parking_lot::Mutex<MockInner>,
}

#[derive(Default)]
struct MockInner {
    next_id: u64,
    submitted: Vec<String>,
    /// Status returned for every magnet until overridden
    status: Option<DebridStatus>,
    /// Unlock result keyed by hosted URL; `None` means UrlExpired
    unlocks: std::collections::HashMap<String, Option<Unlocked>>,
    forgotten: Vec<u64>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&self, status: DebridStatus) {
        self.inner.lock().status = Some(status);
    }

    pub fn set_unlock(&self, hosted_url: &str, unlocked: Option<Unlocked>) {
        self.inner
            .lock()
            .unlocks
            .insert(hosted_url.to_string(), unlocked);
    }

    pub fn submitted(&self) -> Vec<String> {
        self.inner.lock().submitted.clone()
    }

    pub fn forgotten(&self) -> Vec<u64> {
        self.inner.lock().forgotten.clone()
    }
}

#[async_trait]
impl DebridGateway for MockGateway {
    async fn submit(&self, magnet: &str) -> Result<u64> {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        inner.submitted.push(magnet.to_string());
        Ok(inner.next_id)
    }

    async fn status(&self, _debrid_id: u64) -> Result<DebridStatus> {
        Ok(self
            .inner
            .lock()
            .status
            .clone()
            .unwrap_or(DebridStatus::Processing))
    }

    async fn unlock(&self, hosted_url: &str) -> Result<Unlocked> {
        match self.inner.lock().unlocks.get(hosted_url) {
            Some(Some(unlocked)) => Ok(unlocked.clone()),
            Some(None) => Err(BrokerError::UrlExpired),
            None => Err(BrokerError::DebridReject(format!(
                "unknown hosted url: {}",
                hosted_url
            ))),
        }
    }

    async fn forget(&self, debrid_id: u64) -> Result<()> {
        self.inner.lock().forgotten.push(debrid_id);
        Ok(())
    }
}

//! qBittorrent-compatible HTTP surface
//!
//! Thin adapter over the job manager, shaped so Sonarr/Radarr can treat the
//! broker as a qBittorrent 4.5 instance. Authentication accepts anything,
//! uploads are translated into jobs, and the torrent views are synthesized
//! from job records.
//!
//! Error collapse: operational failures surface through the job's `state`
//! field, not HTTP status codes. The exceptions are 404 for an unknown hash
//! on `properties`/`files`, 400 for unparsable magnets on `add`, and 415 for
//! unrecognized upload bodies.

use crate::error::BrokerError;
use crate::manager::JobManager;
use crate::types::{InfoHash, Job, JobState};
use axum::extract::{Multipart, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::{Form, RequestExt, Router};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

/// Version strings reported to callers.
const APP_VERSION: &str = "v4.5.0";
const WEBAPI_VERSION: &str = "2.8.0";

/// ETA sentinel qBittorrent uses for "unknown".
const ETA_INFINITE: u64 = 8_640_000;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<JobManager>,
    pub max_active_downloads: usize,
}

/// Build the full router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v2/auth/login", post(auth_login))
        .route("/api/v2/app/version", get(app_version))
        .route("/api/v2/app/webapiVersion", get(webapi_version))
        .route("/api/v2/app/preferences", get(app_preferences))
        .route("/api/v2/torrents/add", post(torrents_add))
        .route("/api/v2/torrents/info", get(torrents_info))
        .route("/api/v2/torrents/delete", post(torrents_delete))
        .route("/api/v2/torrents/pause", post(torrents_pause))
        .route("/api/v2/torrents/resume", post(torrents_resume))
        .route("/api/v2/torrents/recheck", post(torrents_recheck))
        .route("/api/v2/torrents/properties", get(torrent_properties))
        .route("/api/v2/torrents/files", get(torrent_files))
        .route("/api/v2/torrents/trackers", get(torrent_trackers))
        .route("/api/v2/torrents/categories", get(torrent_categories))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Bind and serve until the shutdown token fires.
pub async fn serve(
    state: AppState,
    addr: SocketAddr,
    shutdown: tokio_util::sync::CancellationToken,
) -> crate::error::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| BrokerError::Internal(format!("failed to bind {}: {}", addr, e)))?;

    tracing::info!(%addr, "API listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| BrokerError::Internal(format!("server error: {}", e)))
}

// -- Views ------------------------------------------------------------------

/// One entry of `/api/v2/torrents/info`.
#[derive(Debug, Serialize)]
struct TorrentView {
    hash: String,
    name: String,
    size: u64,
    progress: f64,
    dlspeed: u64,
    upspeed: u64,
    eta: u64,
    state: &'static str,
    category: String,
    save_path: String,
    added_on: i64,
    completion_on: i64,
    completed: u64,
    downloaded: u64,
    uploaded: u64,
    ratio: f64,
}

impl TorrentView {
    fn from_job(job: &Job) -> Self {
        let eta = match job.state {
            JobState::Completed => 0,
            _ => job.eta_seconds().unwrap_or(ETA_INFINITE),
        };
        Self {
            hash: job.info_hash.as_str().to_string(),
            name: job.display_name.clone(),
            size: job.size_total,
            progress: job.progress(),
            dlspeed: job.speed_bps,
            upspeed: 0,
            eta,
            state: job.state.to_qbit_state(),
            category: job.category.clone(),
            save_path: job.save_path.to_string_lossy().to_string(),
            added_on: job.added_at.timestamp(),
            completion_on: job.completed_at.map(|t| t.timestamp()).unwrap_or(0),
            completed: job.size_done,
            downloaded: job.size_done,
            uploaded: 0,
            ratio: 0.0,
        }
    }
}

// -- Auth / app -------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct LoginForm {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

/// Accepts any credentials; the cookie is decoration for strict clients.
async fn auth_login(_form: Option<Form<LoginForm>>) -> Response {
    (
        [(header::SET_COOKIE, "SID=debrid-broker; path=/")],
        "Ok.",
    )
        .into_response()
}

async fn app_version() -> &'static str {
    APP_VERSION
}

async fn webapi_version() -> &'static str {
    WEBAPI_VERSION
}

async fn app_preferences(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "save_path": state.manager.download_root().to_string_lossy(),
        "max_active_downloads": state.max_active_downloads,
    }))
}

// -- Torrent operations -----------------------------------------------------

#[derive(Debug, Deserialize, Default)]
struct AddForm {
    #[serde(default)]
    urls: String,
    #[serde(default)]
    category: String,
    #[serde(default)]
    savepath: String,
}

/// `torrents/add` accepts either a urlencoded form with newline-separated
/// magnets or a multipart upload of .torrent files.
async fn torrents_add(State(state): State<AppState>, request: axum::extract::Request) -> Response {
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    if content_type.starts_with("multipart/form-data") {
        let multipart = match request.extract::<Multipart, _>().await {
            Ok(m) => m,
            Err(_) => return StatusCode::UNSUPPORTED_MEDIA_TYPE.into_response(),
        };
        return add_from_multipart(state, multipart).await;
    }

    if content_type.starts_with("application/x-www-form-urlencoded") {
        let Form(form) = match request.extract::<Form<AddForm>, _>().await {
            Ok(f) => f,
            Err(_) => return StatusCode::BAD_REQUEST.into_response(),
        };
        return add_from_form(state, form).await;
    }

    StatusCode::UNSUPPORTED_MEDIA_TYPE.into_response()
}

async fn add_from_form(state: AppState, form: AddForm) -> Response {
    let save_path = (!form.savepath.is_empty()).then(|| form.savepath.clone().into());
    let magnets: Vec<&str> = form
        .urls
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();

    if magnets.is_empty() {
        return (StatusCode::BAD_REQUEST, "no magnet URIs supplied").into_response();
    }

    for magnet in magnets {
        match state
            .manager
            .add_magnet(magnet, &form.category, save_path.clone())
            .await
        {
            Ok(job) => {
                tracing::info!(hash = %job.info_hash, category = %job.category, "torrent added");
            }
            Err(BrokerError::InputInvalid { message, .. }) => {
                return (StatusCode::BAD_REQUEST, message).into_response();
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to add magnet");
                return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
            }
        }
    }

    "Ok.".into_response()
}

async fn add_from_multipart(state: AppState, mut multipart: Multipart) -> Response {
    let mut torrents: Vec<Vec<u8>> = Vec::new();
    let mut category = String::new();
    let mut savepath = String::new();

    while let Ok(Some(field)) = multipart.next_field().await {
        match field.name().unwrap_or("") {
            "torrents" => match field.bytes().await {
                Ok(bytes) => torrents.push(bytes.to_vec()),
                Err(_) => return StatusCode::UNSUPPORTED_MEDIA_TYPE.into_response(),
            },
            "category" => category = field.text().await.unwrap_or_default(),
            "savepath" => savepath = field.text().await.unwrap_or_default(),
            _ => {}
        }
    }

    if torrents.is_empty() {
        return StatusCode::UNSUPPORTED_MEDIA_TYPE.into_response();
    }

    let save_path = (!savepath.is_empty()).then(|| savepath.clone().into());
    for torrent in &torrents {
        match state
            .manager
            .add_torrent_bytes(torrent, &category, save_path.clone())
            .await
        {
            Ok(job) => {
                tracing::info!(hash = %job.info_hash, "torrent file added");
            }
            Err(BrokerError::InputInvalid { .. }) => {
                return StatusCode::UNSUPPORTED_MEDIA_TYPE.into_response();
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to add torrent file");
                return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
            }
        }
    }

    "Ok.".into_response()
}

#[derive(Debug, Deserialize, Default)]
struct InfoQuery {
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    hashes: Option<String>,
    #[serde(default)]
    filter: Option<String>,
}

async fn torrents_info(
    State(state): State<AppState>,
    Query(query): Query<InfoQuery>,
) -> Json<Vec<TorrentView>> {
    let mut jobs = state.manager.list();

    if let Some(hashes) = &query.hashes {
        let wanted: Vec<&str> = hashes.split('|').collect();
        jobs.retain(|j| wanted.contains(&j.info_hash.as_str()));
    }
    if let Some(category) = &query.category {
        jobs.retain(|j| &j.category == category);
    }
    if let Some(filter) = query.filter.as_deref() {
        jobs.retain(|j| filter_matches(filter, &j.state));
    }

    jobs.sort_by_key(|j| j.added_at);
    Json(jobs.iter().map(TorrentView::from_job).collect())
}

/// qBittorrent list filters, reduced to the states this broker has.
fn filter_matches(filter: &str, state: &JobState) -> bool {
    match filter {
        "downloading" | "active" => matches!(
            state,
            JobState::Queued | JobState::DebridPending | JobState::DebridReady | JobState::Downloading
        ),
        "completed" => matches!(state, JobState::Completed),
        "paused" => matches!(state, JobState::Paused),
        "stalled" => matches!(state, JobState::DebridReady),
        "errored" => matches!(state, JobState::Error),
        _ => true,
    }
}

#[derive(Debug, Deserialize)]
struct DeleteForm {
    hashes: String,
    #[serde(default, rename = "deleteFiles")]
    delete_files: String,
}

async fn torrents_delete(
    State(state): State<AppState>,
    Form(form): Form<DeleteForm>,
) -> Response {
    let also_files = matches!(form.delete_files.as_str(), "true" | "True" | "1");

    for hash in parse_hashes(&form.hashes) {
        if let Err(e) = state.manager.delete(&hash, also_files).await {
            tracing::warn!(%hash, error = %e, "delete failed");
        }
    }
    "Ok.".into_response()
}

#[derive(Debug, Deserialize)]
struct HashesForm {
    hashes: String,
}

async fn torrents_pause(
    State(state): State<AppState>,
    Form(form): Form<HashesForm>,
) -> Response {
    for hash in parse_hashes(&form.hashes) {
        if let Err(e) = state.manager.pause(&hash).await {
            tracing::debug!(%hash, error = %e, "pause skipped");
        }
    }
    "Ok.".into_response()
}

async fn torrents_resume(
    State(state): State<AppState>,
    Form(form): Form<HashesForm>,
) -> Response {
    for hash in parse_hashes(&form.hashes) {
        if let Err(e) = state.manager.resume(&hash).await {
            tracing::debug!(%hash, error = %e, "resume skipped");
        }
    }
    "Ok.".into_response()
}

async fn torrents_recheck() -> &'static str {
    // No piece hashes to verify; integrity comes from the transport.
    "Ok."
}

fn parse_hashes(raw: &str) -> Vec<InfoHash> {
    raw.split('|').filter_map(InfoHash::parse).collect()
}

#[derive(Debug, Deserialize)]
struct HashQuery {
    hash: String,
}

async fn torrent_properties(
    State(state): State<AppState>,
    Query(query): Query<HashQuery>,
) -> Response {
    let job = match InfoHash::parse(&query.hash).and_then(|h| state.manager.get(&h)) {
        Some(job) => job,
        None => return StatusCode::NOT_FOUND.into_response(),
    };

    let elapsed = (chrono::Utc::now() - job.added_at).num_seconds().max(0);
    Json(serde_json::json!({
        "save_path": job.save_path.to_string_lossy(),
        "creation_date": job.added_at.timestamp(),
        "addition_date": job.added_at.timestamp(),
        "completion_date": job.completed_at.map(|t| t.timestamp()).unwrap_or(-1),
        "total_size": job.size_total,
        "total_downloaded": job.size_done,
        "total_uploaded": 0,
        "total_wasted": 0,
        "dl_speed": job.speed_bps,
        "up_speed": 0,
        "dl_limit": -1,
        "up_limit": -1,
        "eta": job.eta_seconds().unwrap_or(ETA_INFINITE),
        "time_elapsed": elapsed,
        "seeding_time": 0,
        "nb_connections": 0,
        "share_ratio": 0.0,
        "piece_size": 0,
        "comment": "",
        "last_error": job.last_error.unwrap_or_default(),
    }))
    .into_response()
}

async fn torrent_files(
    State(state): State<AppState>,
    Query(query): Query<HashQuery>,
) -> Response {
    let job = match InfoHash::parse(&query.hash).and_then(|h| state.manager.get(&h)) {
        Some(job) => job,
        None => return StatusCode::NOT_FOUND.into_response(),
    };

    let files: Vec<serde_json::Value> = if job.files.is_empty() {
        // Nothing reported yet: expose the job itself as one pending file.
        vec![serde_json::json!({
            "index": 0,
            "name": job.display_name,
            "size": job.size_total,
            "progress": job.progress(),
            "priority": 1,
            "is_seed": false,
        })]
    } else {
        job.files
            .iter()
            .enumerate()
            .map(|(index, f)| {
                let progress = if f.size == 0 {
                    0.0
                } else {
                    (f.done as f64 / f.size as f64).min(1.0)
                };
                serde_json::json!({
                    "index": index,
                    "name": f.name,
                    "size": f.size,
                    "progress": progress,
                    "priority": 1,
                    "is_seed": job.state == JobState::Completed,
                })
            })
            .collect()
    };

    Json(files).into_response()
}

async fn torrent_trackers() -> Json<Vec<serde_json::Value>> {
    // The debrid service joins the swarm; there are no trackers to show.
    Json(Vec::new())
}

async fn torrent_categories(State(state): State<AppState>) -> Json<serde_json::Value> {
    let root = state.manager.download_root().to_string_lossy().to_string();
    let mut categories: BTreeMap<String, serde_json::Value> = BTreeMap::new();
    for job in state.manager.list() {
        if job.category.is_empty() {
            continue;
        }
        categories
            .entry(job.category.clone())
            .or_insert_with(|| {
                serde_json::json!({
                    "name": job.category,
                    "savePath": format!("{}/{}", root, job.category),
                })
            });
    }
    Json(serde_json::to_value(categories).unwrap_or_default())
}

// -- Health / metrics -------------------------------------------------------

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn metrics(State(state): State<AppState>) -> Json<serde_json::Value> {
    let jobs = state.manager.list();
    let count = |s: JobState| jobs.iter().filter(|j| j.state == s).count();
    let dlspeed: u64 = jobs.iter().map(|j| j.speed_bps).sum();
    let snapshot = state.manager.metrics().snapshot();
    let (large_running, small_running) = state.manager.scheduler().running_counts();

    Json(serde_json::json!({
        "storage_type": state.manager.profile().kind.to_string(),
        "download_speed_bps": dlspeed,
        "jobs_queued": count(JobState::Queued) + count(JobState::DebridPending),
        "jobs_stalled": count(JobState::DebridReady),
        "jobs_downloading": count(JobState::Downloading),
        "jobs_paused": count(JobState::Paused),
        "jobs_completed": count(JobState::Completed),
        "jobs_errored": count(JobState::Error),
        "running_large": large_running,
        "running_small": small_running,
        "counters": snapshot,
    }))
}

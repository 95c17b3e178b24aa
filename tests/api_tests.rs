//! Tests for the qBittorrent-compatible HTTP surface
//!
//! The router is served on an ephemeral port and exercised with a real HTTP
//! client, the way Sonarr/Radarr would use it. The debrid gateway is the
//! scripted mock, left in `Processing` unless a test needs more.

use debrid_broker::api::{self, AppState};
use debrid_broker::debrid::{DebridFile, DebridStatus, MockGateway, Unlocked};
use debrid_broker::manager::JobManager;
use debrid_broker::storage::MemoryStore;
use debrid_broker::types::{JobState, StorageKind, TuningProfile};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const HASH_A: &str = "0123456789abcdef0123456789abcdef01234567";
const HASH_B: &str = "89abcdef0123456789abcdef0123456789abcdef";

fn magnet(hash: &str, name: &str) -> String {
    format!("magnet:?xt=urn:btih:{}&dn={}", hash, name)
}

fn test_profile() -> TuningProfile {
    let mut profile = TuningProfile::for_kind(StorageKind::Hdd);
    profile.disk_buffer_bytes = 256 * 1024;
    profile.flush_interval = Duration::from_millis(100);
    profile.preallocate = false;
    profile
}

struct TestApi {
    base: String,
    client: reqwest::Client,
    manager: Arc<JobManager>,
    shutdown: CancellationToken,
}

impl TestApi {
    async fn start(gateway: Arc<MockGateway>, root: &Path) -> Self {
        let manager = JobManager::new(
            test_profile(),
            root.to_path_buf(),
            gateway,
            Arc::new(MemoryStore::new()),
        )
        .await
        .unwrap();

        let state = AppState {
            manager: Arc::clone(&manager),
            max_active_downloads: 4,
        };

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, api::router(state))
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
                .unwrap();
        });

        Self {
            base: format!("http://{}", addr),
            client: reqwest::Client::new(),
            manager,
            shutdown,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn add_magnet(&self, uri: &str, category: &str) -> reqwest::Response {
        self.client
            .post(self.url("/api/v2/torrents/add"))
            .form(&[("urls", uri), ("category", category)])
            .send()
            .await
            .unwrap()
    }

    async fn info(&self, query: &str) -> Vec<serde_json::Value> {
        self.client
            .get(self.url(&format!("/api/v2/torrents/info{}", query)))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.manager.shutdown().await;
    }
}

#[tokio::test]
async fn login_accepts_anything_and_sets_cookie() {
    let dir = tempfile::tempdir().unwrap();
    let api = TestApi::start(Arc::new(MockGateway::new()), dir.path()).await;

    let resp = api
        .client
        .post(api.url("/api/v2/auth/login"))
        .form(&[("username", "whatever"), ("password", "nope")])
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    assert!(resp.headers().contains_key("set-cookie"));
    assert_eq!(resp.text().await.unwrap(), "Ok.");

    api.stop().await;
}

#[tokio::test]
async fn version_and_preferences() {
    let dir = tempfile::tempdir().unwrap();
    let api = TestApi::start(Arc::new(MockGateway::new()), dir.path()).await;

    let version = api
        .client
        .get(api.url("/api/v2/app/version"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(version, "v4.5.0");

    let webapi = api
        .client
        .get(api.url("/api/v2/app/webapiVersion"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(webapi, "2.8.0");

    let prefs: serde_json::Value = api
        .client
        .get(api.url("/api/v2/app/preferences"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(
        prefs["save_path"].as_str().unwrap(),
        dir.path().to_string_lossy()
    );
    assert_eq!(prefs["max_active_downloads"], 4);

    api.stop().await;
}

#[tokio::test]
async fn add_lists_and_filters_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let api = TestApi::start(Arc::new(MockGateway::new()), dir.path()).await;

    let resp = api.add_magnet(&magnet(HASH_A, "Movie.2024"), "radarr").await;
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "Ok.");

    let resp = api.add_magnet(&magnet(HASH_B, "Show.S01E01"), "sonarr").await;
    assert_eq!(resp.status(), 200);

    let all = api.info("").await;
    assert_eq!(all.len(), 2);

    // queued/debrid_pending both render as queuedDL
    assert!(all
        .iter()
        .all(|t| t["state"] == "queuedDL" && t["upspeed"] == 0 && t["ratio"] == 0.0));

    let radarr = api.info("?category=radarr").await;
    assert_eq!(radarr.len(), 1);
    assert_eq!(radarr[0]["hash"], HASH_A);
    assert_eq!(radarr[0]["name"], "Movie.2024");

    let by_hash = api.info(&format!("?hashes={}", HASH_B)).await;
    assert_eq!(by_hash.len(), 1);
    assert_eq!(by_hash[0]["category"], "sonarr");

    let completed = api.info("?filter=completed").await;
    assert!(completed.is_empty());

    api.stop().await;
}

#[tokio::test]
async fn adding_same_magnet_twice_yields_one_job() {
    let dir = tempfile::tempdir().unwrap();
    let api = TestApi::start(Arc::new(MockGateway::new()), dir.path()).await;

    api.add_magnet(&magnet(HASH_A, "one"), "radarr").await;
    api.add_magnet(&magnet(HASH_A, "two"), "radarr").await;

    assert_eq!(api.info("").await.len(), 1);
    api.stop().await;
}

#[tokio::test]
async fn bad_magnet_is_a_400_and_missing_body_a_415() {
    let dir = tempfile::tempdir().unwrap();
    let api = TestApi::start(Arc::new(MockGateway::new()), dir.path()).await;

    let resp = api.add_magnet("not-a-magnet", "radarr").await;
    assert_eq!(resp.status(), 400);

    let resp = api
        .client
        .post(api.url("/api/v2/torrents/add"))
        .header("content-type", "application/octet-stream")
        .body("junk")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 415);

    api.stop().await;
}

#[tokio::test]
async fn torrent_file_upload_extracts_info_hash() {
    let dir = tempfile::tempdir().unwrap();
    let api = TestApi::start(Arc::new(MockGateway::new()), dir.path()).await;

    // Minimal metainfo: the info dict is what gets hashed.
    let torrent = b"d8:announce3:url4:infod4:name8:demo.mkv6:lengthi42eee".to_vec();

    let form = reqwest::multipart::Form::new()
        .part(
            "torrents",
            reqwest::multipart::Part::bytes(torrent).file_name("demo.torrent"),
        )
        .text("category", "radarr");

    let resp = api
        .client
        .post(api.url("/api/v2/torrents/add"))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let jobs = api.info("").await;
    assert_eq!(jobs.len(), 1);
    let hash = jobs[0]["hash"].as_str().unwrap();
    assert_eq!(hash.len(), 40);
    assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));

    // Garbage upload body is rejected as unrecognized.
    let form = reqwest::multipart::Form::new().part(
        "torrents",
        reqwest::multipart::Part::bytes(b"not bencode".to_vec()).file_name("x.torrent"),
    );
    let resp = api
        .client
        .post(api.url("/api/v2/torrents/add"))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 415);

    api.stop().await;
}

#[tokio::test]
async fn pause_resume_delete_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let api = TestApi::start(Arc::new(MockGateway::new()), dir.path()).await;

    api.add_magnet(&magnet(HASH_A, "x"), "radarr").await;

    // Pause: state renders as pausedDL.
    let resp = api
        .client
        .post(api.url("/api/v2/torrents/pause"))
        .form(&[("hashes", HASH_A)])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let jobs = api.info("").await;
        if jobs[0]["state"] == "pausedDL" {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "never paused: {:?}", jobs);
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    // Pausing again changes nothing.
    api.client
        .post(api.url("/api/v2/torrents/pause"))
        .form(&[("hashes", HASH_A)])
        .send()
        .await
        .unwrap();
    assert_eq!(api.info("").await[0]["state"], "pausedDL");

    // Resume re-enters the queue.
    api.client
        .post(api.url("/api/v2/torrents/resume"))
        .form(&[("hashes", HASH_A)])
        .send()
        .await
        .unwrap();
    let state = api.info("").await[0]["state"].clone();
    assert!(state == "queuedDL" || state == "stalledDL");

    // Delete removes the job.
    api.client
        .post(api.url("/api/v2/torrents/delete"))
        .form(&[("hashes", HASH_A), ("deleteFiles", "true")])
        .send()
        .await
        .unwrap();
    assert!(api.info("").await.is_empty());

    // Deleting again is harmless.
    let resp = api
        .client
        .post(api.url("/api/v2/torrents/delete"))
        .form(&[("hashes", HASH_A), ("deleteFiles", "true")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    api.stop().await;
}

#[tokio::test]
async fn properties_files_and_trackers() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = Arc::new(MockGateway::new());
    let api = TestApi::start(Arc::clone(&gateway), dir.path()).await;

    // Unknown hash: 404 on properties and files.
    let resp = api
        .client
        .get(api.url(&format!("/api/v2/torrents/properties?hash={}", HASH_A)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let resp = api
        .client
        .get(api.url(&format!("/api/v2/torrents/files?hash={}", HASH_A)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    api.add_magnet(&magnet(HASH_A, "x"), "radarr").await;

    let props: serde_json::Value = api
        .client
        .get(api.url(&format!("/api/v2/torrents/properties?hash={}", HASH_A)))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(props["total_uploaded"], 0);
    assert_eq!(props["share_ratio"], 0.0);
    assert!(props["creation_date"].as_i64().unwrap() > 0);

    let files: Vec<serde_json::Value> = api
        .client
        .get(api.url(&format!("/api/v2/torrents/files?hash={}", HASH_A)))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0]["name"], "x");

    let trackers: Vec<serde_json::Value> = api
        .client
        .get(api.url(&format!("/api/v2/torrents/trackers?hash={}", HASH_A)))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(trackers.is_empty());

    api.stop().await;
}

#[tokio::test]
async fn health_and_metrics_shape() {
    let dir = tempfile::tempdir().unwrap();
    let api = TestApi::start(Arc::new(MockGateway::new()), dir.path()).await;

    let health: serde_json::Value = api
        .client
        .get(api.url("/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");

    api.add_magnet(&magnet(HASH_A, "x"), "radarr").await;

    let metrics: serde_json::Value = api
        .client
        .get(api.url("/metrics"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(metrics["storage_type"], "hdd");
    assert_eq!(metrics["counters"]["jobs_added"], 1);
    assert!(metrics["jobs_queued"].as_u64().unwrap() >= 1);

    api.stop().await;
}

#[tokio::test]
async fn readd_after_delete_behaves_like_first_add() {
    let dir = tempfile::tempdir().unwrap();
    let body = vec![6u8; 2_000];

    let server = wiremock::MockServer::start().await;
    wiremock::Mock::given(wiremock::matchers::method("GET"))
        .and(wiremock::matchers::path("/d/f.bin"))
        .respond_with(wiremock::ResponseTemplate::new(206).set_body_bytes(body.clone()))
        .mount(&server)
        .await;

    let gateway = Arc::new(MockGateway::new());
    gateway.set_status(DebridStatus::Ready {
        files: vec![DebridFile {
            name: "f.bin".into(),
            size: body.len() as u64,
            hosted_url: "h/f".into(),
        }],
    });
    gateway.set_unlock(
        "h/f",
        Some(Unlocked {
            direct_url: format!("{}/d/f.bin", server.uri()),
            ttl: Duration::from_secs(3600),
            size_hint: None,
        }),
    );

    let api = TestApi::start(Arc::clone(&gateway), dir.path()).await;

    api.add_magnet(&magnet(HASH_A, "f"), "radarr").await;
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    loop {
        let jobs = api.info("").await;
        if !jobs.is_empty() && jobs[0]["state"] == "completed" {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "never completed");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    api.client
        .post(api.url("/api/v2/torrents/delete"))
        .form(&[("hashes", HASH_A), ("deleteFiles", "true")])
        .send()
        .await
        .unwrap();
    assert!(!dir.path().join("radarr/f.bin").exists());
    assert!(api.info("").await.is_empty());

    // Re-add runs the whole pipeline again, exactly as the first add did.
    api.add_magnet(&magnet(HASH_A, "f"), "radarr").await;
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    loop {
        let jobs = api.info("").await;
        if !jobs.is_empty() && jobs[0]["state"] == "completed" {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "re-add never completed");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(
        std::fs::read(dir.path().join("radarr/f.bin")).unwrap(),
        body
    );

    // The second run resolved it as a fresh job.
    assert_eq!(api.manager.get(&debrid_broker::InfoHash::parse(HASH_A).unwrap()).unwrap().state, JobState::Completed);
    assert_eq!(gateway.submitted().len(), 2);

    api.stop().await;
}

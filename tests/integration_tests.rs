//! Integration tests for the job pipeline
//!
//! These drive the job manager end-to-end: a scripted debrid gateway stands
//! in for the unrestricting service, and wiremock serves the direct
//! download URLs. Scenarios cover completion, scheduling order, URL expiry
//! recovery, and restart resume.

use debrid_broker::debrid::{DebridFile, DebridStatus, MockGateway, Unlocked};
use debrid_broker::manager::JobManager;
use debrid_broker::storage::{JobStore, MemoryStore, SqliteStore};
use debrid_broker::types::{InfoHash, Job, JobFile, JobState, StorageKind, TuningProfile};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn magnet(n: u8, name: &str) -> String {
    format!("magnet:?xt=urn:btih:{:040x}&dn={}", n, name)
}

fn hash(n: u8) -> InfoHash {
    InfoHash::parse(&format!("{:040x}", n)).unwrap()
}

/// hdd-shaped profile scaled down for tests: sequential, preallocating,
/// with a small large-threshold so "large" jobs fit in a test body.
fn test_profile() -> TuningProfile {
    let mut profile = TuningProfile::for_kind(StorageKind::Hdd);
    profile.large_threshold = 10_000;
    profile.disk_buffer_bytes = 256 * 1024;
    profile.write_batch_bytes = 64 * 1024;
    profile.flush_interval = Duration::from_millis(100);
    profile
}

async fn build_manager(gateway: Arc<MockGateway>, root: &Path) -> Arc<JobManager> {
    JobManager::new(
        test_profile(),
        root.to_path_buf(),
        gateway,
        Arc::new(MemoryStore::new()),
    )
    .await
    .expect("manager should build")
}

async fn wait_for<F>(manager: &JobManager, hash: &InfoHash, timeout: Duration, predicate: F)
where
    F: Fn(&Job) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(job) = manager.get(hash) {
            if predicate(&job) {
                return;
            }
            assert!(
                Instant::now() < deadline,
                "timed out; job in state {:?} ({:?})",
                job.state,
                job.last_error
            );
        } else {
            assert!(Instant::now() < deadline, "timed out; job missing");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

fn ready_file(name: &str, size: u64, hosted: &str) -> DebridStatus {
    DebridStatus::Ready {
        files: vec![DebridFile {
            name: name.to_string(),
            size,
            hosted_url: hosted.to_string(),
        }],
    }
}

fn unlocked(url: String) -> Option<Unlocked> {
    Some(Unlocked {
        direct_url: url,
        ttl: Duration::from_secs(3600),
        size_hint: None,
    })
}

// ===========================================================================
// Completion
// ===========================================================================

#[tokio::test]
async fn small_job_runs_to_completion() {
    let dir = tempfile::tempdir().unwrap();
    let body: Vec<u8> = (0..5_000u32).map(|i| (i % 199) as u8).collect();

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/d/small.bin"))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(body.clone()))
        .mount(&server)
        .await;

    let gateway = Arc::new(MockGateway::new());
    gateway.set_status(ready_file("small.bin", body.len() as u64, "h/small"));
    gateway.set_unlock("h/small", unlocked(format!("{}/d/small.bin", server.uri())));

    let manager = build_manager(Arc::clone(&gateway), dir.path()).await;
    let job = manager
        .add_magnet(&magnet(1, "small"), "radarr", None)
        .await
        .unwrap();

    wait_for(&manager, &job.info_hash, Duration::from_secs(10), |j| {
        j.state == JobState::Completed
    })
    .await;

    let job = manager.get(&job.info_hash).unwrap();
    assert_eq!(job.size_done, body.len() as u64);
    assert_eq!(job.speed_bps, 0);
    assert!(job.completed_at.is_some());

    let on_disk = std::fs::read(dir.path().join("radarr/small.bin")).unwrap();
    assert_eq!(on_disk, body);

    manager.shutdown().await;
}

#[tokio::test]
async fn multi_file_job_sums_sizes_and_writes_all_files() {
    let dir = tempfile::tempdir().unwrap();
    let video = vec![1u8; 12_000];
    let subs = vec![2u8; 300];

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/d/video.mkv"))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(video.clone()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/d/video.srt"))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(subs.clone()))
        .mount(&server)
        .await;

    let gateway = Arc::new(MockGateway::new());
    gateway.set_status(DebridStatus::Ready {
        files: vec![
            DebridFile {
                name: "video.mkv".into(),
                size: video.len() as u64,
                hosted_url: "h/v".into(),
            },
            DebridFile {
                name: "video.srt".into(),
                size: subs.len() as u64,
                hosted_url: "h/s".into(),
            },
        ],
    });
    gateway.set_unlock("h/v", unlocked(format!("{}/d/video.mkv", server.uri())));
    gateway.set_unlock("h/s", unlocked(format!("{}/d/video.srt", server.uri())));

    let manager = build_manager(Arc::clone(&gateway), dir.path()).await;
    let job = manager
        .add_magnet(&magnet(2, "video"), "sonarr", None)
        .await
        .unwrap();

    wait_for(&manager, &job.info_hash, Duration::from_secs(10), |j| {
        j.state == JobState::Completed
    })
    .await;

    let job = manager.get(&job.info_hash).unwrap();
    assert_eq!(job.size_total, (video.len() + subs.len()) as u64);
    assert_eq!(job.size_done, job.size_total);
    assert_eq!(
        std::fs::read(dir.path().join("sonarr/video.mkv")).unwrap(),
        video
    );
    assert_eq!(
        std::fs::read(dir.path().join("sonarr/video.srt")).unwrap(),
        subs
    );

    manager.shutdown().await;
}

// ===========================================================================
// Scheduling
// ===========================================================================

#[tokio::test]
async fn second_large_job_stalls_until_first_completes() {
    let dir = tempfile::tempdir().unwrap();
    // Both bodies are above the scaled-down large threshold.
    let body_a = vec![3u8; 20_000];
    let body_b = vec![4u8; 20_000];

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/d/a.bin"))
        .respond_with(
            ResponseTemplate::new(206)
                .set_body_bytes(body_a.clone())
                .set_delay(Duration::from_millis(800)),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/d/b.bin"))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(body_b.clone()))
        .mount(&server)
        .await;

    let gateway = Arc::new(MockGateway::new());
    gateway.set_status(ready_file("a.bin", body_a.len() as u64, "h/a"));
    gateway.set_unlock("h/a", unlocked(format!("{}/d/a.bin", server.uri())));
    gateway.set_unlock("h/b", unlocked(format!("{}/d/b.bin", server.uri())));

    let manager = build_manager(Arc::clone(&gateway), dir.path()).await;

    let a = manager
        .add_magnet(&magnet(10, "a"), "a", None)
        .await
        .unwrap();
    wait_for(&manager, &a.info_hash, Duration::from_secs(10), |j| {
        j.state == JobState::Downloading
    })
    .await;

    // A holds the only large slot; switch the scripted file list before B
    // polls so B sees its own file.
    gateway.set_status(ready_file("b.bin", body_b.len() as u64, "h/b"));
    let b = manager
        .add_magnet(&magnet(11, "b"), "b", None)
        .await
        .unwrap();

    wait_for(&manager, &b.info_hash, Duration::from_secs(10), |j| {
        j.state == JobState::DebridReady
    })
    .await;

    // While A is still streaming, B must stay parked in debrid_ready.
    if let Some(a_now) = manager.get(&a.info_hash) {
        if a_now.state == JobState::Downloading {
            assert_eq!(manager.get(&b.info_hash).unwrap().state, JobState::DebridReady);
        }
    }

    wait_for(&manager, &a.info_hash, Duration::from_secs(15), |j| {
        j.state == JobState::Completed
    })
    .await;
    wait_for(&manager, &b.info_hash, Duration::from_secs(15), |j| {
        j.state == JobState::Completed
    })
    .await;

    manager.shutdown().await;
}

// ===========================================================================
// Failure recovery
// ===========================================================================

#[tokio::test]
async fn expired_url_reunlocks_and_completes() {
    let dir = tempfile::tempdir().unwrap();
    let body = vec![5u8; 4_000];

    let server = MockServer::start().await;
    // First request hits the expired URL, every later one succeeds.
    Mock::given(method("GET"))
        .and(path("/d/file.bin"))
        .respond_with(ResponseTemplate::new(410))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/d/file.bin"))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(body.clone()))
        .mount(&server)
        .await;

    let gateway = Arc::new(MockGateway::new());
    gateway.set_status(ready_file("file.bin", body.len() as u64, "h/f"));
    gateway.set_unlock("h/f", unlocked(format!("{}/d/file.bin", server.uri())));

    let manager = build_manager(Arc::clone(&gateway), dir.path()).await;
    let job = manager
        .add_magnet(&magnet(20, "f"), "", None)
        .await
        .unwrap();

    // downloading → debrid_ready (expiry) → downloading → completed
    wait_for(&manager, &job.info_hash, Duration::from_secs(20), |j| {
        j.state == JobState::Completed
    })
    .await;

    let on_disk = std::fs::read(dir.path().join("file.bin")).unwrap();
    assert_eq!(on_disk, body);

    manager.shutdown().await;
}

#[tokio::test]
async fn debrid_processing_error_is_terminal_without_retries() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = Arc::new(MockGateway::new());
    gateway.set_status(DebridStatus::Error {
        reason: "dead".into(),
    });

    let manager = build_manager(Arc::clone(&gateway), dir.path()).await;
    let job = manager
        .add_magnet(&magnet(30, "dead"), "", None)
        .await
        .unwrap();

    wait_for(&manager, &job.info_hash, Duration::from_secs(10), |j| {
        j.state == JobState::Error
    })
    .await;

    let job = manager.get(&job.info_hash).unwrap();
    assert!(job.last_error.unwrap().contains("dead"));
    assert_eq!(job.size_done, 0);
    // Exactly one submission; the error was not retried.
    assert_eq!(gateway.submitted().len(), 1);

    manager.shutdown().await;
}

// ===========================================================================
// Restart
// ===========================================================================

#[tokio::test]
async fn restart_resumes_from_persisted_watermark() {
    let dir = tempfile::tempdir().unwrap();
    let body: Vec<u8> = (0..8_000u32).map(|i| (i % 241) as u8).collect();
    let watermark = 3_000usize;

    // Simulate the previous process: partial file plus a persisted record
    // caught in `downloading`.
    let store_dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteStore::open(store_dir.path().join("jobs.db")).await.unwrap());

    let mut partial = body[..watermark].to_vec();
    partial.resize(body.len(), 0); // preallocated tail
    std::fs::write(dir.path().join("res.bin"), &partial).unwrap();

    let mut job = Job::new(
        hash(40),
        magnet(40, "res"),
        "res".into(),
        "".into(),
        dir.path().to_path_buf(),
    );
    job.state = JobState::Downloading;
    job.debrid_id = Some(1);
    job.files = vec![JobFile {
        name: "res.bin".into(),
        size: body.len() as u64,
        hosted_url: "h/res".into(),
        done: watermark as u64,
        segments: Vec::new(),
    }];
    job.size_total = body.len() as u64;
    job.recount_done();
    store.put(&job).await.unwrap();

    // Only the tail range is mocked: a full-file request would error out
    // and the job would land in `error` instead of `completed`.
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/d/res.bin"))
        .and(header("Range", format!("bytes={}-", watermark).as_str()))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header(
                    "Content-Range",
                    format!("bytes {}-{}/{}", watermark, body.len() - 1, body.len()).as_str(),
                )
                .set_body_bytes(body[watermark..].to_vec()),
        )
        .mount(&server)
        .await;

    let gateway = Arc::new(MockGateway::new());
    gateway.set_status(ready_file("res.bin", body.len() as u64, "h/res"));
    gateway.set_unlock("h/res", unlocked(format!("{}/d/res.bin", server.uri())));

    let manager = JobManager::new(
        {
            let mut p = test_profile();
            p.preallocate = true;
            p
        },
        dir.path().to_path_buf(),
        Arc::clone(&gateway) as Arc<dyn debrid_broker::DebridGateway>,
        Arc::clone(&store) as Arc<dyn JobStore>,
    )
    .await
    .unwrap();

    wait_for(&manager, &hash(40), Duration::from_secs(15), |j| {
        j.state == JobState::Completed
    })
    .await;

    let on_disk = std::fs::read(dir.path().join("res.bin")).unwrap();
    assert_eq!(on_disk.len(), body.len());
    assert_eq!(on_disk, body);

    // No submission happened on restart; the recorded debrid id was reused.
    assert!(gateway.submitted().is_empty());

    manager.shutdown().await;
}

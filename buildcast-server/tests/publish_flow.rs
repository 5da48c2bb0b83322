//! End-to-end publish scenarios against the orchestrator.
//!
//! Builds run through a scripted builder and artifacts land in the
//! in-memory object store; job records go to a real SQLite file.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use buildcast_server::publish::builder::{BuildError, BuildTarget, PlatformBuilder};
use buildcast_server::publish::clock::SystemClock;
use buildcast_server::publish::uploader::{object_key, UploadError};
use buildcast_server::publish::{
    ArtifactUploader, BuildStatus, MemoryObjectStore, ObjectStore, OrchestratorConfig, Platform,
    PublishError, PublishOrchestrator, PublishRequest, RetryPolicy, SqliteStatusStore, Strategy,
};
use futures::future::BoxFuture;
use parking_lot::Mutex;

/// Records build order and fails the listed platforms.
#[derive(Default)]
struct ScriptedBuilder {
    failing: HashSet<Platform>,
    order: Mutex<Vec<Platform>>,
}

impl ScriptedBuilder {
    fn failing(platforms: &[Platform]) -> Self {
        Self {
            failing: platforms.iter().copied().collect(),
            ..Default::default()
        }
    }
}

impl PlatformBuilder for ScriptedBuilder {
    fn build<'a>(&'a self, target: BuildTarget<'a>) -> BoxFuture<'a, Result<Vec<u8>, BuildError>> {
        Box::pin(async move {
            self.order.lock().push(target.platform);
            tokio::time::sleep(Duration::from_millis(10)).await;
            if self.failing.contains(&target.platform) {
                return Err(BuildError::Failed {
                    code: 2,
                    stderr: format!("{} build broke", target.platform),
                });
            }
            Ok(format!("{}:{}", target.job_id, target.platform).into_bytes())
        })
    }
}

/// Rejects every upload.
struct BrokenObjectStore;

impl ObjectStore for BrokenObjectStore {
    fn put_object<'a>(
        &'a self,
        _key: &'a str,
        _body: &'a [u8],
        _content_type: &'a str,
        _metadata: &'a std::collections::BTreeMap<String, String>,
    ) -> BoxFuture<'a, Result<(), UploadError>> {
        Box::pin(async { Err(UploadError::Transport("connection refused".into())) })
    }

    fn object_exists<'a>(&'a self, _key: &'a str) -> BoxFuture<'a, Result<bool, UploadError>> {
        Box::pin(async { Ok(false) })
    }

    fn presign_get(&self, _key: &str, _expires: Duration) -> Result<String, UploadError> {
        Err(UploadError::Transport("connection refused".into()))
    }
}

struct Harness {
    orch: PublishOrchestrator,
    builder: Arc<ScriptedBuilder>,
    _dir: tempfile::TempDir,
}

fn harness(builder: ScriptedBuilder, objects: Arc<dyn ObjectStore>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("jobs.db");
    let store = SqliteStatusStore::open(db.to_str().unwrap()).unwrap();
    let builder = Arc::new(builder);
    let orch = PublishOrchestrator::new(
        Arc::new(store),
        builder.clone(),
        ArtifactUploader::new(
            objects,
            RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
            },
        ),
        Arc::new(SystemClock),
        OrchestratorConfig::default(),
    );
    Harness {
        orch,
        builder,
        _dir: dir,
    }
}

fn request(platforms: &[&str], strategy: Strategy) -> PublishRequest {
    PublishRequest {
        project_id: "P-42".into(),
        platforms: platforms.iter().map(|p| p.to_string()).collect(),
        strategy: Some(strategy),
        ..Default::default()
    }
}

#[tokio::test]
async fn new_job_is_pending() {
    let h = harness(ScriptedBuilder::default(), Arc::new(MemoryObjectStore::new()));
    let job = h
        .orch
        .create_job(request(&["android", "h5"], Strategy::Parallel))
        .unwrap();

    assert_eq!(job.status, BuildStatus::Pending);
    assert_eq!(job.estimated_minutes, 8);
    for platform in [Platform::Android, Platform::H5] {
        let s = job.platform_state(platform).unwrap();
        assert_eq!(s.status, BuildStatus::Pending);
        assert_eq!(s.progress, 0);
    }
    // Persisted before create_job returned.
    assert_eq!(h.orch.get_status(&job.job_id).unwrap().job_id, job.job_id);
    h.orch.wait(&job.job_id).await;
}

#[tokio::test]
async fn parallel_failure_is_isolated() {
    let objects = Arc::new(MemoryObjectStore::new());
    let h = harness(ScriptedBuilder::failing(&[Platform::H5]), objects.clone());
    let job = h
        .orch
        .create_job(request(&["android", "h5"], Strategy::Parallel))
        .unwrap();
    h.orch.wait(&job.job_id).await;

    let done = h.orch.get_status(&job.job_id).unwrap();
    assert_eq!(done.status, BuildStatus::Failed);

    let android = done.platform_state(Platform::Android).unwrap();
    assert_eq!(android.status, BuildStatus::Success);
    assert_eq!(android.progress, 100);
    assert!(android.artifact_ref.is_some());
    assert!(android.error_message.is_none());

    let h5 = done.platform_state(Platform::H5).unwrap();
    assert_eq!(h5.status, BuildStatus::Failed);
    assert_eq!(h5.progress, 100);
    assert!(h5.artifact_ref.is_none());
    assert!(h5.error_message.as_deref().unwrap().contains("h5 build broke"));

    assert!(objects.object(&object_key(&job.job_id, Platform::Android)).is_some());
    assert!(objects.object(&object_key(&job.job_id, Platform::H5)).is_none());
    assert_eq!(objects.len(), 1);
}

#[tokio::test]
async fn sequential_stops_at_first_failure() {
    let h = harness(
        ScriptedBuilder::failing(&[Platform::Ios]),
        Arc::new(MemoryObjectStore::new()),
    );
    let job = h
        .orch
        .create_job(request(&["android", "ios", "h5", "desktop"], Strategy::Sequential))
        .unwrap();
    assert_eq!(job.estimated_minutes, 8 + 10 + 3 + 12);
    h.orch.wait(&job.job_id).await;

    let done = h.orch.get_status(&job.job_id).unwrap();
    assert_eq!(done.status, BuildStatus::Failed);
    assert_eq!(done.platform_state(Platform::Android).unwrap().status, BuildStatus::Success);
    assert_eq!(done.platform_state(Platform::Ios).unwrap().status, BuildStatus::Failed);
    for platform in [Platform::H5, Platform::Desktop] {
        let s = done.platform_state(platform).unwrap();
        assert_eq!(s.status, BuildStatus::Pending);
        assert_eq!(s.progress, 0);
        assert!(s.started_at.is_none());
    }
    assert_eq!(*h.builder.order.lock(), vec![Platform::Android, Platform::Ios]);
}

#[tokio::test]
async fn sequential_runs_in_declared_order() {
    let h = harness(ScriptedBuilder::default(), Arc::new(MemoryObjectStore::new()));
    let job = h
        .orch
        .create_job(request(&["desktop", "h5", "android"], Strategy::Sequential))
        .unwrap();
    h.orch.wait(&job.job_id).await;

    let done = h.orch.get_status(&job.job_id).unwrap();
    assert_eq!(done.status, BuildStatus::Success);
    assert_eq!(
        *h.builder.order.lock(),
        vec![Platform::Desktop, Platform::H5, Platform::Android]
    );
    let desktop = done.platform_state(Platform::Desktop).unwrap();
    let android = done.platform_state(Platform::Android).unwrap();
    assert!(desktop.completed_at.unwrap() <= android.started_at.unwrap());
}

#[tokio::test]
async fn upload_exhaustion_fails_the_platform() {
    let h = harness(ScriptedBuilder::default(), Arc::new(BrokenObjectStore));
    let job = h
        .orch
        .create_job(request(&["miniapp"], Strategy::Parallel))
        .unwrap();
    h.orch.wait(&job.job_id).await;

    let done = h.orch.get_status(&job.job_id).unwrap();
    let miniapp = done.platform_state(Platform::Miniapp).unwrap();
    assert_eq!(miniapp.status, BuildStatus::Failed);
    let message = miniapp.error_message.as_deref().unwrap();
    assert!(message.contains("after 3 attempts"), "{message}");
    assert!(message.contains("connection refused"), "{message}");
}

#[tokio::test]
async fn deleted_job_is_not_found() {
    let h = harness(ScriptedBuilder::default(), Arc::new(MemoryObjectStore::new()));
    let job = h.orch.create_job(request(&["h5"], Strategy::Parallel)).unwrap();
    h.orch.wait(&job.job_id).await;
    assert_eq!(h.orch.job_count().unwrap(), 1);

    h.orch.delete_job(&job.job_id).unwrap();
    assert!(matches!(
        h.orch.get_status(&job.job_id),
        Err(PublishError::NotFound(_))
    ));
    assert_eq!(h.orch.job_count().unwrap(), 0);
}

#[tokio::test]
async fn many_jobs_run_concurrently() {
    let h = harness(ScriptedBuilder::default(), Arc::new(MemoryObjectStore::new()));
    let jobs: Vec<_> = (0..8)
        .map(|_| {
            h.orch
                .create_job(request(
                    &["android", "ios", "h5", "miniapp", "desktop"],
                    Strategy::Parallel,
                ))
                .unwrap()
        })
        .collect();
    for job in &jobs {
        h.orch.wait(&job.job_id).await;
    }
    for job in &jobs {
        let done = h.orch.get_status(&job.job_id).unwrap();
        assert_eq!(done.status, BuildStatus::Success);
        assert_eq!(done.count_with_status(BuildStatus::Success), 5);
        // One start, one progress and one completion write per platform.
        assert_eq!(done.version, 15);
    }
    assert_eq!(h.orch.active_jobs(), 0);
}

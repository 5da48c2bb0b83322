//! Publish job lifecycle.
//!
//! `create_job` validates and persists the initial record, then hands the job
//! to a driver task. PARALLEL jobs fan out one worker per platform and join
//! on all of them; SEQUENTIAL jobs run platforms in order in a single task
//! and stop at the first one that does not succeed. Either way the driver
//! finalizes the job once every worker is done.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;

use super::builder::{BuildTarget, PlatformBuilder};
use super::clock::Clock;
use super::presign::MAX_EXPIRY;
use super::store::{StatusStore, StoreError, DEFAULT_RECORD_TTL};
use super::types::*;
use super::uploader::{artifact_metadata, object_key, ArtifactUploader, UploadError};

/// Progress reported once the artifact is built and before it is uploaded.
const BUILT_PROGRESS: u8 = 50;

/// Error message on platforms stopped by `cancel_job`.
pub const CANCELLED_MESSAGE: &str = "cancelled";

static EMPTY_CONFIG: PlatformConfig = BTreeMap::new();

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Invalid publish request: {0}")]
    Validation(String),
    #[error("Build job not found: {0}")]
    NotFound(String),
    #[error("Platform {platform} is {status}, no artifact available")]
    NotReady { platform: Platform, status: BuildStatus },
    #[error("No artifact for {platform} in job {job_id}")]
    ArtifactMissing { job_id: String, platform: Platform },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Upload(#[from] UploadError),
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Lifetime of job records.
    pub record_ttl: Duration,
    /// Validity of download URLs.
    pub download_ttl: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            record_ttl: DEFAULT_RECORD_TTL,
            download_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelOutcome {
    pub job_id: String,
    /// False when the job had already finished.
    pub cancelled: bool,
    pub status: BuildStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadLink {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

/// Cooperative cancellation signal shared by a job's workers.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

struct ActiveJob {
    cancel: CancelFlag,
    done: watch::Receiver<bool>,
}

/// What the driver needs to run a job; fixed at creation.
struct JobPlan {
    job_id: String,
    project_id: String,
    platforms: Vec<Platform>,
    strategy: Strategy,
    configs: BTreeMap<Platform, PlatformConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlatformOutcome {
    Succeeded,
    Failed,
    Cancelled,
    /// The status record could not be written; the worker gave up.
    Aborted,
}

struct Inner {
    store: Arc<dyn StatusStore>,
    builder: Arc<dyn PlatformBuilder>,
    uploader: ArtifactUploader,
    clock: Arc<dyn Clock>,
    config: OrchestratorConfig,
    active: Mutex<HashMap<String, ActiveJob>>,
}

#[derive(Clone)]
pub struct PublishOrchestrator {
    inner: Arc<Inner>,
}

impl PublishOrchestrator {
    pub fn new(
        store: Arc<dyn StatusStore>,
        builder: Arc<dyn PlatformBuilder>,
        uploader: ArtifactUploader,
        clock: Arc<dyn Clock>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                builder,
                uploader,
                clock,
                config,
                active: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn StatusStore> {
        &self.inner.store
    }

    /// Validate the request, persist the initial record and start the job.
    ///
    /// Returns as soon as the record is stored; builds run in the background.
    /// Must be called from within a tokio runtime.
    pub fn create_job(&self, request: PublishRequest) -> Result<BuildJob, PublishError> {
        let (platforms, configs) = validate(&request)?;
        let strategy = request.effective_strategy();
        let job = BuildJob::new(
            crate::jobid::generate(),
            request.project_id.trim().to_string(),
            platforms.clone(),
            strategy,
            self.inner.clock.now(),
        );
        self.inner.store.set(&job, self.inner.config.record_ttl)?;

        let cancel = CancelFlag::default();
        let (done_tx, done_rx) = watch::channel(false);
        self.inner.active.lock().insert(
            job.job_id.clone(),
            ActiveJob {
                cancel: cancel.clone(),
                done: done_rx,
            },
        );

        let plan = Arc::new(JobPlan {
            job_id: job.job_id.clone(),
            project_id: job.project_id.clone(),
            platforms,
            strategy,
            configs,
        });
        tokio::spawn(drive(Arc::clone(&self.inner), plan, cancel, done_tx));

        tracing::info!(
            job_id = %job.job_id,
            project_id = %job.project_id,
            platforms = ?job.platforms,
            strategy = ?job.strategy,
            estimated_minutes = job.estimated_minutes,
            "Publish job created"
        );
        Ok(job)
    }

    pub fn get_status(&self, job_id: &str) -> Result<BuildJob, PublishError> {
        self.inner
            .store
            .get(job_id)?
            .ok_or_else(|| PublishError::NotFound(job_id.to_string()))
    }

    /// Ask a running job to stop.
    ///
    /// Platforms that have not started stay PENDING; a platform caught
    /// mid-build is marked FAILED with [`CANCELLED_MESSAGE`] at its next
    /// checkpoint.
    pub fn cancel_job(&self, job_id: &str) -> Result<CancelOutcome, PublishError> {
        let job = self.get_status(job_id)?;
        let flag = self
            .inner
            .active
            .lock()
            .get(job_id)
            .map(|active| active.cancel.clone());
        let cancelled = match flag {
            Some(flag) => {
                flag.cancel();
                tracing::info!(job_id, "Publish job cancellation requested");
                true
            }
            None => false,
        };
        Ok(CancelOutcome {
            job_id: job.job_id,
            cancelled,
            status: job.status,
        })
    }

    /// Remove a job's record, stopping it first if it is still running.
    pub fn delete_job(&self, job_id: &str) -> Result<(), PublishError> {
        if let Some(active) = self.inner.active.lock().get(job_id) {
            active.cancel.cancel();
        }
        if !self.inner.store.delete(job_id)? {
            return Err(PublishError::NotFound(job_id.to_string()));
        }
        tracing::info!(job_id, "Publish job deleted");
        Ok(())
    }

    /// A time-limited download URL for a successfully built platform.
    pub async fn download_url(
        &self,
        job_id: &str,
        platform: &str,
    ) -> Result<DownloadLink, PublishError> {
        let platform: Platform = platform
            .parse()
            .map_err(|e: UnknownPlatform| PublishError::Validation(e.to_string()))?;
        let job = self.get_status(job_id)?;
        let missing = || PublishError::ArtifactMissing {
            job_id: job_id.to_string(),
            platform,
        };
        let state = job.platform_state(platform).ok_or_else(missing)?;
        let key = match (state.status, &state.artifact_ref) {
            (BuildStatus::Success, Some(key)) => key.clone(),
            (status, _) => return Err(PublishError::NotReady { platform, status }),
        };

        let objects = self.inner.uploader.store();
        if !objects.object_exists(&key).await? {
            return Err(missing());
        }
        let ttl = self.inner.config.download_ttl.min(MAX_EXPIRY);
        let url = objects.presign_get(&key, ttl)?;
        let expires_at =
            self.inner.clock.now() + TimeDelta::from_std(ttl).unwrap_or(TimeDelta::zero());
        tracing::info!(job_id, %platform, "Download URL issued");
        Ok(DownloadLink { url, expires_at })
    }

    /// Wait until a running job's workers have all finished.
    pub async fn wait(&self, job_id: &str) {
        let done = self
            .inner
            .active
            .lock()
            .get(job_id)
            .map(|active| active.done.clone());
        if let Some(mut done) = done {
            let _ = done.wait_for(|finished| *finished).await;
        }
    }

    /// Number of jobs whose workers are still running.
    pub fn active_jobs(&self) -> usize {
        self.inner.active.lock().len()
    }

    /// Number of stored, unexpired job records.
    pub fn job_count(&self) -> Result<usize, PublishError> {
        Ok(self.inner.store.count()?)
    }

    pub fn purge_expired(&self) -> Result<usize, PublishError> {
        Ok(self.inner.store.purge_expired()?)
    }
}

/// Check a request and resolve its platform names and configs.
fn validate(
    request: &PublishRequest,
) -> Result<(Vec<Platform>, BTreeMap<Platform, PlatformConfig>), PublishError> {
    if request.project_id.trim().is_empty() {
        return Err(PublishError::Validation("projectId is required".into()));
    }
    if request.platforms.is_empty() {
        return Err(PublishError::Validation(
            "at least one platform is required".into(),
        ));
    }
    let mut platforms = Vec::with_capacity(request.platforms.len());
    for name in &request.platforms {
        let platform: Platform = name
            .parse()
            .map_err(|e: UnknownPlatform| PublishError::Validation(e.to_string()))?;
        if platforms.contains(&platform) {
            return Err(PublishError::Validation(format!(
                "platform {platform} listed more than once"
            )));
        }
        platforms.push(platform);
    }

    // Configs for platforms that are not being built are ignored.
    let configs = request
        .platform_configs
        .iter()
        .filter_map(|(name, config)| {
            let platform = name.parse::<Platform>().ok()?;
            platforms
                .contains(&platform)
                .then(|| (platform, config.clone()))
        })
        .collect();
    Ok((platforms, configs))
}

// ─── Workers ─────────────────────────────────────────────────────────────────

async fn drive(
    inner: Arc<Inner>,
    plan: Arc<JobPlan>,
    cancel: CancelFlag,
    done: watch::Sender<bool>,
) {
    match plan.strategy {
        Strategy::Parallel => {
            let workers = plan.platforms.iter().map(|&platform| {
                let inner = Arc::clone(&inner);
                let plan = Arc::clone(&plan);
                let cancel = cancel.clone();
                tokio::spawn(async move { inner.run_platform(&plan, platform, &cancel).await })
            });
            let joined = futures::future::join_all(workers).await;
            for (&platform, result) in plan.platforms.iter().zip(joined) {
                if let Err(e) = result {
                    tracing::error!(
                        job_id = %plan.job_id,
                        %platform,
                        error = %e,
                        "Platform worker died"
                    );
                    inner.fail(&plan.job_id, platform, format!("worker died: {e}"));
                }
            }
        }
        Strategy::Sequential => {
            for &platform in &plan.platforms {
                let outcome = inner.run_platform(&plan, platform, &cancel).await;
                if outcome != PlatformOutcome::Succeeded {
                    tracing::info!(
                        job_id = %plan.job_id,
                        %platform,
                        ?outcome,
                        "Sequential job stopped"
                    );
                    break;
                }
            }
        }
    }
    inner.finalize(&plan.job_id);
    let _ = done.send(true);
}

impl Inner {
    async fn run_platform(
        &self,
        plan: &JobPlan,
        platform: Platform,
        cancel: &CancelFlag,
    ) -> PlatformOutcome {
        let job_id = plan.job_id.as_str();
        if cancel.is_cancelled() {
            tracing::info!(job_id, %platform, "Job cancelled, platform not started");
            return PlatformOutcome::Cancelled;
        }

        let now = self.clock.now();
        if let Err(e) = self.update(job_id, platform, |s| s.start(now)) {
            return self.abort(job_id, platform, e);
        }
        tracing::info!(job_id, %platform, "Platform build started");

        let config = plan.configs.get(&platform).unwrap_or(&EMPTY_CONFIG);
        let target = BuildTarget {
            job_id,
            project_id: &plan.project_id,
            platform,
            config,
        };
        let artifact = match self.builder.build(target).await {
            Ok(bytes) => bytes,
            Err(e) => return self.fail(job_id, platform, e.to_string()),
        };
        if cancel.is_cancelled() {
            return self.stop(job_id, platform);
        }
        if let Err(e) = self.update(job_id, platform, |s| s.advance(BUILT_PROGRESS)) {
            return self.abort(job_id, platform, e);
        }

        let key = object_key(job_id, platform);
        let metadata = artifact_metadata(job_id, platform, self.clock.now(), config);
        let artifact_ref = match self
            .uploader
            .upload(&key, &artifact, platform.content_type(), &metadata)
            .await
        {
            Ok(key) => key,
            Err(e) => return self.fail(job_id, platform, e.to_string()),
        };

        let now = self.clock.now();
        match self.update(job_id, platform, |s| s.succeed(artifact_ref.clone(), now)) {
            Ok(job) => {
                tracing::info!(
                    job_id,
                    %platform,
                    artifact = %artifact_ref,
                    size = artifact.len(),
                    overall = %job.status,
                    "Platform build succeeded"
                );
                PlatformOutcome::Succeeded
            }
            Err(e) => self.abort(job_id, platform, e),
        }
    }

    fn update(
        &self,
        job_id: &str,
        platform: Platform,
        mut mutator: impl FnMut(&mut PlatformBuildState) -> Result<(), TransitionError>,
    ) -> Result<BuildJob, StoreError> {
        self.store.update_platform(job_id, platform, &mut mutator)
    }

    fn fail(&self, job_id: &str, platform: Platform, message: String) -> PlatformOutcome {
        tracing::warn!(job_id, %platform, error = %message, "Platform build failed");
        let now = self.clock.now();
        match self.update(job_id, platform, |s| s.fail(message.clone(), now)) {
            Ok(_) => PlatformOutcome::Failed,
            Err(e) => self.abort(job_id, platform, e),
        }
    }

    fn stop(&self, job_id: &str, platform: Platform) -> PlatformOutcome {
        tracing::info!(job_id, %platform, "Platform build cancelled");
        let now = self.clock.now();
        match self.update(job_id, platform, |s| s.fail(CANCELLED_MESSAGE, now)) {
            Ok(_) => PlatformOutcome::Cancelled,
            Err(e) => self.abort(job_id, platform, e),
        }
    }

    fn abort(&self, job_id: &str, platform: Platform, error: StoreError) -> PlatformOutcome {
        match error {
            StoreError::NotFound(_) => {
                tracing::info!(job_id, %platform, "Job record removed, worker stopping");
            }
            StoreError::Transition(e) => {
                tracing::error!(job_id, %platform, error = %e, "Platform transition rejected");
            }
            e => {
                tracing::error!(
                    job_id,
                    %platform,
                    error = %e,
                    "Could not record platform status, marking it failed"
                );
                // One last write so the platform does not stay IN_PROGRESS.
                let message = format!("status update failed: {e}");
                let now = self.clock.now();
                if let Err(e) = self.update(job_id, platform, |s| s.fail(message.clone(), now)) {
                    tracing::error!(job_id, %platform, error = %e, "Platform left unfinished");
                }
            }
        }
        PlatformOutcome::Aborted
    }

    fn finalize(&self, job_id: &str) {
        self.active.lock().remove(job_id);
        match self.store.get(job_id) {
            Ok(Some(job)) if job.count_with_status(BuildStatus::InProgress) > 0 => tracing::error!(
                job_id,
                status = %job.status,
                in_progress = job.count_with_status(BuildStatus::InProgress),
                "Publish job finished with platforms still in progress"
            ),
            Ok(Some(job)) => tracing::info!(
                job_id,
                status = %job.status,
                succeeded = job.count_with_status(BuildStatus::Success),
                failed = job.count_with_status(BuildStatus::Failed),
                pending = job.count_with_status(BuildStatus::Pending),
                "Publish job finished"
            ),
            Ok(None) => tracing::info!(job_id, "Publish job finished without a record"),
            Err(e) => tracing::error!(job_id, error = %e, "Could not read final job status"),
        }
    }
}

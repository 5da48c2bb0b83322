//! Core data structures for publish jobs.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Platforms ───────────────────────────────────────────────────────────────

/// A supported build target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Android,
    Ios,
    H5,
    Miniapp,
    Desktop,
}

impl Platform {
    pub const ALL: [Platform; 5] = [
        Platform::Android,
        Platform::Ios,
        Platform::H5,
        Platform::Miniapp,
        Platform::Desktop,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Android => "android",
            Platform::Ios => "ios",
            Platform::H5 => "h5",
            Platform::Miniapp => "miniapp",
            Platform::Desktop => "desktop",
        }
    }

    /// Nominal build time in minutes, used for job estimates.
    pub fn estimated_minutes(&self) -> u32 {
        match self {
            Platform::Android => 8,
            Platform::Ios => 10,
            Platform::H5 => 3,
            Platform::Miniapp => 5,
            Platform::Desktop => 12,
        }
    }

    /// File extension of the produced artifact.
    pub fn extension(&self) -> &'static str {
        match self {
            Platform::Android => "apk",
            Platform::Ios => "ipa",
            Platform::H5 | Platform::Miniapp => "zip",
            Platform::Desktop => "exe",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Platform::Android => "application/vnd.android.package-archive",
            Platform::Ios => "application/octet-stream",
            Platform::H5 | Platform::Miniapp => "application/zip",
            Platform::Desktop => "application/x-msdownload",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unsupported platform: {0}")]
pub struct UnknownPlatform(pub String);

impl FromStr for Platform {
    type Err = UnknownPlatform;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase();
        Platform::ALL
            .into_iter()
            .find(|p| p.as_str() == name)
            .ok_or_else(|| UnknownPlatform(s.to_string()))
    }
}

// ─── Statuses ────────────────────────────────────────────────────────────────

/// How the platforms of one job are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Strategy {
    #[default]
    Parallel,
    Sequential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildStatus {
    Pending,
    InProgress,
    Success,
    Failed,
}

impl BuildStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BuildStatus::Success | BuildStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Pending => "PENDING",
            BuildStatus::InProgress => "IN_PROGRESS",
            BuildStatus::Success => "SUCCESS",
            BuildStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected state change on a platform slice.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("Platform {platform} is already {status}")]
    Terminal { platform: Platform, status: BuildStatus },
    #[error("Platform {platform} has not started")]
    NotStarted { platform: Platform },
}

// ─── Per-platform state ──────────────────────────────────────────────────────

/// Progress of one platform inside a job.
///
/// Fields only change through the transition methods, which keep the
/// timestamps write-once and the progress monotonic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformBuildState {
    pub platform: Platform,
    pub status: BuildStatus,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl PlatformBuildState {
    pub fn pending(platform: Platform) -> Self {
        Self {
            platform,
            status: BuildStatus::Pending,
            progress: 0,
            started_at: None,
            completed_at: None,
            artifact_ref: None,
            error_message: None,
        }
    }

    fn ensure_open(&self) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::Terminal {
                platform: self.platform,
                status: self.status,
            });
        }
        Ok(())
    }

    /// Enter IN_PROGRESS. Repeated calls keep the first start time.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.ensure_open()?;
        self.status = BuildStatus::InProgress;
        self.started_at.get_or_insert(now);
        Ok(())
    }

    /// Raise progress. Lower values are ignored.
    pub fn advance(&mut self, progress: u8) -> Result<(), TransitionError> {
        self.ensure_open()?;
        if self.status != BuildStatus::InProgress {
            return Err(TransitionError::NotStarted {
                platform: self.platform,
            });
        }
        self.progress = self.progress.max(progress.min(100));
        Ok(())
    }

    pub fn succeed(
        &mut self,
        artifact_ref: String,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.ensure_open()?;
        if self.status != BuildStatus::InProgress {
            return Err(TransitionError::NotStarted {
                platform: self.platform,
            });
        }
        self.status = BuildStatus::Success;
        self.progress = 100;
        self.artifact_ref = Some(artifact_ref);
        self.completed_at.get_or_insert(now);
        Ok(())
    }

    pub fn fail(
        &mut self,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.ensure_open()?;
        self.status = BuildStatus::Failed;
        self.progress = 100;
        self.error_message = Some(message.into());
        self.completed_at.get_or_insert(now);
        Ok(())
    }
}

// ─── Jobs ────────────────────────────────────────────────────────────────────

/// Free-form per-platform build options (signing profile, version name, ...).
pub type PlatformConfig = BTreeMap<String, serde_json::Value>;

/// The persisted record of one publish request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildJob {
    pub job_id: String,
    pub project_id: String,
    pub platforms: Vec<Platform>,
    pub strategy: Strategy,
    pub status: BuildStatus,
    pub platform_states: BTreeMap<Platform, PlatformBuildState>,
    pub estimated_minutes: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Bumped by every store write.
    pub version: u64,
}

impl BuildJob {
    pub fn new(
        job_id: String,
        project_id: String,
        platforms: Vec<Platform>,
        strategy: Strategy,
        now: DateTime<Utc>,
    ) -> Self {
        let platform_states = platforms
            .iter()
            .map(|&p| (p, PlatformBuildState::pending(p)))
            .collect();
        Self {
            estimated_minutes: estimate_minutes(&platforms, strategy),
            job_id,
            project_id,
            platforms,
            strategy,
            status: BuildStatus::Pending,
            platform_states,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    pub fn platform_state(&self, platform: Platform) -> Option<&PlatformBuildState> {
        self.platform_states.get(&platform)
    }

    pub fn count_with_status(&self, status: BuildStatus) -> usize {
        self.platform_states
            .values()
            .filter(|s| s.status == status)
            .count()
    }
}

/// Max of the per-platform estimates when builds overlap, their sum when chained.
pub fn estimate_minutes(platforms: &[Platform], strategy: Strategy) -> u32 {
    let minutes = platforms.iter().map(|p| p.estimated_minutes());
    match strategy {
        Strategy::Parallel => minutes.max().unwrap_or(0),
        Strategy::Sequential => minutes.sum(),
    }
}

/// Incoming publish request, as posted by clients.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRequest {
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub platforms: Vec<String>,
    #[serde(default, alias = "perPlatformConfig")]
    pub platform_configs: BTreeMap<String, PlatformConfig>,
    #[serde(default)]
    pub strategy: Option<Strategy>,
    /// Older clients send a boolean instead of `strategy`.
    #[serde(default)]
    pub parallel_build: Option<bool>,
}

impl PublishRequest {
    pub fn effective_strategy(&self) -> Strategy {
        self.strategy
            .or_else(|| {
                self.parallel_build.map(|parallel| {
                    if parallel {
                        Strategy::Parallel
                    } else {
                        Strategy::Sequential
                    }
                })
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn platform_parse_is_case_insensitive() {
        assert_eq!("Android".parse::<Platform>().unwrap(), Platform::Android);
        assert_eq!(" h5 ".parse::<Platform>().unwrap(), Platform::H5);
        assert!("symbian".parse::<Platform>().is_err());
    }

    #[test]
    fn estimate_parallel_is_max_sequential_is_sum() {
        let platforms = [Platform::Android, Platform::Ios, Platform::H5];
        assert_eq!(estimate_minutes(&platforms, Strategy::Parallel), 10);
        assert_eq!(estimate_minutes(&platforms, Strategy::Sequential), 21);
        assert_eq!(estimate_minutes(&[Platform::Desktop], Strategy::Sequential), 12);
    }

    #[test]
    fn new_job_starts_pending() {
        let job = BuildJob::new(
            "J1".into(),
            "P1".into(),
            vec![Platform::Android, Platform::H5],
            Strategy::Parallel,
            ts(1_700_000_000),
        );
        assert_eq!(job.status, BuildStatus::Pending);
        assert_eq!(job.estimated_minutes, 8);
        assert_eq!(job.count_with_status(BuildStatus::Pending), 2);
        let android = job.platform_state(Platform::Android).unwrap();
        assert_eq!(android.progress, 0);
        assert!(android.started_at.is_none());
    }

    #[test]
    fn timestamps_are_write_once() {
        let mut s = PlatformBuildState::pending(Platform::Ios);
        s.start(ts(10)).unwrap();
        s.start(ts(20)).unwrap();
        assert_eq!(s.started_at, Some(ts(10)));
        s.succeed("J/ios/app.ipa".into(), ts(30)).unwrap();
        assert_eq!(s.completed_at, Some(ts(30)));
        assert!(s.fail("late", ts(40)).is_err());
        assert_eq!(s.completed_at, Some(ts(30)));
        assert!(s.error_message.is_none());
    }

    #[test]
    fn progress_never_moves_backwards() {
        let mut s = PlatformBuildState::pending(Platform::H5);
        s.start(ts(1)).unwrap();
        s.advance(50).unwrap();
        s.advance(20).unwrap();
        assert_eq!(s.progress, 50);
        s.advance(250).unwrap();
        assert_eq!(s.progress, 100);
    }

    #[test]
    fn succeed_requires_start() {
        let mut s = PlatformBuildState::pending(Platform::Desktop);
        assert_eq!(
            s.succeed("x".into(), ts(1)),
            Err(TransitionError::NotStarted {
                platform: Platform::Desktop
            })
        );
        assert!(s.artifact_ref.is_none());
    }

    #[test]
    fn fail_sets_message_and_full_progress() {
        let mut s = PlatformBuildState::pending(Platform::Miniapp);
        s.start(ts(1)).unwrap();
        s.fail("compiler exploded", ts(2)).unwrap();
        assert_eq!(s.status, BuildStatus::Failed);
        assert_eq!(s.progress, 100);
        assert_eq!(s.error_message.as_deref(), Some("compiler exploded"));
        assert!(s.artifact_ref.is_none());
        assert!(s.start(ts(3)).is_err());
    }

    #[test]
    fn job_json_uses_wire_names() {
        let job = BuildJob::new(
            "J1".into(),
            "P1".into(),
            vec![Platform::Android],
            Strategy::Sequential,
            ts(0),
        );
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["jobId"], "J1");
        assert_eq!(json["strategy"], "SEQUENTIAL");
        assert_eq!(json["platformStates"]["android"]["status"], "PENDING");
        assert!(json["platformStates"]["android"].get("artifactRef").is_none());
        let back: BuildJob = serde_json::from_value(json).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn request_strategy_falls_back_to_parallel_flag() {
        let req: PublishRequest =
            serde_json::from_str(r#"{"projectId":"p","platforms":["ios"],"parallelBuild":false}"#)
                .unwrap();
        assert_eq!(req.effective_strategy(), Strategy::Sequential);

        let req: PublishRequest = serde_json::from_str(
            r#"{"projectId":"p","platforms":["ios"],"strategy":"PARALLEL","parallelBuild":false}"#,
        )
        .unwrap();
        assert_eq!(req.effective_strategy(), Strategy::Parallel);

        assert_eq!(PublishRequest::default().effective_strategy(), Strategy::Parallel);
    }

    #[test]
    fn request_accepts_either_config_field_name() {
        let req: PublishRequest = serde_json::from_str(
            r#"{"projectId":"p","platforms":["h5"],"perPlatformConfig":{"h5":{"minify":true}}}"#,
        )
        .unwrap();
        assert_eq!(req.platform_configs["h5"]["minify"], serde_json::json!(true));
    }
}

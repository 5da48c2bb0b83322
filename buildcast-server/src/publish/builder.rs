//! Platform builders: turn a project + platform config into artifact bytes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use command_group::{AsyncCommandGroup, AsyncGroupChild};
use futures::future::BoxFuture;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use super::types::{Platform, PlatformConfig};

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("No build command configured for {0}")]
    Unsupported(Platform),
    #[error("Build exited with code {code}: {stderr}")]
    Failed { code: i32, stderr: String },
    #[error("Build timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("Build produced no artifact at {}", .0.display())]
    MissingArtifact(PathBuf),
    #[error("Build I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything a builder gets to know about one platform build.
#[derive(Debug, Clone, Copy)]
pub struct BuildTarget<'a> {
    pub job_id: &'a str,
    pub project_id: &'a str,
    pub platform: Platform,
    pub config: &'a PlatformConfig,
}

/// Produces the artifact for one platform. Failures are final for that
/// platform; nothing retries a build.
pub trait PlatformBuilder: Send + Sync {
    fn build<'a>(&'a self, target: BuildTarget<'a>) -> BoxFuture<'a, Result<Vec<u8>, BuildError>>;
}

// ─── Placeholder ─────────────────────────────────────────────────────────────

/// Emits a small text artifact describing the build, after an optional delay.
#[derive(Debug, Default, Clone)]
pub struct PlaceholderBuilder {
    delay: Duration,
}

impl PlaceholderBuilder {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl PlatformBuilder for PlaceholderBuilder {
    fn build<'a>(&'a self, target: BuildTarget<'a>) -> BoxFuture<'a, Result<Vec<u8>, BuildError>> {
        Box::pin(async move {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let mut text = format!(
                "buildcast placeholder artifact\n\
                 project: {}\njob: {}\nplatform: {}\nbuilt: {}\nformat: {}\n",
                target.project_id,
                target.job_id,
                target.platform,
                Utc::now().to_rfc3339(),
                target.platform.extension(),
            );
            for (key, value) in target.config {
                text.push_str(&format!("config {key} = {value}\n"));
            }
            Ok(text.into_bytes())
        })
    }
}

// ─── External commands ───────────────────────────────────────────────────────

/// Keep this much of stderr in failure messages.
const STDERR_TAIL: usize = 1024;

/// How long a timed-out build gets between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(5);

const STDERR_DRAIN: Duration = Duration::from_secs(2);

/// Runs one shell command per platform.
///
/// Each build gets its own directory `<workspace>/<job>/<platform>` and
/// these environment variables:
///
/// - `BUILDCAST_JOB_ID`, `BUILDCAST_PROJECT_ID`, `BUILDCAST_PLATFORM`
/// - `BUILDCAST_CONFIG`: the platform config as JSON
/// - `BUILDCAST_OUTPUT`: where the command must write the artifact
///
/// The command runs in its own process group. At the deadline the whole group
/// is terminated, so toolchains the shell started go down with it. The build
/// directory is removed once the command is done, whatever the outcome.
pub struct CommandBuilder {
    commands: BTreeMap<Platform, String>,
    workspace: PathBuf,
    timeout: Duration,
}

impl CommandBuilder {
    pub fn new(
        commands: BTreeMap<Platform, String>,
        workspace: PathBuf,
        timeout: Duration,
    ) -> Self {
        Self {
            commands,
            workspace,
            timeout,
        }
    }

    pub fn supports(&self, platform: Platform) -> bool {
        self.commands.contains_key(&platform)
    }

    async fn run(
        &self,
        cmd: &str,
        dir: &Path,
        output: &Path,
        target: BuildTarget<'_>,
    ) -> Result<Vec<u8>, BuildError> {
        tokio::fs::create_dir_all(dir).await?;
        let config_json =
            serde_json::to_string(target.config).unwrap_or_else(|_| "{}".to_string());
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .current_dir(dir)
            .env("BUILDCAST_JOB_ID", target.job_id)
            .env("BUILDCAST_PROJECT_ID", target.project_id)
            .env("BUILDCAST_PLATFORM", target.platform.as_str())
            .env("BUILDCAST_CONFIG", config_json)
            .env("BUILDCAST_OUTPUT", output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .group_spawn()?;

        let stderr = child.inner().stderr.take();
        let stderr_reader = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_end(&mut buf).await;
            }
            buf
        });

        let finished = tokio::select! {
            status = child.wait() => Some(status),
            _ = tokio::time::sleep(self.timeout) => None,
        };
        let status = match finished {
            Some(status) => status?,
            None => {
                tracing::warn!(
                    job_id = target.job_id,
                    platform = %target.platform,
                    timeout_secs = self.timeout.as_secs(),
                    "Build command timed out, terminating process group"
                );
                terminate_process_group(&mut child, KILL_GRACE).await;
                stderr_reader.abort();
                return Err(BuildError::Timeout(self.timeout));
            }
        };
        // A backgrounded child can hold stderr open after the shell exits.
        let stderr = match tokio::time::timeout(STDERR_DRAIN, stderr_reader).await {
            Ok(Ok(buf)) => buf,
            _ => Vec::new(),
        };

        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr);
            let skip = stderr.chars().count().saturating_sub(STDERR_TAIL);
            return Err(BuildError::Failed {
                code: status.code().unwrap_or(-1),
                stderr: stderr.chars().skip(skip).collect::<String>().trim().to_string(),
            });
        }

        match tokio::fs::read(output).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BuildError::MissingArtifact(output.to_path_buf()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// SIGTERM the group, give it `grace` to exit, then SIGKILL and reap.
#[cfg(unix)]
async fn terminate_process_group(child: &mut AsyncGroupChild, grace: Duration) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.inner().id() else {
        return;
    };
    let pgid = Pid::from_raw(pid as i32);

    match killpg(pgid, Signal::SIGTERM) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => tracing::warn!(pid, error = %e, "SIGTERM to build process group failed"),
    }

    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if matches!(child.inner().try_wait(), Ok(Some(_))) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // The leader may be gone while others in the group linger.
    match killpg(pgid, Signal::SIGKILL) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => tracing::warn!(pid, error = %e, "SIGKILL to build process group failed"),
    }
    let _ = child.wait().await;
}

#[cfg(not(unix))]
async fn terminate_process_group(child: &mut AsyncGroupChild, _grace: Duration) {
    let _ = child.kill().await;
    let _ = child.wait().await;
}

/// Drop a finished build's directory, and the job directory once it is empty.
async fn remove_build_dir(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(dir = %dir.display(), error = %e, "Could not remove build directory");
        }
    }
    if let Some(job_dir) = dir.parent() {
        // Fails while sibling platforms are still building.
        let _ = tokio::fs::remove_dir(job_dir).await;
    }
}

impl PlatformBuilder for CommandBuilder {
    fn build<'a>(&'a self, target: BuildTarget<'a>) -> BoxFuture<'a, Result<Vec<u8>, BuildError>> {
        Box::pin(async move {
            let cmd = self
                .commands
                .get(&target.platform)
                .ok_or(BuildError::Unsupported(target.platform))?;
            let dir = self
                .workspace
                .join(target.job_id)
                .join(target.platform.as_str());
            let output = dir.join(format!("app.{}", target.platform.extension()));
            tracing::info!(
                job_id = target.job_id,
                platform = %target.platform,
                "Running build command"
            );
            let started = std::time::Instant::now();
            let result = self.run(cmd, &dir, &output, target).await;
            remove_build_dir(&dir).await;
            tracing::info!(
                job_id = target.job_id,
                platform = %target.platform,
                elapsed_ms = started.elapsed().as_millis() as u64,
                ok = result.is_ok(),
                "Build command finished"
            );
            result
        })
    }
}

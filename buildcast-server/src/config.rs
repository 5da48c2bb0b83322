//! Server configuration: command-line flags with `BUILDCAST_*` environment
//! fallbacks, plus an optional TOML file describing build commands.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;

use crate::publish::presign::Credentials;
use crate::publish::store::DEFAULT_KEY_PREFIX;
use crate::publish::{OrchestratorConfig, Platform, RetryPolicy};

#[derive(Debug, Clone, Parser)]
#[command(name = "buildcast-server", about = "Multi-platform publish orchestration server")]
pub struct ServerConfig {
    /// HTTP listen address
    #[arg(long, env = "BUILDCAST_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// SQLite database for job records (in-memory when unset)
    #[arg(long, env = "BUILDCAST_DB_PATH")]
    pub db_path: Option<String>,

    /// Namespace prepended to every record key
    #[arg(long, env = "BUILDCAST_KEY_PREFIX", default_value = DEFAULT_KEY_PREFIX)]
    pub key_prefix: String,

    /// Days a job record is kept
    #[arg(long, env = "BUILDCAST_RECORD_TTL_DAYS", default_value_t = 30)]
    pub record_ttl_days: u64,

    /// Seconds between sweeps of expired records
    #[arg(long, env = "BUILDCAST_PURGE_INTERVAL_SECS", default_value_t = 3600)]
    pub purge_interval_secs: u64,

    /// S3-compatible endpoint, e.g. http://minio:9000 (artifacts stay in memory when unset)
    #[arg(long, env = "BUILDCAST_S3_ENDPOINT")]
    pub s3_endpoint: Option<String>,

    #[arg(long, env = "BUILDCAST_S3_BUCKET", default_value = "buildcast-artifacts")]
    pub s3_bucket: String,

    #[arg(long, env = "BUILDCAST_S3_ACCESS_KEY")]
    pub s3_access_key: Option<String>,

    #[arg(long, env = "BUILDCAST_S3_SECRET_KEY", hide_env_values = true)]
    pub s3_secret_key: Option<String>,

    #[arg(long, env = "BUILDCAST_S3_REGION", default_value = "us-east-1")]
    pub s3_region: String,

    /// Hours a download URL stays valid
    #[arg(long, env = "BUILDCAST_DOWNLOAD_TTL_HOURS", default_value_t = 24)]
    pub download_ttl_hours: u64,

    /// Upload attempts per artifact
    #[arg(long, env = "BUILDCAST_UPLOAD_ATTEMPTS", default_value_t = 3)]
    pub upload_attempts: u32,

    /// Wait before the first upload retry, in milliseconds; doubles after each retry
    #[arg(long, env = "BUILDCAST_UPLOAD_BACKOFF_MS", default_value_t = 1000)]
    pub upload_backoff_ms: u64,

    /// TOML file with per-platform build commands (placeholder builds when unset)
    #[arg(long, env = "BUILDCAST_BUILD_CONFIG")]
    pub build_config: Option<PathBuf>,

    /// Directory where build commands run
    #[arg(long, env = "BUILDCAST_BUILD_WORKSPACE", default_value = "/tmp/buildcast")]
    pub build_workspace: PathBuf,

    /// Hard limit on one platform build, in seconds
    #[arg(long, env = "BUILDCAST_BUILD_TIMEOUT_SECS", default_value_t = 1800)]
    pub build_timeout_secs: u64,

    /// Simulated build time for placeholder builds, in milliseconds
    #[arg(long, env = "BUILDCAST_PLACEHOLDER_DELAY_MS", default_value_t = 0)]
    pub placeholder_delay_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:0".to_string(),
            db_path: None,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            record_ttl_days: 30,
            purge_interval_secs: 3600,
            s3_endpoint: None,
            s3_bucket: "buildcast-artifacts".to_string(),
            s3_access_key: None,
            s3_secret_key: None,
            s3_region: "us-east-1".to_string(),
            download_ttl_hours: 24,
            upload_attempts: 3,
            upload_backoff_ms: 1000,
            build_config: None,
            build_workspace: PathBuf::from("/tmp/buildcast"),
            build_timeout_secs: 1800,
            placeholder_delay_ms: 0,
        }
    }
}

impl ServerConfig {
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            record_ttl: Duration::from_secs(self.record_ttl_days.saturating_mul(24 * 60 * 60)),
            download_ttl: Duration::from_secs(self.download_ttl_hours.saturating_mul(60 * 60)),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.upload_attempts.max(1),
            base_delay: Duration::from_millis(self.upload_backoff_ms),
        }
    }

    /// Object store credentials, if an endpoint is configured.
    pub fn s3_credentials(&self) -> Result<Option<Credentials>> {
        let Some(endpoint) = &self.s3_endpoint else {
            return Ok(None);
        };
        let access_key = self
            .s3_access_key
            .clone()
            .context("--s3-access-key is required with --s3-endpoint")?;
        let secret_key = self
            .s3_secret_key
            .clone()
            .context("--s3-secret-key is required with --s3-endpoint")?;
        Ok(Some(Credentials {
            endpoint: endpoint.clone(),
            bucket: self.s3_bucket.clone(),
            access_key,
            secret_key,
            region: self.s3_region.clone(),
        }))
    }
}

/// Contents of `--build-config`:
///
/// ```toml
/// timeout_secs = 900
/// workspace = "/var/lib/buildcast"
///
/// [commands]
/// android = "./gradlew assembleRelease && cp app/release.apk \"$BUILDCAST_OUTPUT\""
/// h5 = "npm ci && npm run build && zip -r \"$BUILDCAST_OUTPUT\" dist"
/// ```
#[derive(Debug, Default, Deserialize)]
pub struct BuildCommandFile {
    pub timeout_secs: Option<u64>,
    pub workspace: Option<PathBuf>,
    #[serde(default)]
    pub commands: BTreeMap<String, String>,
}

impl BuildCommandFile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read build config {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid build config {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Commands keyed by platform; unknown platform names are an error.
    pub fn platform_commands(&self) -> Result<BTreeMap<Platform, String>> {
        self.commands
            .iter()
            .map(|(name, cmd)| {
                let platform: Platform = name.parse()?;
                Ok::<_, anyhow::Error>((platform, cmd.clone()))
            })
            .collect()
    }
}

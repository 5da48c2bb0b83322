//! Artifact upload with bounded retry, and the object store port behind it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use percent_encoding::{utf8_percent_encode, CONTROLS};

use super::presign::{self, Credentials, HttpMethod, PresignError};
use super::types::{Platform, PlatformConfig};

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Object store unreachable: {0}")]
    Transport(String),
    #[error("Object store rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error(transparent)]
    Presign(#[from] PresignError),
    #[error("Upload failed after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: Box<UploadError>,
    },
}

/// S3-style object storage.
pub trait ObjectStore: Send + Sync {
    fn put_object<'a>(
        &'a self,
        key: &'a str,
        body: &'a [u8],
        content_type: &'a str,
        metadata: &'a BTreeMap<String, String>,
    ) -> BoxFuture<'a, Result<(), UploadError>>;

    fn object_exists<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool, UploadError>>;

    /// A URL that lets anyone holding it fetch `key` until `expires` elapses.
    fn presign_get(&self, key: &str, expires: Duration) -> Result<String, UploadError>;
}

/// Deterministic location of a platform's artifact; retries overwrite.
pub fn object_key(job_id: &str, platform: Platform) -> String {
    format!("{job_id}/{platform}/app.{}", platform.extension())
}

/// Object metadata recorded next to each artifact.
pub fn artifact_metadata(
    job_id: &str,
    platform: Platform,
    built_at: DateTime<Utc>,
    config: &PlatformConfig,
) -> BTreeMap<String, String> {
    let mut meta = BTreeMap::new();
    meta.insert("build-id".to_string(), job_id.to_string());
    meta.insert("platform".to_string(), platform.to_string());
    meta.insert("build-time".to_string(), built_at.to_rfc3339());
    meta.insert(
        "content-disposition".to_string(),
        format!("attachment; filename=\"app.{}\"", platform.extension()),
    );
    for (key, value) in config {
        let value = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        meta.insert(format!("config-{key}"), value);
    }
    meta
}

// ─── Retry ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Wait before the second attempt; doubles for each one after.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Sleep before attempt `attempt` (1-based): nothing, base, 2·base, 4·base, ...
    ///
    /// With the default 1s base this waits 1s then 2s between three attempts.
    /// A schedule of 2s then 4s (`2^(n-1)` seconds before attempt `n`) is the
    /// same curve with a 2s base; set `base_delay` to get it.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 2).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

pub struct ArtifactUploader {
    store: Arc<dyn ObjectStore>,
    policy: RetryPolicy,
}

impl ArtifactUploader {
    pub fn new(store: Arc<dyn ObjectStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Upload `body` under `key`, retrying per the policy. Returns the key.
    pub async fn upload(
        &self,
        key: &str,
        body: &[u8],
        content_type: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<String, UploadError> {
        let attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let delay = self.policy.delay_before(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            match self.store.put_object(key, body, content_type, metadata).await {
                Ok(()) => {
                    tracing::debug!(key, attempt, size = body.len(), "Artifact uploaded");
                    return Ok(key.to_string());
                }
                Err(e) if attempt < attempts => {
                    tracing::warn!(key, attempt, error = %e, "Artifact upload failed, retrying");
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(key, attempts, error = %e, "Artifact upload failed");
                    return Err(UploadError::Exhausted {
                        attempts,
                        last: Box::new(e),
                    });
                }
            }
        }
    }
}

// ─── S3-compatible store ─────────────────────────────────────────────────────

/// Validity of the presigned URLs the server itself uses.
const INTERNAL_URL_TTL: Duration = Duration::from_secs(15 * 60);

/// Talks to an S3/MinIO endpoint through presigned URLs.
pub struct S3ObjectStore {
    http: reqwest::Client,
    creds: Credentials,
}

impl S3ObjectStore {
    pub fn new(creds: Credentials) -> Self {
        Self {
            http: reqwest::Client::new(),
            creds,
        }
    }

    fn url(
        &self,
        method: HttpMethod,
        key: &str,
        expires: Duration,
        headers: &BTreeMap<String, String>,
    ) -> Result<String, UploadError> {
        Ok(presign::presign(
            &self.creds,
            method,
            key,
            expires,
            Utc::now(),
            headers,
        )?)
    }
}

/// Headers sent with an artifact PUT, all of which get signed.
///
/// Metadata goes out as `x-amz-meta-*` except `content-disposition`, which S3
/// stores as a system header. Values are canonicalized and non-ASCII bytes
/// percent-encoded so the bytes on the wire match the signature.
pub fn put_headers(
    content_type: &str,
    metadata: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    headers.insert("content-type".to_string(), content_type.to_string());
    for (name, value) in metadata {
        let name: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' {
                    c.to_ascii_lowercase()
                } else {
                    '-'
                }
            })
            .collect();
        let name = if name == "content-disposition" {
            name
        } else {
            format!("x-amz-meta-{name}")
        };
        let value = utf8_percent_encode(value, CONTROLS).to_string();
        headers.insert(name, presign::canonical_header_value(&value));
    }
    headers
}

async fn rejected(resp: reqwest::Response) -> UploadError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    UploadError::Rejected {
        status,
        body: body.chars().take(512).collect(),
    }
}

impl ObjectStore for S3ObjectStore {
    fn put_object<'a>(
        &'a self,
        key: &'a str,
        body: &'a [u8],
        content_type: &'a str,
        metadata: &'a BTreeMap<String, String>,
    ) -> BoxFuture<'a, Result<(), UploadError>> {
        Box::pin(async move {
            let headers = put_headers(content_type, metadata);
            let url = self.url(HttpMethod::Put, key, INTERNAL_URL_TTL, &headers)?;
            let mut req = self.http.put(&url).body(body.to_vec());
            for (name, value) in &headers {
                req = req.header(name.as_str(), value.as_str());
            }
            let resp = req
                .send()
                .await
                .map_err(|e| UploadError::Transport(e.to_string()))?;
            if !resp.status().is_success() {
                return Err(rejected(resp).await);
            }
            Ok(())
        })
    }

    fn object_exists<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool, UploadError>> {
        Box::pin(async move {
            let url = self.url(HttpMethod::Head, key, INTERNAL_URL_TTL, &BTreeMap::new())?;
            let resp = self
                .http
                .head(&url)
                .send()
                .await
                .map_err(|e| UploadError::Transport(e.to_string()))?;
            match resp.status() {
                s if s.is_success() => Ok(true),
                reqwest::StatusCode::NOT_FOUND => Ok(false),
                _ => Err(rejected(resp).await),
            }
        })
    }

    fn presign_get(&self, key: &str, expires: Duration) -> Result<String, UploadError> {
        self.url(HttpMethod::Get, key, expires, &BTreeMap::new())
    }
}

// ─── In-process store ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub body: Vec<u8>,
    pub content_type: String,
    pub metadata: BTreeMap<String, String>,
}

/// Keeps objects in memory. Used when no object store endpoint is configured.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, StoredObject>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.objects.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }
}

impl ObjectStore for MemoryObjectStore {
    fn put_object<'a>(
        &'a self,
        key: &'a str,
        body: &'a [u8],
        content_type: &'a str,
        metadata: &'a BTreeMap<String, String>,
    ) -> BoxFuture<'a, Result<(), UploadError>> {
        Box::pin(async move {
            self.objects.lock().insert(
                key.to_string(),
                StoredObject {
                    body: body.to_vec(),
                    content_type: content_type.to_string(),
                    metadata: metadata.clone(),
                },
            );
            Ok(())
        })
    }

    fn object_exists<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool, UploadError>> {
        Box::pin(async move { Ok(self.objects.lock().contains_key(key)) })
    }

    fn presign_get(&self, key: &str, expires: Duration) -> Result<String, UploadError> {
        Ok(format!("memory:///{key}?expires={}", expires.as_secs()))
    }
}

//! SigV4 query-string signing for S3-compatible object stores.
//!
//! Artifacts are uploaded and served through presigned URLs so neither the
//! server's HTTP client nor downloading clients need credentials headers.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha2::{Digest, Sha256};

/// Unreserved characters per RFC 3986 stay as-is, everything else is escaped.
const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

const PATH: &AsciiSet = &QUERY_VALUE.remove(b'/');

/// Longest validity S3 accepts for a presigned URL.
pub const MAX_EXPIRY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

const SERVICE: &str = "s3";

const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Put,
    Head,
}

impl HttpMethod {
    fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Put => "PUT",
            HttpMethod::Head => "HEAD",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PresignError {
    #[error("Object store credentials are not configured")]
    MissingCredentials,
    #[error("Bucket name is empty")]
    InvalidBucket,
    #[error("Object key is empty")]
    InvalidKey,
    #[error("Invalid object store endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("Signing failed: {0}")]
    Signing(String),
}

/// Where and as whom to sign.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub endpoint: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
}

/// Build a path-style presigned URL for `key`.
///
/// `headers` are signed alongside `host`; the request must then send each of
/// them with exactly the given value. Names are matched case-insensitively.
/// `expires` is capped at [`MAX_EXPIRY`].
pub fn presign(
    creds: &Credentials,
    method: HttpMethod,
    key: &str,
    expires: Duration,
    now: DateTime<Utc>,
    headers: &BTreeMap<String, String>,
) -> Result<String, PresignError> {
    if creds.access_key.is_empty() || creds.secret_key.is_empty() {
        return Err(PresignError::MissingCredentials);
    }
    if creds.bucket.is_empty() {
        return Err(PresignError::InvalidBucket);
    }
    let key = key.trim_start_matches('/');
    if key.is_empty() {
        return Err(PresignError::InvalidKey);
    }

    let endpoint = creds.endpoint.trim_end_matches('/');
    let host = host_of(endpoint)?;
    let date = now.format("%Y%m%d").to_string();
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let scope = format!("{date}/{}/{SERVICE}/aws4_request", creds.region);
    let expires_secs = expires.min(MAX_EXPIRY).as_secs();

    let path = format!("/{}/{}", creds.bucket, key);
    let canonical_uri = utf8_percent_encode(&path, PATH).to_string();

    let mut signed: BTreeMap<String, String> = headers
        .iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), canonical_header_value(value)))
        .collect();
    signed.insert("host".to_string(), host);
    let signed_names = signed.keys().cloned().collect::<Vec<_>>().join(";");
    let canonical_headers: String = signed
        .iter()
        .map(|(name, value)| format!("{name}:{value}\n"))
        .collect();

    let mut query = BTreeMap::new();
    query.insert("X-Amz-Algorithm", "AWS4-HMAC-SHA256".to_string());
    query.insert("X-Amz-Credential", format!("{}/{scope}", creds.access_key));
    query.insert("X-Amz-Date", amz_date.clone());
    query.insert("X-Amz-Expires", expires_secs.to_string());
    query.insert("X-Amz-SignedHeaders", signed_names.clone());
    let canonical_query = query
        .iter()
        .map(|(k, v)| format!("{}={}", encode_value(k), encode_value(v)))
        .collect::<Vec<_>>()
        .join("&");

    let canonical_request = format!(
        "{}\n{canonical_uri}\n{canonical_query}\n{canonical_headers}\n{signed_names}\n{}",
        method.as_str(),
        UNSIGNED_PAYLOAD
    );
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );
    let signature = signature(&creds.secret_key, &date, &creds.region, &string_to_sign)?;

    Ok(format!(
        "{endpoint}{canonical_uri}?{canonical_query}&X-Amz-Signature={signature}"
    ))
}

/// Header value as SigV4 canonicalizes it: trimmed, inner whitespace runs
/// collapsed to one space.
pub fn canonical_header_value(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn encode_value(value: &str) -> String {
    utf8_percent_encode(value, QUERY_VALUE).to_string()
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, PresignError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key)
        .map_err(|e| PresignError::Signing(e.to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn signature(
    secret_key: &str,
    date: &str,
    region: &str,
    string_to_sign: &str,
) -> Result<String, PresignError> {
    let k_date = hmac_sha256(format!("AWS4{secret_key}").as_bytes(), date.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, SERVICE.as_bytes())?;
    let k_signing = hmac_sha256(&k_service, b"aws4_request")?;
    Ok(hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes())?))
}

/// `host[:port]` as it appears in the Host header.
fn host_of(endpoint: &str) -> Result<String, PresignError> {
    let url = url::Url::parse(endpoint)
        .map_err(|e| PresignError::InvalidEndpoint(format!("{endpoint}: {e}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| PresignError::InvalidEndpoint(endpoint.to_string()))?;
    Ok(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

//! HTTP API for publish jobs.
//!
//! Endpoints:
//! - `POST /api/v1/publish`: create a job
//! - `GET /api/v1/publish/{job_id}`: poll status
//! - `DELETE /api/v1/publish/{job_id}`: remove the record
//! - `POST /api/v1/publish/{job_id}/cancel`: cooperative cancel
//! - `GET /api/v1/publish/{job_id}/download/{platform}`: time-limited artifact URL
//! - `GET /api/v1/publish/{job_id}/qrcode/{platform}`: the same URL as a PNG QR code
//! - `GET /api/v1/health`

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use crate::jobid;
use crate::publish::qr::{self, DOWNLOAD_QR_SIZE};
use crate::publish::{BuildStatus, Platform, PublishError, PublishRequest};
use crate::server::SharedState;

/// Build the axum router.
pub fn router(state: Arc<SharedState>) -> Router {
    Router::new()
        .route("/api/v1/health", get(api_health))
        .route("/api/v1/publish", post(create_publish))
        .route(
            "/api/v1/publish/{job_id}",
            get(get_publish).delete(delete_publish),
        )
        .route("/api/v1/publish/{job_id}/cancel", post(cancel_publish))
        .route(
            "/api/v1/publish/{job_id}/download/{platform}",
            get(download_artifact),
        )
        .route(
            "/api/v1/publish/{job_id}/qrcode/{platform}",
            get(download_qrcode),
        )
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
                .allow_headers([header::CONTENT_TYPE]),
        )
        .with_state(state)
}

// ─── Request/Response Types ──────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreatedResponse {
    job_id: String,
    platforms: Vec<Platform>,
    status: BuildStatus,
    estimated_minutes: u32,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    service: &'static str,
    active_jobs: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    stored_jobs: Option<usize>,
    uptime_secs: u64,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(e: PublishError) -> Response {
    let status = match &e {
        PublishError::Validation(_) => StatusCode::BAD_REQUEST,
        PublishError::NotFound(_) | PublishError::ArtifactMissing { .. } => StatusCode::NOT_FOUND,
        PublishError::NotReady { .. } => StatusCode::CONFLICT,
        PublishError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        PublishError::Upload(_) => StatusCode::BAD_GATEWAY,
    };
    if status.is_server_error() {
        tracing::error!(error = %e, "Publish request failed");
    }
    (status, Json(ErrorBody { error: e.to_string() })).into_response()
}

/// Ids that cannot have been issued are answered without a store lookup.
fn check_job_id(job_id: &str) -> Result<(), PublishError> {
    if jobid::is_valid(job_id) {
        Ok(())
    } else {
        Err(PublishError::NotFound(job_id.to_string()))
    }
}

// ─── Handlers ────────────────────────────────────────────────────────────────

async fn api_health(State(state): State<Arc<SharedState>>) -> impl IntoResponse {
    Json(HealthResponse {
        service: "buildcast",
        active_jobs: state.orchestrator.active_jobs(),
        stored_jobs: state.orchestrator.job_count().ok(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

async fn create_publish(
    State(state): State<Arc<SharedState>>,
    Json(request): Json<PublishRequest>,
) -> impl IntoResponse {
    match state.orchestrator.create_job(request) {
        Ok(job) => (
            StatusCode::CREATED,
            Json(CreatedResponse {
                job_id: job.job_id,
                platforms: job.platforms,
                status: job.status,
                estimated_minutes: job.estimated_minutes,
                created_at: job.created_at,
            }),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_publish(
    State(state): State<Arc<SharedState>>,
    Path(job_id): Path<String>,
) -> impl IntoResponse {
    let result = check_job_id(&job_id).and_then(|()| state.orchestrator.get_status(&job_id));
    match result {
        Ok(job) => Json(job).into_response(),
        Err(e) => error_response(e),
    }
}

async fn delete_publish(
    State(state): State<Arc<SharedState>>,
    Path(job_id): Path<String>,
) -> impl IntoResponse {
    let result = check_job_id(&job_id).and_then(|()| state.orchestrator.delete_job(&job_id));
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

async fn cancel_publish(
    State(state): State<Arc<SharedState>>,
    Path(job_id): Path<String>,
) -> impl IntoResponse {
    let result = check_job_id(&job_id).and_then(|()| state.orchestrator.cancel_job(&job_id));
    match result {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => error_response(e),
    }
}

async fn download_artifact(
    State(state): State<Arc<SharedState>>,
    Path((job_id, platform)): Path<(String, String)>,
) -> impl IntoResponse {
    if let Err(e) = check_job_id(&job_id) {
        return error_response(e);
    }
    match state.orchestrator.download_url(&job_id, &platform).await {
        Ok(link) => Json(link).into_response(),
        Err(e) => error_response(e),
    }
}

async fn download_qrcode(
    State(state): State<Arc<SharedState>>,
    Path((job_id, platform)): Path<(String, String)>,
) -> Response {
    if let Err(e) = check_job_id(&job_id) {
        return error_response(e);
    }
    let link = match state.orchestrator.download_url(&job_id, &platform).await {
        Ok(link) => link,
        Err(e) => return error_response(e),
    };
    match qr::render_png(&link.url, DOWNLOAD_QR_SIZE) {
        Ok(png) => {
            tracing::info!(%job_id, %platform, size = png.len(), "Download QR code issued");
            (
                [
                    (header::CONTENT_TYPE, "image/png"),
                    (header::CACHE_CONTROL, "max-age=3600"),
                ],
                png,
            )
                .into_response()
        }
        Err(e) => {
            tracing::error!(%job_id, %platform, error = %e, "QR code rendering failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody {
                    error: e.to_string(),
                }),
            )
                .into_response()
        }
    }
}

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Extension, Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{json_body, required};
use crate::errors::AppError;
use crate::middleware::auth::AuthenticatedSubject;
use crate::middleware::metrics::METRICS;
use crate::queue::{JobStatus, RelayJob};
use crate::AppState;

// ── Request / Response DTOs ──────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub encrypted_payload: Option<String>,
    pub target_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub job_id: Uuid,
}

/// Job record as shown to its owner. The payload is never echoed back.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub attempts: u32,
    pub target_url: String,
    pub enqueued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl From<RelayJob> for JobStatusResponse {
    fn from(job: RelayJob) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            attempts: job.attempts,
            target_url: job.target_url,
            enqueued_at: job.enqueued_at,
            updated_at: job.updated_at,
            last_error: job.last_error,
        }
    }
}

#[derive(Deserialize)]
pub struct EncryptRequest {
    pub data: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptResponse {
    pub encrypted_payload: String,
}

// ── Handlers ─────────────────────────────────────────────────

/// Accept a relay job for the authenticated subject. Delivery happens later.
pub async fn submit(
    State(state): State<Arc<AppState>>,
    Extension(AuthenticatedSubject(subject_id)): Extension<AuthenticatedSubject>,
    body: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmitResponse>), AppError> {
    let req = json_body(body)?;
    let encrypted_payload = required(req.encrypted_payload, "encryptedPayload")?;
    let target_url = required(req.target_url, "targetUrl")?;
    validate_target_url(&target_url)?;

    let job = RelayJob::new(encrypted_payload, subject_id, target_url);
    state.queue.enqueue(&job).await?;
    METRICS.job_submitted();

    tracing::info!(job_id = %job.id, subject_id = %job.subject_id, "relay job accepted");
    Ok((StatusCode::ACCEPTED, Json(SubmitResponse { job_id: job.id })))
}

/// Status of one of the caller's jobs. Other subjects' jobs are reported as
/// missing so their ids can't be probed.
pub async fn job_status(
    State(state): State<Arc<AppState>>,
    Extension(AuthenticatedSubject(subject_id)): Extension<AuthenticatedSubject>,
    Path(id): Path<String>,
) -> Result<Json<JobStatusResponse>, AppError> {
    let id = Uuid::parse_str(&id).map_err(|_| AppError::NotFound)?;
    match state.queue.get(id).await? {
        Some(job) if job.subject_id == subject_id => Ok(Json(job.into())),
        _ => Err(AppError::NotFound),
    }
}

/// Seal `data` with the active data key.
pub async fn encrypt(
    State(state): State<Arc<AppState>>,
    body: Result<Json<EncryptRequest>, JsonRejection>,
) -> Result<Json<EncryptResponse>, AppError> {
    let data = json_body(body)?
        .data
        .ok_or_else(|| AppError::Validation("data is required".into()))?;

    let encrypted_payload = state
        .keyring
        .encrypt(data.as_bytes())
        .map_err(anyhow::Error::from)?;
    Ok(Json(EncryptResponse { encrypted_payload }))
}

fn validate_target_url(raw: &str) -> Result<(), AppError> {
    let parsed = url::Url::parse(raw)
        .map_err(|_| AppError::Validation("targetUrl must be an absolute URL".into()))?;
    match parsed.scheme() {
        "http" | "https" if parsed.host().is_some() => Ok(()),
        _ => Err(AppError::Validation(
            "targetUrl must be an http or https URL".into(),
        )),
    }
}

//! Login, refresh, logout, and whoami.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    Extension, Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{json_body, required};
use crate::errors::AppError;
use crate::middleware::auth::AuthenticatedSubject;
use crate::store::RefreshRecord;
use crate::AppState;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub subject_id: Option<String>,
    pub secret: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub access_token: String,
    pub refresh_token: String,
    /// When the access credential expires.
    pub expires_at: DateTime<Utc>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub refresh_token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeResponse {
    pub subject_id: String,
}

pub async fn login(
    State(state): State<Arc<AppState>>,
    body: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<LoginResponse>, AppError> {
    let req = json_body(body)?;
    let subject_id = required(req.subject_id, "subjectId")?;
    // Secrets are compared as given, whitespace included.
    let secret = req
        .secret
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::Validation("secret is required".into()))?;

    if !state.store.verify_subject(&subject_id, &secret).await? {
        tracing::info!(subject_id = %subject_id, "login rejected");
        return Err(AppError::Unauthorized);
    }

    let access = state.credentials.issue(&subject_id).map_err(anyhow::Error::from)?;
    let refresh = state.credentials.issue_refresh();
    state
        .store
        .put_refresh(
            &refresh.token,
            &RefreshRecord {
                subject_id: subject_id.clone(),
                expires_at: refresh.expires_at,
            },
        )
        .await?;

    tracing::info!(subject_id = %subject_id, "login succeeded");
    Ok(Json(LoginResponse {
        access_token: access.token,
        refresh_token: refresh.token,
        expires_at: access.expires_at,
    }))
}

pub async fn refresh(
    State(state): State<Arc<AppState>>,
    body: Result<Json<RefreshRequest>, JsonRejection>,
) -> Result<Json<RefreshResponse>, AppError> {
    let token = required(json_body(body)?.refresh_token, "refreshToken")?;

    let Some(record) = state.store.get_refresh(&token).await? else {
        tracing::debug!("refresh token unknown, revoked, or expired");
        return Err(AppError::Unauthorized);
    };

    let access = state
        .credentials
        .issue(&record.subject_id)
        .map_err(anyhow::Error::from)?;

    Ok(Json(RefreshResponse {
        access_token: access.token,
        expires_at: access.expires_at,
    }))
}

/// Revoke a refresh token. Succeeds whether or not the token existed.
pub async fn logout(
    State(state): State<Arc<AppState>>,
    body: Result<Json<RefreshRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, AppError> {
    let token = required(json_body(body)?.refresh_token, "refreshToken")?;
    let removed = state.store.delete_refresh(&token).await?;
    tracing::debug!(removed, "logout");
    Ok(Json(serde_json::json!({ "message": "logged out" })))
}

pub async fn me(
    Extension(AuthenticatedSubject(subject_id)): Extension<AuthenticatedSubject>,
) -> Json<MeResponse> {
    Json(MeResponse { subject_id })
}

//! AuthGate: bearer credential check for protected routes.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};

use crate::errors::AppError;
use crate::AppState;

/// The subject proven by the request's credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedSubject(pub String);

/// Reject the request with the generic 401 unless it carries a valid
/// `Authorization: Bearer <credential>`; otherwise attach the subject.
pub async fn require_credential(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token);

    let Some(token) = token else {
        tracing::debug!("auth gate: missing or malformed authorization header");
        return Err(AppError::Unauthorized);
    };

    let subject = state.credentials.verify_subject(token).map_err(|e| {
        tracing::debug!(reason = %e, "auth gate: credential rejected");
        AppError::Unauthorized
    })?;

    req.extensions_mut().insert(AuthenticatedSubject(subject));
    Ok(next.run(req).await)
}

fn bearer_token(header: &str) -> Option<&str> {
    header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

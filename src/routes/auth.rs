use axum::{
    extract::{Request, State},
    http::{HeaderMap, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use subtle::ConstantTimeEq;

use crate::AppState;
use crate::error::BrokerError;

/// Extract API key from Authorization: Bearer header
fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Check the bearer token against the configured key. No configured key allows everything.
pub fn verify_api_key(headers: &HeaderMap, expected: Option<&str>) -> Result<(), BrokerError> {
    let Some(expected) = expected else {
        return Ok(());
    };

    let provided = extract_bearer_token(headers).ok_or(BrokerError::MissingApiKey)?;

    // Constant-time comparison to prevent timing attacks
    if provided.as_bytes().ct_eq(expected.as_bytes()).into() {
        Ok(())
    } else {
        Err(BrokerError::InvalidApiKey)
    }
}

/// Middleware guarding the /api routes
pub async fn api_key_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    match verify_api_key(request.headers(), state.api_key.as_deref()) {
        Ok(()) => next.run(request).await,
        Err(err) => err.into_response(),
    }
}

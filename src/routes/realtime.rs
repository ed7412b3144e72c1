use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
    http::header,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

use super::{ErrorResponse, UsageInfo, UsageLimitErrorResponse};
use crate::AppState;
use crate::error::BrokerError;
use crate::identity::ClientIdentity;

const DEFAULT_MODE_ID: &str = "devils-advocate";

fn default_mode_id() -> String {
    DEFAULT_MODE_ID.to_string()
}

#[derive(Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionCreateRequest {
    /// SDP offer from the client's WebRTC peer connection
    pub sdp: String,
    /// Conversation mode selected by the client
    #[serde(default = "default_mode_id")]
    pub mode_id: String,
}

/// Open a realtime voice session for the calling client
///
/// Admission is checked before anything is sent upstream. The SDP offer is
/// forwarded unmodified and the upstream SDP answer is returned as-is.
#[utoipa::path(
    post,
    path = "/realtime/session",
    tag = "realtime",
    request_body = SessionCreateRequest,
    responses(
        (status = 200, description = "SDP answer", content_type = "application/sdp", body = String),
        (status = 400, body = ErrorResponse),
        (status = 429, body = UsageLimitErrorResponse, description = "Token limit reached"),
        (status = 502, body = ErrorResponse),
        (status = 503, body = ErrorResponse),
    )
)]
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    ClientIdentity(client_key): ClientIdentity,
    payload: Result<Json<SessionCreateRequest>, JsonRejection>,
) -> Result<Response, BrokerError> {
    let Json(body) = payload?;
    if body.sdp.trim().is_empty() {
        return Err(BrokerError::InvalidRequest("sdp must not be empty".into()));
    }

    let (allowed, usage) = state.tracker.check_limit(&client_key).await?;
    if !allowed {
        return Err(BrokerError::UsageLimitExceeded(Box::new(UsageInfo::from(
            &usage,
        ))));
    }

    tracing::info!(
        "Creating realtime session for {client_key} (mode {})",
        body.mode_id
    );

    let response = state.realtime.create_session(&body.sdp).await?;

    if !response.status().is_success() {
        let status = response.status();
        let text: String = response.text().await.unwrap_or_default();
        tracing::warn!("Realtime API rejected session for {client_key}: {status}");
        return Ok((status, text).into_response());
    }

    let answer = response
        .text()
        .await
        .map_err(|e| BrokerError::Upstream(format!("Failed to read SDP answer: {e}")))?;

    Ok(([(header::CONTENT_TYPE, "application/sdp")], answer).into_response())
}

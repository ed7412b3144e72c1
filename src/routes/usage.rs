use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
};
use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

use super::ErrorResponse;
use crate::AppState;
use crate::error::BrokerError;
use crate::identity::ClientIdentity;
use crate::tracker::UsageSnapshot;

// --- Types ---

/// Usage for the calling client in the current reset window
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UsageInfo {
    /// Tokens used in the current reset period
    pub period_tokens: u64,
    /// Tokens used across all time
    pub total_tokens: u64,
    /// Maximum tokens allowed per reset period
    pub token_limit: u64,
    /// Tokens remaining in the current period
    pub tokens_remaining: u64,
    /// ISO-8601 instant when the period resets
    pub reset_at: String,
    /// Whether usage has reached the limit
    pub limit_exceeded: bool,
}

impl From<&UsageSnapshot> for UsageInfo {
    fn from(snapshot: &UsageSnapshot) -> Self {
        Self {
            period_tokens: snapshot.period_tokens,
            total_tokens: snapshot.total_tokens,
            token_limit: snapshot.token_limit,
            tokens_remaining: snapshot.tokens_remaining,
            reset_at: snapshot
                .reset_at
                .to_rfc3339_opts(SecondsFormat::Millis, true),
            limit_exceeded: snapshot.limit_exceeded(),
        }
    }
}

#[derive(Deserialize, Serialize, ToSchema)]
pub struct UsageReportRequest {
    /// Tokens consumed (must be > 0)
    #[serde(alias = "tokens")]
    pub amount: i64,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct UsageReportResponse {
    pub success: bool,
    pub usage: UsageInfo,
}

// --- Handlers ---

/// Get token usage for the calling client
#[utoipa::path(
    get,
    path = "/usage",
    tag = "usage",
    responses(
        (status = 200, body = UsageInfo),
        (status = 401, body = ErrorResponse),
        (status = 403, body = ErrorResponse),
        (status = 503, body = ErrorResponse),
    )
)]
pub async fn get_usage(
    State(state): State<Arc<AppState>>,
    ClientIdentity(client_key): ClientIdentity,
) -> Result<Json<UsageInfo>, BrokerError> {
    let usage = state.tracker.get_usage(&client_key).await?;
    Ok(Json(UsageInfo::from(&usage)))
}

/// Report tokens consumed by the calling client
///
/// The returned usage is read after the increment; `limitExceeded` signals
/// that the client should end its session.
#[utoipa::path(
    post,
    path = "/usage/report",
    tag = "usage",
    request_body = UsageReportRequest,
    responses(
        (status = 200, body = UsageReportResponse),
        (status = 400, body = ErrorResponse),
        (status = 401, body = ErrorResponse),
        (status = 403, body = ErrorResponse),
        (status = 503, body = ErrorResponse),
    )
)]
pub async fn report_usage(
    State(state): State<Arc<AppState>>,
    ClientIdentity(client_key): ClientIdentity,
    payload: Result<Json<UsageReportRequest>, JsonRejection>,
) -> Result<Json<UsageReportResponse>, BrokerError> {
    let Json(body) = payload?;
    let amount = u64::try_from(body.amount)
        .ok()
        .filter(|&a| a > 0)
        .ok_or_else(|| BrokerError::InvalidRequest("amount must be greater than 0".into()))?;

    state.tracker.add_tokens(&client_key, amount).await?;
    let usage = state.tracker.get_usage(&client_key).await?;

    if usage.limit_exceeded() {
        tracing::info!(
            "Client {client_key} reached its token limit ({}/{})",
            usage.period_tokens,
            usage.token_limit
        );
    }

    Ok(Json(UsageReportResponse {
        success: true,
        usage: UsageInfo::from(&usage),
    }))
}

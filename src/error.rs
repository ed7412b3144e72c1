use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::routes::{ErrorResponse, UsageInfo, UsageLimitErrorResponse};
use crate::storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Usage storage unavailable: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Missing API key. Provide an Authorization header with a Bearer token.")]
    MissingApiKey,

    #[error("Invalid API key")]
    InvalidApiKey,

    #[error("Token usage limit exceeded")]
    UsageLimitExceeded(Box<UsageInfo>),

    #[error("Realtime API is not configured")]
    UpstreamNotConfigured,

    #[error("Realtime API error: {0}")]
    Upstream(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Malformed bodies get the same JSON error shape as every other client error
impl From<JsonRejection> for BrokerError {
    fn from(rejection: JsonRejection) -> Self {
        BrokerError::InvalidRequest(rejection.body_text())
    }
}

impl BrokerError {
    pub fn status(&self) -> StatusCode {
        match self {
            BrokerError::Storage(_) | BrokerError::UpstreamNotConfigured => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            BrokerError::Config(_) | BrokerError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            BrokerError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            BrokerError::MissingApiKey => StatusCode::UNAUTHORIZED,
            BrokerError::InvalidApiKey => StatusCode::FORBIDDEN,
            BrokerError::UsageLimitExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            BrokerError::Upstream(_) | BrokerError::Network(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        let status = self.status();

        if status.is_server_error() {
            tracing::error!("{self}");
        }

        match self {
            BrokerError::UsageLimitExceeded(usage) => {
                let body = UsageLimitErrorResponse {
                    error: "usage_limit_exceeded".into(),
                    message: format!(
                        "Token limit of {} reached. Usage resets at {}.",
                        usage.token_limit, usage.reset_at
                    ),
                    usage: *usage,
                };
                (status, Json(body)).into_response()
            }
            // Storage details stay in the log
            BrokerError::Storage(_) => (
                status,
                Json(ErrorResponse {
                    error: "Usage storage unavailable".into(),
                }),
            )
                .into_response(),
            other => (
                status,
                Json(ErrorResponse {
                    error: other.to_string(),
                }),
            )
                .into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            BrokerError::Storage(StorageError::Closed).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            BrokerError::InvalidRequest("amount".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(BrokerError::MissingApiKey.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(BrokerError::InvalidApiKey.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            BrokerError::Upstream("boom".into()).status(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[tokio::test]
    async fn test_storage_error_body_hides_details() {
        let response =
            BrokerError::Storage(StorageError::Query("secret host".into())).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "Usage storage unavailable");
    }
}

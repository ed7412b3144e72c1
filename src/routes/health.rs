use axum::response::Json;
use serde::Serialize;
use serde_json::{Value, json};

use crate::{BUILD_TIME, GIT_HASH, SERVICE_NAME, VERSION};

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
}

/// Liveness only; storage is not consulted.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: SERVICE_NAME,
    })
}

pub async fn version() -> Json<Value> {
    Json(json!({
        "version": VERSION,
        "git_hash": GIT_HASH,
        "build_time": BUILD_TIME,
    }))
}

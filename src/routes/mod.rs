mod auth;
mod health;
mod realtime;
mod usage;

// Glob re-exports so utoipa's `routes!()` macro can find the hidden `__path_*` structs
// alongside the handler functions at the `crate::routes::*` path.
pub use realtime::*;
pub use usage::*;

use axum::{Router, middleware, routing::get};
use serde::Serialize;
use std::sync::Arc;
use utoipa::ToSchema;
use utoipa_axum::{router::OpenApiRouter, routes};
use utoipa_swagger_ui::SwaggerUi;

use crate::AppState;

// --- Shared response types ---

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
}

/// Body of a 429 returned when admission is denied
#[derive(Serialize, ToSchema)]
pub struct UsageLimitErrorResponse {
    pub error: String,
    pub message: String,
    pub usage: UsageInfo,
}

/// Build the full application router: health, the key-protected `/api`
/// surface and Swagger UI.
pub fn router(state: Arc<AppState>) -> Router {
    let api = OpenApiRouter::new()
        .routes(routes!(get_usage))
        .routes(routes!(report_usage))
        .routes(routes!(create_session))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::api_key_middleware,
        ));

    let (api_router, openapi) = OpenApiRouter::with_openapi(Default::default())
        .nest("/api", api)
        .split_for_parts();

    // Swagger UI + OpenAPI spec (accessible without authentication)
    let swagger_routes =
        Router::new().merge(SwaggerUi::new("/swagger").url("/api-docs/openapi.json", openapi));

    Router::new()
        .route("/health", get(health::health))
        .route("/version", get(health::version))
        .merge(api_router)
        .merge(swagger_routes)
        .with_state(state)
}

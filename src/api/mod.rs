//! API layer -- axum routes, handlers, and middleware.

mod routes;
pub mod state;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde_json::json;

use self::state::AppState;

/// Build the application router with all API routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", routes::api_routes())
        .fallback(fallback)
        .with_state(state)
}

async fn fallback() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "not found")
}

/// Handler errors, rendered as `{ "error": { "code", "message" } }`.
#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    /// Privileged routes are off because no shared secret is configured.
    SecretNotConfigured,
    BadRequest(String),
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized", "invalid or missing shared secret".to_string()),
            ApiError::SecretNotConfigured => (
                StatusCode::SERVICE_UNAVAILABLE,
                "secret_not_configured",
                "no shared secret is configured for this agent".to_string(),
            ),
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, "bad_request", m),
            ApiError::Internal(e) => {
                tracing::error!(error = %format!("{e:#}"), "api request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal", format!("{e:#}"))
            }
        };
        (status, Json(json!({ "error": { "code": code, "message": message } }))).into_response()
    }
}

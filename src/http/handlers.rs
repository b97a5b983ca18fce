//! Request handlers served behind the admission middleware.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Extension, Json};
use serde::Serialize;
use serde_json::json;

use super::state::RateLimitState;
use crate::auth::Identity;
use crate::ratelimit::MetricsSnapshot;

/// Greets the caller if they are authenticated.
pub async fn protected_echo(identity: Option<Extension<Identity>>) -> impl IntoResponse {
    match identity {
        Some(Extension(identity)) if identity.authenticated => (
            StatusCode::OK,
            Json(json!({
                "message": format!("Hello {}, you're authenticated!", identity.display_name())
            })),
        ),
        _ => (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "detail": "Authentication credentials were not provided." })),
        ),
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub limiter: MetricsSnapshot,
}

/// Liveness plus limiter counters.
pub async fn health(State(state): State<RateLimitState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        limiter: state.limiter.metrics().snapshot(),
    })
}

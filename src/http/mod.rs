//! HTTP surface: admission middleware, handlers and server.

mod handlers;
mod middleware;
mod server;
mod state;

pub use handlers::{health, protected_echo, HealthResponse};
pub use middleware::{
    apply_quota_headers, rate_limit_middleware, rejection, RATE_LIMIT_DETAIL, X_RATELIMIT_LIMIT,
    X_RATELIMIT_REMAINING, X_RATELIMIT_RESET,
};
pub use server::HttpServer;
pub use state::RateLimitState;

use axum::{routing::get, Router};

/// Wrap any router so every request passes through admission control.
pub fn with_rate_limiting(router: Router, state: RateLimitState) -> Router {
    router.layer(axum::middleware::from_fn_with_state(
        state,
        rate_limit_middleware,
    ))
}

/// The service's own routes, rate limited.
pub fn router(state: RateLimitState) -> Router {
    let routes = Router::new()
        .route("/api/test", get(protected_echo))
        .route("/healthz", get(health))
        .with_state(state.clone());

    with_rate_limiting(routes, state)
}

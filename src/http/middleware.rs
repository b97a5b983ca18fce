//! Admission middleware: identity, policy, bucket, then the handler.

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::{debug, instrument};

use super::state::RateLimitState;
use crate::auth::resolve_identity;
use crate::ratelimit::{BucketKey, Decision};

/// Body detail of every 429 response.
pub const RATE_LIMIT_DETAIL: &str = "Rate limit exceeded. Try again later.";

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Rate limit every authenticated request.
///
/// Anonymous requests pass through untouched. Admitted requests run the
/// handler and get quota headers; rejected ones never reach it.
#[instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
pub async fn rate_limit_middleware(
    State(state): State<RateLimitState>,
    request: Request,
    next: Next,
) -> Response {
    let (mut parts, body) = request.into_parts();
    let identity = resolve_identity(
        state.identity.as_ref(),
        &mut parts.extensions,
        &parts.headers,
        state.limiter.metrics(),
    )
    .await;
    let request = Request::from_parts(parts, body);

    let Some(identity) = identity else {
        debug!("Anonymous request, not rate limited");
        return next.run(request).await;
    };

    let path = request.uri().path();
    let policy = state.rules.snapshot().resolve(path);
    let key = BucketKey::with_prefix(&state.key_prefix, &identity.id, path);

    let decision = state.limiter.evaluate(&key, &policy, state.clock.now()).await;

    if !decision.admitted {
        return rejection(&decision);
    }

    let mut response = next.run(request).await;
    apply_quota_headers(response.headers_mut(), &decision);
    response
}

/// Build the 429 response for a rejected request.
pub fn rejection(decision: &Decision) -> Response {
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({ "detail": RATE_LIMIT_DETAIL })),
    )
        .into_response();

    let headers = response.headers_mut();
    apply_quota_headers(headers, decision);
    headers.insert(
        header::RETRY_AFTER,
        HeaderValue::from(decision.retry_after_seconds),
    );
    response
}

/// Attach the `X-RateLimit-*` headers for a decision.
pub fn apply_quota_headers(headers: &mut HeaderMap, decision: &Decision) {
    if let Ok(limit) = HeaderValue::from_str(&format_limit(decision.limit)) {
        headers.insert(X_RATELIMIT_LIMIT, limit);
    }
    headers.insert(
        X_RATELIMIT_REMAINING,
        HeaderValue::from(decision.remaining_tokens),
    );
    headers.insert(
        X_RATELIMIT_RESET,
        HeaderValue::from(decision.retry_after_seconds),
    );
}

/// Whole capacities render without a fractional part.
fn format_limit(capacity: f64) -> String {
    if capacity.fract() == 0.0 {
        format!("{}", capacity as u64)
    } else {
        format!("{}", capacity)
    }
}

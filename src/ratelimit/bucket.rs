//! Token bucket state and refill arithmetic.
//!
//! Buckets refill lazily: nothing runs between requests, the elapsed time is
//! turned into tokens when the next request for the same key arrives.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use super::policy::{normalize_path, RateLimitPolicy};

/// Key prefix used when none is configured.
pub const DEFAULT_KEY_PREFIX: &str = "rate-limit";

/// Identifies the bucket for one identity on one resource.
///
/// Rendered as `{prefix}:{identity_id}:{resource_path}`. `%` and `:` inside
/// the identity id are percent-escaped, so the first unescaped `:` after the
/// prefix always separates id from path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey(String);

impl BucketKey {
    /// Build a key with the default prefix.
    pub fn new(identity_id: &str, resource_path: &str) -> Self {
        Self::with_prefix(DEFAULT_KEY_PREFIX, identity_id, resource_path)
    }

    /// Build a key with a custom prefix.
    pub fn with_prefix(prefix: &str, identity_id: &str, resource_path: &str) -> Self {
        Self(format!(
            "{}:{}:{}",
            prefix,
            escape_identity(identity_id),
            normalize_path(resource_path)
        ))
    }

    /// The store key.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn escape_identity(id: &str) -> String {
    let mut escaped = String::with_capacity(id.len());
    for c in id.chars() {
        match c {
            '%' => escaped.push_str("%25"),
            ':' => escaped.push_str("%3A"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Persisted state of one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    /// Tokens currently in the bucket; fractional progress is kept
    pub tokens: f64,
    /// Unix time (seconds) of the last refill
    pub last_refill_time: f64,
}

impl BucketState {
    /// A full bucket as of `now`.
    pub fn full(policy: &RateLimitPolicy, now: f64) -> Self {
        Self {
            tokens: policy.capacity,
            last_refill_time: now,
        }
    }

    /// Decode a stored value. Anything unreadable or out of range is `None`
    /// and the caller treats the bucket as absent.
    pub fn decode(raw: &str) -> Option<Self> {
        let state: BucketState = serde_json::from_str(raw).ok()?;
        let valid = state.tokens.is_finite()
            && state.tokens >= 0.0
            && state.last_refill_time.is_finite();
        valid.then_some(state)
    }

    /// Encode for storage.
    pub fn encode(&self) -> String {
        // Two finite f64 fields cannot fail to serialize.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    /// Whether the request may proceed
    pub admitted: bool,
    /// Bucket capacity, reported as the limit
    pub limit: f64,
    /// Whole tokens left after this request
    pub remaining_tokens: u64,
    /// Seconds until the next token; zero when admitted
    pub retry_after_seconds: u64,
}

impl Decision {
    /// An admission that reports an untouched, full bucket.
    pub fn full(policy: &RateLimitPolicy) -> Self {
        Self {
            admitted: true,
            limit: policy.capacity,
            remaining_tokens: policy.capacity.floor() as u64,
            retry_after_seconds: 0,
        }
    }

    /// A rejection with an empty bucket.
    pub fn empty(policy: &RateLimitPolicy) -> Self {
        Self {
            admitted: false,
            limit: policy.capacity,
            remaining_tokens: 0,
            retry_after_seconds: (1.0 / policy.refill_rate).ceil() as u64,
        }
    }
}

/// Refill the bucket up to `now` and try to take one token.
///
/// `state` of `None` is a bucket never seen before and starts full. The
/// returned state is what must be written back, whatever the decision.
pub fn take_token(
    state: Option<BucketState>,
    policy: &RateLimitPolicy,
    now: f64,
) -> (BucketState, Decision) {
    let state = state.unwrap_or_else(|| BucketState::full(policy, now));

    let elapsed = (now - state.last_refill_time).max(0.0);
    let refilled = elapsed * policy.refill_rate;
    let mut tokens = (state.tokens + refilled).clamp(0.0, policy.capacity);

    let decision = if tokens >= 1.0 {
        tokens -= 1.0;
        Decision {
            admitted: true,
            limit: policy.capacity,
            remaining_tokens: tokens.floor() as u64,
            retry_after_seconds: 0,
        }
    } else {
        Decision {
            admitted: false,
            limit: policy.capacity,
            remaining_tokens: tokens.floor() as u64,
            retry_after_seconds: ((1.0 - tokens) / policy.refill_rate).ceil() as u64,
        }
    };

    let next = BucketState {
        tokens,
        last_refill_time: now,
    };
    (next, decision)
}

/// Longest expiry handed to a store.
pub const MAX_BUCKET_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Expiry for a stored bucket.
///
/// Never shorter than a full refill from empty, otherwise a throttled client
/// could see its bucket evicted and come back full too early. Capped at
/// [`MAX_BUCKET_TTL`].
pub fn bucket_ttl(policy: &RateLimitPolicy, min_ttl: Duration) -> Duration {
    let full = policy.time_to_full();
    let secs = full
        .as_secs()
        .saturating_add(u64::from(full.subsec_nanos() > 0))
        .saturating_add(1);
    Duration::from_secs(secs).min(MAX_BUCKET_TTL).max(min_ttl)
}

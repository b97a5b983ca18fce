//! Rate limiting logic and state management.

mod backend;
mod bucket;
mod clock;
mod limiter;
mod memory;
mod metrics;
mod policy;
mod redis_store;
mod reload;

pub use backend::BucketStore;
pub use bucket::{
    bucket_ttl, take_token, BucketKey, BucketState, Decision, DEFAULT_KEY_PREFIX, MAX_BUCKET_TTL,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use limiter::{FailureMode, LimiterSettings, TokenBucketLimiter};
pub use memory::MemoryBucketStore;
pub use metrics::{LimiterMetrics, MetricsSnapshot};
pub use policy::{normalize_path, PathRule, RateLimitPolicy, RateLimitRules, RulesHandle};
pub use redis_store::RedisBucketStore;
pub use reload::spawn_rules_reloader;

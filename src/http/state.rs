//! Shared state for the admission middleware.

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::auth::{IdentityProvider, JwtIdentityProvider};
use crate::config::{StoreBackend, TollgateConfig};
use crate::error::Result;
use crate::ratelimit::{
    spawn_rules_reloader, BucketStore, Clock, MemoryBucketStore, RedisBucketStore, RulesHandle,
    SystemClock, TokenBucketLimiter, DEFAULT_KEY_PREFIX,
};

/// Everything the admission middleware needs per request.
#[derive(Clone)]
pub struct RateLimitState {
    pub limiter: Arc<TokenBucketLimiter>,
    pub rules: Arc<RulesHandle>,
    pub identity: Arc<dyn IdentityProvider>,
    pub clock: Arc<dyn Clock>,
    pub key_prefix: Arc<str>,
}

impl RateLimitState {
    /// Assemble state from parts, using the wall clock and default key prefix.
    pub fn new(
        limiter: Arc<TokenBucketLimiter>,
        rules: Arc<RulesHandle>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        Self {
            limiter,
            rules,
            identity,
            clock: Arc::new(SystemClock),
            key_prefix: Arc::from(DEFAULT_KEY_PREFIX),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_key_prefix(mut self, prefix: &str) -> Self {
        self.key_prefix = Arc::from(prefix);
        self
    }

    /// Build state from configuration: connect the store, load the policy
    /// table and start its reloader if a rules file is configured.
    pub async fn from_config(config: &TollgateConfig) -> Result<Self> {
        let store: Arc<dyn BucketStore> = match config.store.backend {
            StoreBackend::Memory => {
                let store = Arc::new(MemoryBucketStore::new());
                spawn_memory_purge(
                    store.clone(),
                    Duration::from_secs(config.rate_limiting.min_bucket_ttl_secs.max(1)),
                );
                info!("Using in-memory bucket store");
                store
            }
            StoreBackend::Redis => {
                let store = RedisBucketStore::connect(&config.store.redis_url).await?;
                info!(url = %config.store.redis_url, "Using redis bucket store");
                Arc::new(store)
            }
        };

        let limiter = Arc::new(TokenBucketLimiter::with_settings(
            store,
            config.rate_limiting.limiter_settings(),
        ));

        let rules = Arc::new(RulesHandle::new(config.rate_limiting.load_rules()?));
        if let (Some(path), Some(interval)) = (
            config.rate_limiting.rules_path.as_ref(),
            config.rate_limiting.reload_interval(),
        ) {
            spawn_rules_reloader(rules.clone(), path.into(), interval);
            info!(path = %path, interval_secs = interval.as_secs(), "Rate limit rules reloader started");
        }

        let identity = JwtIdentityProvider::from_config(&config.auth)?;
        if !identity.is_enabled() {
            warn!("No JWT secret configured, bearer tokens will not be validated");
        }

        Ok(Self::new(limiter, rules, Arc::new(identity)).with_key_prefix(&config.store.key_prefix))
    }
}

fn spawn_memory_purge(store: Arc<MemoryBucketStore>, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            store.purge_expired();
        }
    });
}

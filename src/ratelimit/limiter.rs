//! Core token bucket limiter.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::backend::BucketStore;
use super::bucket::{bucket_ttl, take_token, BucketKey, BucketState, Decision};
use super::metrics::LimiterMetrics;
use super::policy::RateLimitPolicy;
use crate::error::StoreError;

/// Default bound on a single store call.
const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(100);
/// Default floor for bucket expiry.
const DEFAULT_MIN_BUCKET_TTL: Duration = Duration::from_secs(60);
/// Default number of compare-and-set rounds before giving up.
const DEFAULT_MAX_CAS_ATTEMPTS: u32 = 32;
/// Upper bound of the randomized pause between lost compare-and-set rounds.
const CAS_BACKOFF_STEP_MICROS: u64 = 50;

/// What to do with a request when the bucket store cannot answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// Admit the request and log. A store outage then cannot take the
    /// service down with it.
    #[default]
    Open,
    /// Reject the request as if the bucket were empty.
    Closed,
}

/// Tunables for [`TokenBucketLimiter`].
#[derive(Debug, Clone)]
pub struct LimiterSettings {
    /// Outcome when the store fails or times out
    pub failure_mode: FailureMode,
    /// Bound on each store call
    pub store_timeout: Duration,
    /// Bucket expiry floor; raised per policy to cover a full refill
    pub min_bucket_ttl: Duration,
    /// Compare-and-set rounds before reporting contention
    pub max_cas_attempts: u32,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            failure_mode: FailureMode::default(),
            store_timeout: DEFAULT_STORE_TIMEOUT,
            min_bucket_ttl: DEFAULT_MIN_BUCKET_TTL,
            max_cas_attempts: DEFAULT_MAX_CAS_ATTEMPTS,
        }
    }
}

/// Token bucket limiter over a shared [`BucketStore`].
///
/// Each evaluation reads the bucket, refills it, takes a token if one is
/// available and writes it back with a compare-and-set. A lost race re-reads
/// and recomputes, so concurrent requests on one key are serialized by the
/// store and never both spend the same token.
pub struct TokenBucketLimiter {
    store: Arc<dyn BucketStore>,
    settings: LimiterSettings,
    metrics: Arc<LimiterMetrics>,
}

impl TokenBucketLimiter {
    /// Create a limiter with default settings.
    pub fn new(store: Arc<dyn BucketStore>) -> Self {
        Self::with_settings(store, LimiterSettings::default())
    }

    /// Create a limiter with explicit settings.
    pub fn with_settings(store: Arc<dyn BucketStore>, settings: LimiterSettings) -> Self {
        Self {
            store,
            settings,
            metrics: Arc::new(LimiterMetrics::new()),
        }
    }

    /// Counters shared with the rest of the admission path.
    pub fn metrics(&self) -> &Arc<LimiterMetrics> {
        &self.metrics
    }

    pub fn settings(&self) -> &LimiterSettings {
        &self.settings
    }

    /// Decide whether one request on `key` is admitted at time `now`.
    ///
    /// Never fails: store problems resolve through the configured
    /// [`FailureMode`]. Exhausted compare-and-set retries always reject,
    /// since the store is reachable and the bucket is in heavy use.
    pub async fn evaluate(&self, key: &BucketKey, policy: &RateLimitPolicy, now: f64) -> Decision {
        let decision = match self.try_evaluate(key, policy, now).await {
            Ok(decision) => decision,
            Err(StoreError::Contention { attempts }) => {
                warn!(key = %key, attempts = attempts, "Bucket update kept losing races, rejecting request");
                Decision::empty(policy)
            }
            Err(e) => {
                self.metrics.record_store_failure();
                match self.settings.failure_mode {
                    FailureMode::Open => {
                        warn!(key = %key, error = %e, "Bucket store failed, admitting request");
                        Decision::full(policy)
                    }
                    FailureMode::Closed => {
                        warn!(key = %key, error = %e, "Bucket store failed, rejecting request");
                        Decision::empty(policy)
                    }
                }
            }
        };

        if decision.admitted {
            self.metrics.record_admitted();
        } else {
            debug!(
                key = %key,
                retry_after = decision.retry_after_seconds,
                "Rate limit exceeded"
            );
            self.metrics.record_rejected();
        }

        decision
    }

    async fn try_evaluate(
        &self,
        key: &BucketKey,
        policy: &RateLimitPolicy,
        now: f64,
    ) -> Result<Decision, StoreError> {
        let ttl = bucket_ttl(policy, self.settings.min_bucket_ttl);
        let attempts = self.settings.max_cas_attempts.max(1);

        for attempt in 1..=attempts {
            let raw = self.bounded(self.store.get(key.as_str())).await?;

            let state = raw.as_deref().and_then(|raw| {
                let state = BucketState::decode(raw);
                if state.is_none() {
                    warn!(key = %key, "Discarding unreadable bucket state");
                }
                state
            });

            let (next, decision) = take_token(state, policy, now);

            let swapped = self
                .bounded(self.store.compare_and_set(
                    key.as_str(),
                    raw.as_deref(),
                    &next.encode(),
                    ttl,
                ))
                .await?;

            if swapped {
                trace!(
                    key = %key,
                    tokens = next.tokens,
                    admitted = decision.admitted,
                    attempt = attempt,
                    "Bucket updated"
                );
                return Ok(decision);
            }

            self.metrics.record_cas_conflict();
            trace!(key = %key, attempt = attempt, "Bucket changed underneath, retrying");

            if attempt < attempts {
                let pause = rand::thread_rng().gen_range(0..=CAS_BACKOFF_STEP_MICROS * attempt as u64);
                tokio::time::sleep(Duration::from_micros(pause)).await;
            }
        }

        Err(StoreError::Contention { attempts })
    }

    async fn bounded<T, F>(&self, call: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        tokio::time::timeout(self.settings.store_timeout, call)
            .await
            .map_err(|_| StoreError::Timeout(self.settings.store_timeout))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::memory::MemoryBucketStore;
    use async_trait::async_trait;

    fn policy(capacity: f64, refill_rate: f64) -> RateLimitPolicy {
        RateLimitPolicy::new(capacity, refill_rate).unwrap()
    }

    fn memory_limiter() -> (Arc<MemoryBucketStore>, TokenBucketLimiter) {
        let store = Arc::new(MemoryBucketStore::new());
        let limiter = TokenBucketLimiter::new(store.clone());
        (store, limiter)
    }

    struct FailingStore;

    #[async_trait]
    impl BucketStore for FailingStore {
        async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn compare_and_set(
            &self,
            _key: &str,
            _expected: Option<&str>,
            _value: &str,
            _ttl: Duration,
        ) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
    }

    struct SlowStore;

    #[async_trait]
    impl BucketStore for SlowStore {
        async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(None)
        }

        async fn compare_and_set(
            &self,
            _key: &str,
            _expected: Option<&str>,
            _value: &str,
            _ttl: Duration,
        ) -> Result<bool, StoreError> {
            Ok(true)
        }
    }

    /// Every write loses, as if another instance always wins the race.
    struct ContendedStore;

    #[async_trait]
    impl BucketStore for ContendedStore {
        async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Ok(None)
        }

        async fn compare_and_set(
            &self,
            _key: &str,
            _expected: Option<&str>,
            _value: &str,
            _ttl: Duration,
        ) -> Result<bool, StoreError> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn test_burst_then_reject() {
        let (_, limiter) = memory_limiter();
        let key = BucketKey::new("user-1", "/api/test");
        let p = policy(10.0, 1.0);

        for i in 0..10 {
            let decision = limiter.evaluate(&key, &p, 1000.0).await;
            assert!(decision.admitted, "request {} should be admitted", i);
            assert_eq!(decision.remaining_tokens, 9 - i);
        }

        let decision = limiter.evaluate(&key, &p, 1000.0).await;
        assert!(!decision.admitted);
        assert_eq!(decision.remaining_tokens, 0);
        assert_eq!(decision.retry_after_seconds, 1);

        let snapshot = limiter.metrics().snapshot();
        assert_eq!(snapshot.admitted, 10);
        assert_eq!(snapshot.rejected, 1);
    }

    #[tokio::test]
    async fn test_refill_over_time() {
        let (_, limiter) = memory_limiter();
        let key = BucketKey::new("user-1", "/api/test");
        let p = policy(10.0, 2.0);

        for _ in 0..10 {
            limiter.evaluate(&key, &p, 0.0).await;
        }
        assert!(!limiter.evaluate(&key, &p, 0.0).await.admitted);

        // 2 tokens/s * 2s = 4 tokens, one taken
        let decision = limiter.evaluate(&key, &p, 2.0).await;
        assert!(decision.admitted);
        assert_eq!(decision.remaining_tokens, 3);
    }

    #[tokio::test]
    async fn test_rejection_is_persisted() {
        let (store, limiter) = memory_limiter();
        let key = BucketKey::new("user-1", "/api/test");
        let p = policy(1.0, 1.0);

        limiter.evaluate(&key, &p, 10.0).await;
        limiter.evaluate(&key, &p, 10.5).await;

        let raw = store.get(key.as_str()).await.unwrap().unwrap();
        let state = BucketState::decode(&raw).unwrap();
        assert_eq!(state.tokens, 0.5);
        assert_eq!(state.last_refill_time, 10.5);
    }

    #[tokio::test]
    async fn test_separate_keys_are_independent() {
        let (_, limiter) = memory_limiter();
        let p = policy(1.0, 0.01);
        let alice = BucketKey::new("alice", "/api/test");
        let bob = BucketKey::new("bob", "/api/test");
        let alice_other = BucketKey::new("alice", "/api/other");

        assert!(limiter.evaluate(&alice, &p, 0.0).await.admitted);
        assert!(!limiter.evaluate(&alice, &p, 0.0).await.admitted);
        assert!(limiter.evaluate(&bob, &p, 0.0).await.admitted);
        assert!(limiter.evaluate(&alice_other, &p, 0.0).await.admitted);
    }

    #[tokio::test]
    async fn test_corrupt_state_treated_as_full() {
        let (store, limiter) = memory_limiter();
        let key = BucketKey::new("user-1", "/api/test");
        store
            .compare_and_set(key.as_str(), None, "{garbage", Duration::from_secs(60))
            .await
            .unwrap();

        let decision = limiter.evaluate(&key, &policy(5.0, 1.0), 0.0).await;
        assert!(decision.admitted);
        assert_eq!(decision.remaining_tokens, 4);

        let raw = store.get(key.as_str()).await.unwrap().unwrap();
        assert!(BucketState::decode(&raw).is_some());
    }

    #[tokio::test]
    async fn test_store_failure_fails_open() {
        let limiter = TokenBucketLimiter::new(Arc::new(FailingStore));
        let key = BucketKey::new("user-1", "/api/test");

        let decision = limiter.evaluate(&key, &policy(10.0, 1.0), 0.0).await;
        assert!(decision.admitted);
        assert_eq!(decision.remaining_tokens, 10);
        assert_eq!(limiter.metrics().snapshot().store_failures, 1);
    }

    #[tokio::test]
    async fn test_store_failure_fails_closed() {
        let settings = LimiterSettings {
            failure_mode: FailureMode::Closed,
            ..Default::default()
        };
        let limiter = TokenBucketLimiter::with_settings(Arc::new(FailingStore), settings);
        let key = BucketKey::new("user-1", "/api/test");

        let decision = limiter.evaluate(&key, &policy(10.0, 0.5), 0.0).await;
        assert!(!decision.admitted);
        assert_eq!(decision.retry_after_seconds, 2);
    }

    #[tokio::test]
    async fn test_store_timeout_is_a_failure() {
        let settings = LimiterSettings {
            store_timeout: Duration::from_millis(10),
            ..Default::default()
        };
        let limiter = TokenBucketLimiter::with_settings(Arc::new(SlowStore), settings);
        let key = BucketKey::new("user-1", "/api/test");

        let decision = limiter.evaluate(&key, &policy(10.0, 1.0), 0.0).await;
        assert!(decision.admitted);
        assert_eq!(limiter.metrics().snapshot().store_failures, 1);
    }

    #[tokio::test]
    async fn test_contention_rejects_even_when_failing_open() {
        let settings = LimiterSettings {
            max_cas_attempts: 3,
            failure_mode: FailureMode::Open,
            ..Default::default()
        };
        let limiter = TokenBucketLimiter::with_settings(Arc::new(ContendedStore), settings);
        let key = BucketKey::new("user-1", "/api/test");

        let decision = limiter.evaluate(&key, &policy(10.0, 0.5), 0.0).await;
        assert!(!decision.admitted);
        assert_eq!(decision.retry_after_seconds, 2);

        let snapshot = limiter.metrics().snapshot();
        assert_eq!(snapshot.cas_conflicts, 3);
        assert_eq!(snapshot.store_failures, 0);
        assert_eq!(snapshot.rejected, 1);
    }

    #[tokio::test]
    async fn test_very_slow_refill_does_not_panic() {
        let (store, limiter) = memory_limiter();
        let key = BucketKey::new("user-1", "/api/test");
        let p = policy(1_000_000.0, 1e-14);

        let decision = limiter.evaluate(&key, &p, 1000.0).await;
        assert!(decision.admitted);
        assert_eq!(decision.remaining_tokens, 999_999);
        assert!(store.get(key.as_str()).await.unwrap().is_some());
        assert_eq!(limiter.metrics().snapshot().store_failures, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_admit_exactly_capacity() {
        let store = Arc::new(MemoryBucketStore::new());
        let settings = LimiterSettings {
            max_cas_attempts: 1000,
            ..Default::default()
        };
        let limiter = Arc::new(TokenBucketLimiter::with_settings(store, settings));
        let key = BucketKey::new("user-1", "/api/test");
        let p = policy(10.0, 1.0);

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let limiter = limiter.clone();
                let key = key.clone();
                tokio::spawn(async move { limiter.evaluate(&key, &p, 500.0).await })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap().admitted {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 10);
        assert_eq!(limiter.metrics().snapshot().store_failures, 0);
    }
}

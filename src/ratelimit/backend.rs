//! Storage trait for shared bucket state.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::StoreError;

/// A key/value store holding serialized bucket state with expiry.
///
/// Implementations must make `compare_and_set` atomic per key: the write
/// happens only if the live value still equals `expected` (`None` meaning
/// the key is absent or expired). The limiter builds its read-refill-write
/// cycle on top of this, so two writers can never both act on the same
/// stale bucket.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Fetch the live value for `key`.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write `value` with `ttl` if the current value equals `expected`.
    ///
    /// Returns `false` when another writer got there first.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;
}

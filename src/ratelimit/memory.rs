//! In-process bucket store for single-instance deployments and tests.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::debug;

use super::backend::BucketStore;
use crate::error::StoreError;

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    /// `None` when the expiry lies beyond what `Instant` can represent
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn live(&self, now: Instant) -> Option<&str> {
        (!self.expired(now)).then_some(self.value.as_str())
    }
}

/// Bucket store backed by a concurrent hash map.
///
/// The map's per-shard lock is held for the whole compare-and-set, which
/// makes it atomic per key.
#[derive(Debug, Default)]
pub struct MemoryBucketStore {
    entries: DashMap<String, StoredValue>,
}

impl MemoryBucketStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired entries. Reads already ignore them; this only frees memory.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, stored| !stored.expired(now));
        let purged = before.saturating_sub(self.entries.len());
        if purged > 0 {
            debug!(purged = purged, "Purged expired buckets");
        }
        purged
    }

    /// Number of entries held, expired or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl BucketStore for MemoryBucketStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        Ok(self
            .entries
            .get(key)
            .and_then(|stored| stored.live(now).map(str::to_owned)))
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let replacement = StoredValue {
            value: value.to_owned(),
            expires_at: now.checked_add(ttl),
        };

        match self.entries.entry(key.to_owned()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().live(now) != expected {
                    return Ok(false);
                }
                occupied.insert(replacement);
            }
            Entry::Vacant(vacant) => {
                if expected.is_some() {
                    return Ok(false);
                }
                vacant.insert(replacement);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_get_missing() {
        let store = MemoryBucketStore::new();
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_set_when_absent() {
        let store = MemoryBucketStore::new();
        assert!(store.compare_and_set("k", None, "v1", TTL).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v1"));

        // Key now exists, so "expect absent" must fail
        assert!(!store.compare_and_set("k", None, "v2", TTL).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v1"));
    }

    #[tokio::test]
    async fn test_set_with_matching_value() {
        let store = MemoryBucketStore::new();
        store.compare_and_set("k", None, "v1", TTL).await.unwrap();

        assert!(!store.compare_and_set("k", Some("other"), "v2", TTL).await.unwrap());
        assert!(store.compare_and_set("k", Some("v1"), "v2", TTL).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn test_expired_entry_reads_as_absent() {
        let store = MemoryBucketStore::new();
        store.compare_and_set("k", None, "v1", Duration::ZERO).await.unwrap();

        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(!store.compare_and_set("k", Some("v1"), "v2", TTL).await.unwrap());
        assert!(store.compare_and_set("k", None, "v2", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = MemoryBucketStore::new();
        store.compare_and_set("old", None, "v", Duration::ZERO).await.unwrap();
        store.compare_and_set("new", None, "v", TTL).await.unwrap();

        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_unrepresentable_ttl_never_expires() {
        let store = MemoryBucketStore::new();
        assert!(store.compare_and_set("k", None, "v1", Duration::MAX).await.unwrap());

        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v1"));
        assert_eq!(store.purge_expired(), 0);
        assert!(store.compare_and_set("k", Some("v1"), "v2", Duration::MAX).await.unwrap());
    }
}

//! Redis-backed bucket store.
//!
//! Lets several service instances share one set of buckets. The
//! compare-and-set runs as a Lua script, which redis executes atomically,
//! so no client-side locking or `WATCH` is needed on the multiplexed
//! connection.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

use super::backend::BucketStore;
use crate::error::StoreError;

/// `ARGV[1]` is the expected value, empty meaning "absent".
const COMPARE_AND_SET: &str = r#"
local current = redis.call('GET', KEYS[1])
if current == false then
    current = ''
end
if current ~= ARGV[1] then
    return 0
end
redis.call('SET', KEYS[1], ARGV[2], 'EX', ARGV[3])
return 1
"#;

/// Bucket store on a redis (or redis-compatible) server.
#[derive(Clone)]
pub struct RedisBucketStore {
    connection_manager: ConnectionManager,
}

impl fmt::Debug for RedisBucketStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisBucketStore").finish_non_exhaustive()
    }
}

impl RedisBucketStore {
    /// Connect and verify the server answers.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(|e| {
            warn!(error = %e, "Failed to create redis client for bucket store");
            StoreError::from(e)
        })?;

        let connection_manager = ConnectionManager::new(client).await?;

        let mut conn = connection_manager.clone();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;

        debug!("Connected to redis bucket store");

        Ok(Self { connection_manager })
    }
}

#[async_trait]
impl BucketStore for RedisBucketStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection_manager.clone();
        let value = redis::cmd("GET")
            .arg(key)
            .query_async::<Option<String>>(&mut conn)
            .await?;
        Ok(value)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection_manager.clone();
        let swapped = redis::cmd("EVAL")
            .arg(COMPARE_AND_SET)
            .arg(1)
            .arg(key)
            .arg(expected.unwrap_or(""))
            .arg(value)
            .arg(ttl.as_secs().max(1))
            .query_async::<i64>(&mut conn)
            .await?;
        Ok(swapped == 1)
    }
}

use std::time::Duration;

use redis::{AsyncCommands, Client};
use serde::{de::DeserializeOwned, Serialize};

use crate::error::IntelError;

/// Snapshot of every preprocessed indicator, committed wholesale per cycle.
pub const SNAPSHOT_KEY: &str = "preprocessed_iocs";
/// Subset of the snapshot with `final_confidence >= 80`.
pub const HIGH_CONFIDENCE_KEY: &str = "high_confidence_iocs";
/// Summary of the most recent completed rebuild cycle.
pub const LAST_REBUILD_KEY: &str = "last_rebuild";

pub const REP_CACHE_HITS: &str = "stats:rep_cache_hits";
pub const REP_CACHE_MISSES: &str = "stats:rep_cache_misses";
pub const GEO_CACHE_HITS: &str = "stats:geo_cache_hits";
pub const GEO_CACHE_MISSES: &str = "stats:geo_cache_misses";

const STAT_COUNTER_TTL_SECS: i64 = 7 * 86400;
const BUDGET_COUNTER_TTL_SECS: i64 = 2 * 86400;

/// Redis-backed key/value store. The preprocessor is the only writer of the
/// snapshot keys; the protocol server only reads them.
pub struct Cache {
    redis: Client,
}

impl Cache {
    pub fn new(redis_url: &str) -> Result<Self, IntelError> {
        let redis = Client::open(redis_url)
            .map_err(|e| IntelError::Config(format!("invalid redis url: {e}")))?;
        Ok(Self { redis })
    }

    async fn conn(&self) -> Result<redis::aio::Connection, IntelError> {
        self.redis
            .get_async_connection()
            .await
            .map_err(|e| IntelError::ServiceUnavailable(format!("cache connection failed: {e}")))
    }

    /// Verifies cache connectivity with a PING round trip.
    pub async fn ping(&self) -> Result<(), IntelError> {
        let mut conn = self.conn().await?;
        let response: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| IntelError::ServiceUnavailable(format!("cache PING failed: {e}")))?;
        if response == "PONG" {
            Ok(())
        } else {
            Err(IntelError::ServiceUnavailable(format!(
                "unexpected cache PING response: {response}"
            )))
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, IntelError> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn.get(key).await?;
        match raw {
            None => Ok(None),
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| IntelError::Fatal(format!("corrupt cache entry {key}: {e}"))),
        }
    }

    /// Writes a value with a TTL. The SET+EXPIRE pair runs as one atomic
    /// pipeline, so readers observe either the previous value or the new one
    /// in full. This doubles as the snapshot swap.
    pub async fn put_json<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), IntelError> {
        let raw = serde_json::to_string(value)
            .map_err(|e| IntelError::Fatal(format!("failed to serialize {key}: {e}")))?;
        let mut conn = self.conn().await?;
        let _: () = redis::pipe()
            .atomic()
            .set(key, raw)
            .expire(key, ttl.as_secs() as i64)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn get_counter(&self, key: &str) -> Result<u64, IntelError> {
        let mut conn = self.conn().await?;
        let value: Option<u64> = conn.get(key).await?;
        Ok(value.unwrap_or(0))
    }

    /// Increments a counter and refreshes its TTL, returning the new value.
    pub async fn incr_counter(&self, key: &str, ttl_secs: i64) -> Result<u64, IntelError> {
        let mut conn = self.conn().await?;
        let (value,): (u64,) = redis::pipe()
            .atomic()
            .incr(key, 1u64)
            .expire(key, ttl_secs)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    /// Explicit expiry override (for maintenance)
    #[allow(dead_code)]
    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<(), IntelError> {
        let mut conn = self.conn().await?;
        let _: () = conn.expire(key, ttl.as_secs() as i64).await?;
        Ok(())
    }

    /// Atomically claims one unit of a request budget. The increment happens
    /// first so concurrent callers can never jointly exceed the limit; a
    /// denied claim is rolled back to keep the counter equal to the number of
    /// requests actually issued.
    pub async fn try_consume_budget(&self, key: &str, limit: u64) -> Result<bool, IntelError> {
        let used = self.incr_counter(key, BUDGET_COUNTER_TTL_SECS).await?;
        if used > limit {
            let mut conn = self.conn().await?;
            let _: () = conn.decr(key, 1u64).await?;
            return Ok(false);
        }
        Ok(true)
    }

    /// Best-effort statistics counter. Never fails the caller: cache-hit
    /// bookkeeping is not worth aborting an enrichment over.
    pub async fn bump_stat(&self, key: &str) {
        if let Err(e) = self.incr_counter(key, STAT_COUNTER_TTL_SECS).await {
            tracing::debug!("failed to bump stat counter {}: {}", key, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // These tests require Redis to be running on localhost:6379 and skip
    // themselves otherwise, matching the rest of the suite.

    async fn test_cache() -> Option<Cache> {
        let cache = Cache::new("redis://127.0.0.1:6379").ok()?;
        if cache.ping().await.is_err() {
            println!("Skipping test - Redis not available");
            return None;
        }
        Some(cache)
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let Some(cache) = test_cache().await else { return };
        let key = "test:threatwatch:round_trip";
        cache
            .put_json(key, &vec!["a".to_string(), "b".to_string()], Duration::from_secs(30))
            .await
            .unwrap();
        let value: Option<Vec<String>> = cache.get_json(key).await.unwrap();
        assert_eq!(value, Some(vec!["a".to_string(), "b".to_string()]));
    }

    #[tokio::test]
    async fn test_missing_key_reads_as_none() {
        let Some(cache) = test_cache().await else { return };
        let value: Option<Vec<String>> = cache
            .get_json("test:threatwatch:never_written")
            .await
            .unwrap();
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn test_budget_gate_denies_over_limit() {
        let Some(cache) = test_cache().await else { return };
        let key = format!("test:threatwatch:budget:{}", chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default());
        assert!(cache.try_consume_budget(&key, 2).await.unwrap());
        assert!(cache.try_consume_budget(&key, 2).await.unwrap());
        assert!(!cache.try_consume_budget(&key, 2).await.unwrap());
        // The rollback keeps the counter at the number of granted claims.
        assert_eq!(cache.get_counter(&key).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_counter_increments() {
        let Some(cache) = test_cache().await else { return };
        let key = format!("test:threatwatch:counter:{}", chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default());
        assert_eq!(cache.incr_counter(&key, 60).await.unwrap(), 1);
        assert_eq!(cache.incr_counter(&key, 60).await.unwrap(), 2);
        assert_eq!(cache.get_counter(&key).await.unwrap(), 2);
    }
}

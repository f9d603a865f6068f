//! Redis-backed counter store.
//!
//! Buckets are plain integer keys under a configurable namespace:
//!
//! - `INCR` creates and bumps the counter
//! - `PEXPIRE` bounds its lifetime to the policy window
//! - the combined step runs as one Lua script so no bucket can be created
//!   without an expiry, even if the calling process dies mid-request
//!
//! The connection is a [`ConnectionManager`], which multiplexes requests over
//! one connection and reconnects on failure. Callers share it without locking.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use std::fmt;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::info;

use crate::error::StoreError;
use crate::ratelimit::{BucketState, CounterStore};

/// Increment, arm the expiry when the bucket is new or has none, and report
/// the count with the remaining lifetime in milliseconds.
///
/// The `ttl < 0` branch heals a bucket left by a bare INCR; it is exercised by
/// `test_redis_rearms_missing_expiry` (ignored, needs a live server).
const INCR_WITH_EXPIRY: &str = r#"
local count = redis.call('INCR', KEYS[1])
local ttl = redis.call('PTTL', KEYS[1])
if count == 1 or ttl < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
  ttl = tonumber(ARGV[1])
end
return {count, ttl}
"#;

/// Configuration for the Redis store.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Prefix prepended to every bucket key (default: "rate_limit:")
    pub key_namespace: String,
    /// Bound on establishing the initial connection
    pub connect_timeout: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            key_namespace: "rate_limit:".to_string(),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Counter store shared across processes through Redis.
///
/// The connection is established on first use and re-attempted on the next
/// call if that fails, so an unreachable server at startup behaves like any
/// later outage.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    connection: OnceCell<ConnectionManager>,
    config: RedisStoreConfig,
    script: Script,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("config", &self.config)
            .field("connected", &self.connection.initialized())
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Validate `url` and prepare a store without connecting.
    pub fn open(url: &str, config: RedisStoreConfig) -> Result<Self, StoreError> {
        Ok(Self {
            client: Client::open(url)?,
            connection: OnceCell::new(),
            config,
            script: Script::new(INCR_WITH_EXPIRY),
        })
    }

    /// Open a store and establish its connection now.
    pub async fn connect_with_config(
        url: &str,
        config: RedisStoreConfig,
    ) -> Result<Self, StoreError> {
        let store = Self::open(url, config)?;
        store.connection().await?;
        Ok(store)
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        let connect_timeout = self.config.connect_timeout;
        let connection = self
            .connection
            .get_or_try_init(|| async {
                let connection =
                    tokio::time::timeout(connect_timeout, ConnectionManager::new(self.client.clone()))
                        .await
                        .map_err(|_| StoreError::Timeout(connect_timeout))??;
                info!(namespace = %self.config.key_namespace, "Connected to Redis counter store");
                Ok::<_, StoreError>(connection)
            })
            .await?;

        Ok(connection.clone())
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_namespace, key)
    }
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX).max(1)
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn incr(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;
        let count: u64 = conn.incr(self.key(key), 1u64).await?;
        Ok(count)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: i64 = conn.pexpire(self.key(key), millis(ttl)).await?;
        Ok(())
    }

    /// `PEXPIRE ... NX`, which needs Redis 7.0 or later.
    async fn expire_nx(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let armed: i64 = redis::cmd("PEXPIRE")
            .arg(self.key(key))
            .arg(millis(ttl))
            .arg("NX")
            .query_async(&mut conn)
            .await?;
        Ok(armed == 1)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let mut conn = self.connection().await?;
        let pttl: i64 = conn.pttl(self.key(key)).await?;
        // -2: no such key, -1: no expiry
        Ok(u64::try_from(pttl).ok().map(Duration::from_millis))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(StoreError::Protocol(format!("unexpected PING reply: {pong}")))
        }
    }

    async fn incr_with_expiry(&self, key: &str, window: Duration) -> Result<BucketState, StoreError> {
        let mut conn = self.connection().await?;
        let (count, pttl): (u64, i64) = self
            .script
            .key(self.key(key))
            .arg(millis(window))
            .invoke_async(&mut conn)
            .await?;

        Ok(BucketState {
            count,
            ttl: u64::try_from(pttl).ok().map(Duration::from_millis),
        })
    }
}

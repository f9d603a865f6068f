//! Counter store trait for abstracting the shared store behind the limiter.

use async_trait::async_trait;
use std::time::Duration;
use tracing::warn;

use crate::error::StoreError;

/// Bucket state observed right after an increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketState {
    /// Requests counted in the current window, including this one
    pub count: u64,
    /// Time until the bucket expires, if the store reported one
    pub ttl: Option<Duration>,
}

/// A key-value store shared by every serving process.
///
/// Correctness of the limiter rests entirely on `incr` being atomic in the
/// store; callers hold no locks of their own.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment `key`, creating it at 1, and return the new value.
    async fn incr(&self, key: &str) -> Result<u64, StoreError>;

    /// Set a time-to-live on `key`. No-op if the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Set a time-to-live on `key` only if it exists and has none.
    ///
    /// Returns whether the expiry was armed. Must be atomic in the store.
    async fn expire_nx(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Remaining time-to-live of `key`; `None` if absent or without expiry.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError>;

    /// Check that the store is reachable.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Increment `key` and make sure it expires within `window`.
    ///
    /// This default is the two-step form. The increment that creates the
    /// bucket arms its expiry with [`expire_nx`](Self::expire_nx), and a later
    /// increment reads the remaining TTL. A later increment that finds no TTL
    /// cannot tell a creator whose expiry is still in flight from one that
    /// died, so it also calls `expire_nx`. Whichever lands first arms the
    /// window and the other is a no-op, so the window end is never moved.
    ///
    /// That path costs a third round trip. A bucket created by a process
    /// that died after `INCR` lives on until its next hit. Stores with an
    /// atomic primitive should override this.
    async fn incr_with_expiry(&self, key: &str, window: Duration) -> Result<BucketState, StoreError> {
        let count = self.incr(key).await?;

        if count == 1 {
            self.expire_nx(key, window).await?;
            return Ok(BucketState {
                count,
                ttl: Some(window),
            });
        }

        let ttl = match self.ttl(key).await? {
            Some(ttl) => ttl,
            None => {
                if self.expire_nx(key, window).await? {
                    warn!(key = %key, count = count, "Bucket had no expiry, armed it");
                }
                window
            }
        };

        Ok(BucketState {
            count,
            ttl: Some(ttl),
        })
    }
}

//! In-process counter store.
//!
//! Emulates the INCR/EXPIRE semantics of the shared store inside one process.
//! Used for single-node development deployments and as the store under test:
//! time comes from an injectable [`Clock`], and the store can be switched
//! offline to exercise the failure path.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use super::clock::{Clock, SystemClock};
use crate::error::StoreError;
use crate::ratelimit::{BucketState, CounterStore};

#[derive(Debug, Clone, Copy)]
struct Slot {
    count: u64,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// A `CounterStore` held in a concurrent map.
pub struct MemoryStore {
    slots: DashMap<String, Slot>,
    clock: Arc<dyn Clock>,
    available: AtomicBool,
}

impl MemoryStore {
    /// Create a store using the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store reading time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: DashMap::new(),
            clock,
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the store going offline (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store is offline".to_string()))
        }
    }

    /// Current count of a live bucket.
    pub fn get(&self, key: &str) -> Option<u64> {
        let now = self.clock.now();
        self.slots
            .get(key)
            .filter(|slot| !slot.is_expired(now))
            .map(|slot| slot.count)
    }

    /// Number of buckets held, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Drop expired buckets. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.slots.len();
        self.slots.retain(|_, slot| !slot.is_expired(now));
        let removed = before.saturating_sub(self.slots.len());
        if removed > 0 {
            debug!(removed = removed, "Purged expired buckets");
        }
        removed
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn incr(&self, key: &str) -> Result<u64, StoreError> {
        self.ensure_available()?;
        let now = self.clock.now();

        let mut slot = self.slots.entry(key.to_string()).or_insert(Slot {
            count: 0,
            expires_at: None,
        });
        if slot.is_expired(now) {
            *slot = Slot {
                count: 0,
                expires_at: None,
            };
        }
        slot.count += 1;
        Ok(slot.count)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        self.ensure_available()?;
        let now = self.clock.now();

        if let Some(mut slot) = self.slots.get_mut(key) {
            if !slot.is_expired(now) {
                slot.expires_at = Some(now + ttl);
            }
        }
        Ok(())
    }

    async fn expire_nx(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.ensure_available()?;
        let now = self.clock.now();

        match self.slots.get_mut(key) {
            Some(mut slot) if !slot.is_expired(now) && slot.expires_at.is_none() => {
                slot.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        self.ensure_available()?;
        let now = self.clock.now();

        Ok(self
            .slots
            .get(key)
            .filter(|slot| !slot.is_expired(now))
            .and_then(|slot| slot.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.ensure_available()
    }

    /// Increment and arm the expiry under one entry lock.
    async fn incr_with_expiry(&self, key: &str, window: Duration) -> Result<BucketState, StoreError> {
        self.ensure_available()?;
        let now = self.clock.now();

        let mut slot = self.slots.entry(key.to_string()).or_insert(Slot {
            count: 0,
            expires_at: None,
        });
        if slot.is_expired(now) {
            slot.count = 0;
            slot.expires_at = None;
        }
        slot.count += 1;

        let expires_at = *slot.expires_at.get_or_insert(now + window);

        Ok(BucketState {
            count: slot.count,
            ttl: Some(expires_at.saturating_duration_since(now)),
        })
    }
}

//! Fixed-window rate limiter over a shared counter store.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::backend::CounterStore;
use super::key::{BucketKey, ClientIdentity};
use super::policy::{FailureMode, Policy};
use crate::error::{InkgateError, Result, StoreError};

/// Default bound on one store round trip.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(250);

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Let the request through. `remaining` is `None` when the store could not
    /// be consulted and the policy fails open.
    Admit { remaining: Option<u64> },
    /// Throttle the request; the window resets after `retry_after`.
    Reject { retry_after: Duration },
}

impl Decision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Decision::Admit { .. })
    }
}

/// Running totals for one limiter.
#[derive(Debug, Default)]
pub struct LimiterStats {
    admitted: AtomicU64,
    rejected: AtomicU64,
    store_failures: AtomicU64,
}

/// Point-in-time copy of [`LimiterStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub admitted: u64,
    pub rejected: u64,
    pub store_failures: u64,
}

impl LimiterStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            admitted: self.admitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
        }
    }
}

/// Decides ADMIT or REJECT for one policy.
///
/// The limiter holds no per-key state; every count lives in the injected
/// store, so any number of tasks and processes may share a policy.
pub struct RateLimiter {
    policy: Policy,
    store: Arc<dyn CounterStore>,
    timeout: Duration,
    stats: LimiterStats,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("policy", &self.policy)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// Create a limiter for `policy` backed by `store`.
    ///
    /// `timeout` bounds each store round trip and must be non-zero.
    pub fn new(policy: Policy, store: Arc<dyn CounterStore>, timeout: Duration) -> Result<Self> {
        if timeout.is_zero() {
            return Err(InkgateError::Misconfiguration {
                policy: policy.name().to_string(),
                reason: "store timeout must be positive".to_string(),
            });
        }

        Ok(Self {
            policy,
            store,
            timeout,
            stats: LimiterStats::default(),
        })
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Bucket key of `identity` under this policy.
    pub fn key_for(&self, identity: &ClientIdentity) -> BucketKey {
        BucketKey::new(self.policy.key_prefix(), identity)
    }

    /// Check the limit for a caller identity.
    pub async fn check_identity(&self, identity: &ClientIdentity) -> Decision {
        self.check(&self.key_for(identity)).await
    }

    /// Count one request against `key` and decide whether it may proceed.
    ///
    /// Store failures never escape: they resolve to ADMIT or REJECT according
    /// to the policy's failure mode.
    pub async fn check(&self, key: &BucketKey) -> Decision {
        let limit = self.policy.limit();
        let window = self.policy.window();

        let result = tokio::time::timeout(
            self.timeout,
            self.store.incr_with_expiry(key.as_str(), window),
        )
        .await
        .unwrap_or(Err(StoreError::Timeout(self.timeout)));

        let state = match result {
            Ok(state) => state,
            Err(err) => return self.on_store_failure(key, err),
        };

        trace!(
            policy = %self.policy.name(),
            key = %key,
            count = state.count,
            limit = limit,
            "Checked rate limit"
        );

        if state.count > limit {
            let retry_after = state.ttl.unwrap_or(window);
            debug!(
                policy = %self.policy.name(),
                key = %key,
                count = state.count,
                limit = limit,
                retry_after_ms = retry_after.as_millis() as u64,
                "Rate limit exceeded"
            );
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            Decision::Reject { retry_after }
        } else {
            self.stats.admitted.fetch_add(1, Ordering::Relaxed);
            Decision::Admit {
                remaining: Some(limit - state.count),
            }
        }
    }

    fn on_store_failure(&self, key: &BucketKey, err: StoreError) -> Decision {
        self.stats.store_failures.fetch_add(1, Ordering::Relaxed);

        match self.policy.failure_mode() {
            FailureMode::Open => {
                warn!(
                    policy = %self.policy.name(),
                    key = %key,
                    error = %err,
                    "Counter store failed, failing open"
                );
                self.stats.admitted.fetch_add(1, Ordering::Relaxed);
                Decision::Admit { remaining: None }
            }
            FailureMode::Closed => {
                warn!(
                    policy = %self.policy.name(),
                    key = %key,
                    error = %err,
                    "Counter store failed, failing closed"
                );
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                Decision::Reject {
                    retry_after: self.policy.window(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::BucketState;
    use crate::store::{ManualClock, MemoryStore};
    use async_trait::async_trait;

    fn policy(limit: u64, window_secs: u64) -> Policy {
        Policy::new("test", limit, Duration::from_secs(window_secs), "ip:policy").unwrap()
    }

    fn limiter_with_clock(policy: Policy) -> (RateLimiter, Arc<MemoryStore>, ManualClock) {
        let clock = ManualClock::new();
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let limiter = RateLimiter::new(policy, store.clone(), DEFAULT_STORE_TIMEOUT).unwrap();
        (limiter, store, clock)
    }

    /// A store that never answers in time.
    struct StalledStore;

    #[async_trait]
    impl CounterStore for StalledStore {
        async fn incr(&self, _key: &str) -> std::result::Result<u64, StoreError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(1)
        }

        async fn expire(&self, _key: &str, _ttl: Duration) -> std::result::Result<(), StoreError> {
            Ok(())
        }

        async fn expire_nx(&self, _key: &str, _ttl: Duration) -> std::result::Result<bool, StoreError> {
            Ok(false)
        }

        async fn ttl(&self, _key: &str) -> std::result::Result<Option<Duration>, StoreError> {
            Ok(None)
        }

        async fn ping(&self) -> std::result::Result<(), StoreError> {
            Ok(())
        }
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let store = Arc::new(MemoryStore::new());
        let err = RateLimiter::new(policy(3, 60), store, Duration::ZERO).unwrap_err();
        assert!(matches!(err, InkgateError::Misconfiguration { .. }));
    }

    #[tokio::test]
    async fn test_requests_within_limit_admitted() {
        let (limiter, _, _) = limiter_with_clock(policy(5, 60));
        let key = BucketKey::from("ip:policy:1.2.3.4");

        for expected_remaining in (0..5).rev() {
            let decision = limiter.check(&key).await;
            assert_eq!(
                decision,
                Decision::Admit {
                    remaining: Some(expected_remaining)
                }
            );
        }
    }

    #[tokio::test]
    async fn test_example_scenario() {
        let (limiter, _, clock) = limiter_with_clock(policy(3, 60));
        let key = BucketKey::from("ip:policy:1.2.3.4");

        for _ in 0..3 {
            assert!(limiter.check(&key).await.is_admitted());
        }

        clock.advance(Duration::from_secs(2));

        for _ in 0..3 {
            assert_eq!(
                limiter.check(&key).await,
                Decision::Reject {
                    retry_after: Duration::from_secs(58)
                }
            );
        }

        let stats = limiter.stats();
        assert_eq!(stats.admitted, 3);
        assert_eq!(stats.rejected, 3);
        assert_eq!(stats.store_failures, 0);
    }

    #[tokio::test]
    async fn test_window_resets_after_expiry() {
        let (limiter, store, clock) = limiter_with_clock(policy(2, 60));
        let key = BucketKey::from("ip:policy:1.2.3.4");

        limiter.check(&key).await;
        limiter.check(&key).await;
        assert!(!limiter.check(&key).await.is_admitted());

        clock.advance(Duration::from_secs(60));

        assert_eq!(
            limiter.check(&key).await,
            Decision::Admit { remaining: Some(1) }
        );
        assert_eq!(store.get(key.as_str()), Some(1));
        assert!(limiter.check(&key).await.is_admitted());
        assert!(!limiter.check(&key).await.is_admitted());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_requests_admit_exactly_limit() {
        let limit = 10;
        let requests = 64;
        let (limiter, store, _) = limiter_with_clock(policy(limit, 60));
        let limiter = Arc::new(limiter);

        let tasks: Vec<_> = (0..requests)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move {
                    limiter
                        .check_identity(&ClientIdentity::new("198.51.100.9"))
                        .await
                })
            })
            .collect();

        let decisions: Vec<Decision> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        let admitted = decisions.iter().filter(|d| d.is_admitted()).count() as u64;
        assert_eq!(admitted, limit);
        assert_eq!(decisions.len() as u64 - admitted, requests - limit);
        assert_eq!(store.get("ip:policy:198.51.100.9"), Some(requests));
    }

    #[tokio::test]
    async fn test_fails_open_when_store_unavailable() {
        let (limiter, store, _) = limiter_with_clock(policy(1, 60));
        store.set_available(false);
        let key = BucketKey::from("ip:policy:1.2.3.4");

        for _ in 0..10 {
            assert_eq!(limiter.check(&key).await, Decision::Admit { remaining: None });
        }
        assert_eq!(limiter.stats().store_failures, 10);
    }

    #[tokio::test]
    async fn test_fails_closed_when_configured() {
        let policy = policy(100, 60).with_failure_mode(FailureMode::Closed);
        let (limiter, store, _) = limiter_with_clock(policy);
        store.set_available(false);

        let decision = limiter.check(&BucketKey::from("login:1.2.3.4")).await;
        assert_eq!(
            decision,
            Decision::Reject {
                retry_after: Duration::from_secs(60)
            }
        );
    }

    #[tokio::test]
    async fn test_store_timeout_fails_open() {
        let limiter = RateLimiter::new(
            policy(1, 60),
            Arc::new(StalledStore),
            Duration::from_millis(20),
        )
        .unwrap();

        let decision = limiter.check(&BucketKey::from("ip:policy:1.2.3.4")).await;
        assert_eq!(decision, Decision::Admit { remaining: None });
        assert_eq!(limiter.stats().store_failures, 1);
    }

    #[tokio::test]
    async fn test_store_recovery_resumes_counting() {
        let (limiter, store, _) = limiter_with_clock(policy(1, 60));
        let key = BucketKey::from("ip:policy:1.2.3.4");

        store.set_available(false);
        assert!(limiter.check(&key).await.is_admitted());

        store.set_available(true);
        assert!(limiter.check(&key).await.is_admitted());
        assert!(!limiter.check(&key).await.is_admitted());
    }

    #[tokio::test]
    async fn test_keys_are_isolated() {
        let clock = ManualClock::new();
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::with_clock(Arc::new(clock)));
        let login = RateLimiter::new(
            Policy::new("login", 1, Duration::from_secs(60), "login").unwrap(),
            store.clone(),
            DEFAULT_STORE_TIMEOUT,
        )
        .unwrap();
        let invite = RateLimiter::new(
            Policy::new("invite", 1, Duration::from_secs(60), "invite").unwrap(),
            store.clone(),
            DEFAULT_STORE_TIMEOUT,
        )
        .unwrap();

        let alice = ClientIdentity::new("10.0.0.1");
        let bob = ClientIdentity::new("10.0.0.2");

        assert!(login.check_identity(&alice).await.is_admitted());
        assert!(!login.check_identity(&alice).await.is_admitted());

        assert!(login.check_identity(&bob).await.is_admitted());
        assert!(invite.check_identity(&alice).await.is_admitted());
    }

    #[tokio::test]
    async fn test_missing_ttl_reports_full_window() {
        struct NoTtlStore(MemoryStore);

        #[async_trait]
        impl CounterStore for NoTtlStore {
            async fn incr(&self, key: &str) -> std::result::Result<u64, StoreError> {
                self.0.incr(key).await
            }
            async fn expire(&self, key: &str, ttl: Duration) -> std::result::Result<(), StoreError> {
                self.0.expire(key, ttl).await
            }
            async fn expire_nx(&self, key: &str, ttl: Duration) -> std::result::Result<bool, StoreError> {
                self.0.expire_nx(key, ttl).await
            }
            async fn ttl(&self, key: &str) -> std::result::Result<Option<Duration>, StoreError> {
                self.0.ttl(key).await
            }
            async fn ping(&self) -> std::result::Result<(), StoreError> {
                Ok(())
            }
            async fn incr_with_expiry(
                &self,
                key: &str,
                _window: Duration,
            ) -> std::result::Result<BucketState, StoreError> {
                Ok(BucketState {
                    count: self.0.incr(key).await?,
                    ttl: None,
                })
            }
        }

        let limiter = RateLimiter::new(
            policy(1, 30),
            Arc::new(NoTtlStore(MemoryStore::new())),
            DEFAULT_STORE_TIMEOUT,
        )
        .unwrap();
        let key = BucketKey::from("k");

        limiter.check(&key).await;
        assert_eq!(
            limiter.check(&key).await,
            Decision::Reject {
                retry_after: Duration::from_secs(30)
            }
        );
    }
}

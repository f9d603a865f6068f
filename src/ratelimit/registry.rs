//! Named limiters built from configuration.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::backend::CounterStore;
use super::limiter::RateLimiter;
use super::policy::Policy;
use crate::error::Result;

/// One limiter per configured policy, all sharing a single store.
#[derive(Debug, Default)]
pub struct RateLimitRegistry {
    limiters: BTreeMap<String, Arc<RateLimiter>>,
}

impl RateLimitRegistry {
    /// Build a limiter for every policy. Fails on the first invalid one.
    pub fn build(
        policies: Vec<Policy>,
        store: Arc<dyn CounterStore>,
        timeout: Duration,
    ) -> Result<Self> {
        let mut limiters = BTreeMap::new();

        for policy in policies {
            info!(
                policy = %policy.name(),
                limit = policy.limit(),
                window_secs = policy.window().as_secs(),
                key_prefix = %policy.key_prefix(),
                failure_mode = ?policy.failure_mode(),
                "Activating rate limit policy"
            );
            let name = policy.name().to_string();
            let limiter = RateLimiter::new(policy, store.clone(), timeout)?;
            limiters.insert(name, Arc::new(limiter));
        }

        Ok(Self { limiters })
    }

    pub fn get(&self, name: &str) -> Option<Arc<RateLimiter>> {
        self.limiters.get(name).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<RateLimiter>> {
        self.limiters.values()
    }

    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }
}

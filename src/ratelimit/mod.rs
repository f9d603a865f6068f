//! Rate limiting logic: policies, bucket keys, and the admission check.

mod backend;
mod key;
mod limiter;
mod policy;
mod registry;

pub use backend::{BucketState, CounterStore};
pub use key::{BucketKey, ClientIdentity, FORWARDED_FOR, UNKNOWN_IDENTITY};
pub use limiter::{Decision, LimiterStats, RateLimiter, StatsSnapshot, DEFAULT_STORE_TIMEOUT};
pub use policy::{default_policies, FailureMode, Policy, PolicyConfig, TimeUnit};
pub use registry::RateLimitRegistry;

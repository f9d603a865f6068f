//! Counter store implementations.
//!
//! [`RedisStore`] is the production store shared by every serving process.
//! [`MemoryStore`] keeps counts inside one process, for development and tests.

mod clock;
mod memory;
mod redis_store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use memory::MemoryStore;
pub use redis_store::{RedisStore, RedisStoreConfig};

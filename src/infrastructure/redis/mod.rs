//! Redis connection handling.
//!
//! Provides a multiplexed connection guarded by the shared circuit breaker,
//! used by the Redis item table.

pub mod pool;

pub use pool::{PoolError, RedisPool};

//! Partitioned, sorted key-value table holding live queue items.
//!
//! Three backends are available:
//!
//! - `MemoryStore`: in-process storage (default)
//! - `PostgresStore`: a PostgreSQL table
//! - `RedisStore`: one Redis hash per chunk
//!
//! Use `create_kv_store()` to pick one from configuration.

pub mod backend;
mod factory;
pub mod memory_backend;
pub mod postgres_backend;
pub mod redis_backend;

pub use backend::{KvStore, StoreError, TableLayout};
pub use factory::create_kv_store;
pub use memory_backend::MemoryStore;
pub use postgres_backend::PostgresStore;
pub use redis_backend::RedisStore;

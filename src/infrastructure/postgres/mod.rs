//! PostgreSQL persistence module.
//!
//! Provides connection pooling for the PostgreSQL item table.

pub mod pool;

pub use pool::{PostgresPool, PostgresPoolError};

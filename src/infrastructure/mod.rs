//! Infrastructure layer modules
//!
//! This module contains shared infrastructure components:
//! - `postgres`: PostgreSQL connection pool
//! - `redis`: Redis connection pool
//! - `resilience`: circuit breaker and exponential backoff

pub mod postgres;
pub mod redis;
pub mod resilience;

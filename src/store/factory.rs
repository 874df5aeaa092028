//! Item table factory

use std::sync::Arc;

use crate::config::StoreConfig;
use crate::infrastructure::postgres::PostgresPool;
use crate::infrastructure::redis::RedisPool;
use crate::infrastructure::resilience::{CircuitBreaker, CircuitBreakerConfig};

use super::backend::{KvStore, StoreError, TableLayout};
use super::memory_backend::MemoryStore;
use super::postgres_backend::PostgresStore;
use super::redis_backend::RedisStore;

impl From<&StoreConfig> for TableLayout {
    fn from(config: &StoreConfig) -> Self {
        Self {
            table_name: config.table_name.clone(),
            chunk_key_name: config.chunk_key_name.clone(),
            sort_key_name: config.sort_key_name.clone(),
            ttl_attribute_name: config.ttl_attribute_name.clone(),
        }
    }
}

/// Create the item table based on configuration.
///
/// - `"postgres"`: connects to `postgres_url` and creates the table if missing
/// - `"redis"`: one hash per chunk under `redis_prefix`
/// - `"memory"` (default): in-process map
///
/// Each networked backend gets its own circuit breaker.
pub async fn create_kv_store(settings: &StoreConfig) -> Result<Arc<dyn KvStore>, StoreError> {
    let layout = TableLayout::from(settings);

    match settings.backend.as_str() {
        "postgres" => {
            let breaker = Arc::new(CircuitBreaker::new(
                "postgres",
                CircuitBreakerConfig::from(settings),
            ));
            let pool = PostgresPool::connect(settings, breaker)
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;

            let store = PostgresStore::new(pool, layout)?;
            store.ensure_schema().await?;

            tracing::info!(
                backend = "postgres",
                table = %store.layout().table_name,
                "Creating PostgreSQL item table"
            );
            Ok(Arc::new(store))
        }
        "redis" => {
            let breaker = Arc::new(CircuitBreaker::new(
                "redis",
                CircuitBreakerConfig::from(settings),
            ));
            let pool = RedisPool::new(&settings.redis_url, breaker)
                .map_err(|e| StoreError::InvalidConfig(e.to_string()))?;

            tracing::info!(
                backend = "redis",
                prefix = %settings.redis_prefix,
                table = %layout.table_name,
                "Creating Redis item table"
            );
            Ok(Arc::new(RedisStore::new(pool, layout, &settings.redis_prefix)?))
        }
        other => {
            if other != "memory" {
                tracing::warn!(backend = %other, "Unknown store backend, falling back to memory");
            }
            tracing::info!(backend = "memory", table = %layout.table_name, "Creating memory item table");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(backend: &str) -> StoreConfig {
        StoreConfig {
            backend: backend.to_string(),
            table_name: "queue_table".to_string(),
            chunk_key_name: "ckey".to_string(),
            sort_key_name: "skey".to_string(),
            ttl_attribute_name: "expired".to_string(),
            redis_url: "redis://localhost:6379".to_string(),
            redis_prefix: "opeq".to_string(),
            ..StoreConfig::default()
        }
    }

    #[test]
    fn test_layout_from_config() {
        let layout = TableLayout::from(&config("memory"));
        assert_eq!(layout, TableLayout::default());
    }

    #[tokio::test]
    async fn test_memory_default() {
        let store = create_kv_store(&config("memory")).await.unwrap();
        assert_eq!(store.backend_name(), "memory");

        let store = create_kv_store(&config("dynamodb")).await.unwrap();
        assert_eq!(store.backend_name(), "memory");
    }

    #[tokio::test]
    async fn test_redis_connects_lazily() {
        let store = create_kv_store(&config("redis")).await.unwrap();
        assert_eq!(store.backend_name(), "redis");
    }

    #[tokio::test]
    async fn test_postgres_requires_url() {
        let result = create_kv_store(&config("postgres")).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }
}

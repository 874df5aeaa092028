//! Redis item table.
//!
//! Each chunk is a hash at `{prefix}:{table}:c:{chunk_key}` whose fields are
//! sort keys and whose values are JSON rows named after the configured
//! attribute names. A set at `{prefix}:{table}:idx` indexes the chunks so
//! the expiry sweep can find them. Chunk hashes and the index live under
//! different namespaces, so no chunk key can name the index.
//!
//! Redis hash fields have no TTL of their own; expired rows are removed by
//! `delete_expired`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use serde_json::{Map, Value};

use crate::infrastructure::redis::{PoolError, RedisPool};
use crate::infrastructure::resilience::CircuitState;
use crate::queue::{expiry_from_epoch, QueueItem, SortKey};

use super::backend::{validate_identifier, KvStore, StoreError, TableLayout};

/// Field holding the caller payload inside a row.
const PAYLOAD_FIELD: &str = "data";

/// Redis-backed item table.
pub struct RedisStore {
    pool: RedisPool,
    layout: TableLayout,
    key_prefix: String,
}

impl RedisStore {
    pub fn new(pool: RedisPool, layout: TableLayout, prefix: &str) -> Result<Self, StoreError> {
        for name in [
            &layout.table_name,
            &layout.chunk_key_name,
            &layout.sort_key_name,
            &layout.ttl_attribute_name,
        ] {
            validate_identifier(name)?;
        }

        let key_prefix = format!("{}:{}", prefix, layout.table_name);
        Ok(Self {
            pool,
            layout,
            key_prefix,
        })
    }

    fn chunk_key(&self, chunk_key: &str) -> String {
        format!("{}:c:{}", self.key_prefix, chunk_key)
    }

    fn index_key(&self) -> String {
        format!("{}:idx", self.key_prefix)
    }

    fn map_error(err: PoolError) -> StoreError {
        match err {
            PoolError::Redis(e) => StoreError::Redis(e),
            PoolError::CircuitOpen => StoreError::Unavailable("Circuit breaker is open".to_string()),
        }
    }

    fn encode_row(&self, item: &QueueItem) -> Result<String, StoreError> {
        let mut row = Map::new();
        row.insert(
            self.layout.chunk_key_name.clone(),
            Value::String(item.chunk_key.clone()),
        );
        row.insert(
            self.layout.sort_key_name.clone(),
            Value::String(item.sort_key.to_string()),
        );
        row.insert(PAYLOAD_FIELD.to_string(), Value::String(item.payload.clone()));
        row.insert(
            self.layout.ttl_attribute_name.clone(),
            Value::from(item.expires_at_epoch()),
        );
        Ok(serde_json::to_string(&Value::Object(row))?)
    }

    fn decode_row(&self, chunk_key: &str, field: &str, raw: &str) -> Option<QueueItem> {
        let sort_key = match SortKey::parse(field) {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!(chunk_key = %chunk_key, error = %e, "Skipping hash field with unparseable sort key");
                return None;
            }
        };

        let row: Value = match serde_json::from_str(raw) {
            Ok(row) => row,
            Err(e) => {
                tracing::warn!(chunk_key = %chunk_key, sort_key = %sort_key, error = %e, "Skipping malformed row");
                return None;
            }
        };

        let payload = row.get(PAYLOAD_FIELD).and_then(Value::as_str)?.to_string();
        let expires = row
            .get(&self.layout.ttl_attribute_name)
            .and_then(Value::as_i64)?;

        Some(QueueItem {
            chunk_key: chunk_key.to_string(),
            sort_key,
            payload,
            expires_at: expiry_from_epoch(expires),
        })
    }

    async fn fetch_chunk(&self, chunk_key: &str) -> Result<Vec<QueueItem>, StoreError> {
        let key = self.chunk_key(chunk_key);

        let fields: Vec<(String, String)> = self
            .pool
            .execute(move |mut conn: MultiplexedConnection| async move {
                redis::cmd("HGETALL").arg(&key).query_async(&mut conn).await
            })
            .await
            .map_err(Self::map_error)?;

        let mut items: Vec<QueueItem> = fields
            .iter()
            .filter_map(|(field, raw)| self.decode_row(chunk_key, field, raw))
            .collect();
        items.sort_by(|a, b| a.sort_key.cmp(&b.sort_key));
        Ok(items)
    }
}

#[async_trait]
impl KvStore for RedisStore {
    fn backend_name(&self) -> &'static str {
        "redis"
    }

    fn circuit_state(&self) -> Option<CircuitState> {
        Some(self.pool.circuit_state())
    }

    async fn put_if_absent(&self, item: &QueueItem) -> Result<(), StoreError> {
        let row = self.encode_row(item)?;
        let key = self.chunk_key(&item.chunk_key);
        let index = self.index_key();
        let field = item.sort_key.to_string();
        let chunk = item.chunk_key.clone();

        let (added,): (bool,) = self
            .pool
            .execute(move |mut conn: MultiplexedConnection| async move {
                redis::pipe()
                    .atomic()
                    .cmd("HSETNX")
                    .arg(&key)
                    .arg(&field)
                    .arg(&row)
                    .cmd("SADD")
                    .arg(&index)
                    .arg(&chunk)
                    .ignore()
                    .query_async(&mut conn)
                    .await
            })
            .await
            .map_err(Self::map_error)?;

        if added {
            Ok(())
        } else {
            Err(StoreError::Conflict {
                chunk_key: item.chunk_key.clone(),
                sort_key: item.sort_key.to_string(),
            })
        }
    }

    async fn query(&self, chunk_key: &str) -> Result<Vec<QueueItem>, StoreError> {
        self.fetch_chunk(chunk_key).await
    }

    async fn delete(&self, chunk_key: &str, sort_key: &SortKey) -> Result<bool, StoreError> {
        let key = self.chunk_key(chunk_key);
        let field = sort_key.to_string();

        let removed: i64 = self
            .pool
            .execute(move |mut conn: MultiplexedConnection| async move {
                redis::cmd("HDEL").arg(&key).arg(&field).query_async(&mut conn).await
            })
            .await
            .map_err(Self::map_error)?;

        Ok(removed > 0)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let index = self.index_key();
        let chunks: Vec<String> = self
            .pool
            .execute(move |mut conn: MultiplexedConnection| async move {
                redis::cmd("SMEMBERS").arg(&index).query_async(&mut conn).await
            })
            .await
            .map_err(Self::map_error)?;

        let mut total = 0;
        for chunk in chunks {
            let expired: Vec<String> = self
                .fetch_chunk(&chunk)
                .await?
                .into_iter()
                .filter(|item| item.is_expired(now))
                .map(|item| item.sort_key.to_string())
                .collect();

            if expired.is_empty() {
                continue;
            }

            let key = self.chunk_key(&chunk);
            let removed: i64 = self
                .pool
                .execute(move |mut conn: MultiplexedConnection| async move {
                    redis::cmd("HDEL").arg(&key).arg(&expired).query_async(&mut conn).await
                })
                .await
                .map_err(Self::map_error)?;
            total += removed.max(0) as usize;

            // Drop the chunk from the index once its hash is gone
            let key = self.chunk_key(&chunk);
            let index = self.index_key();
            let member = chunk.clone();
            let _: () = self
                .pool
                .execute(move |mut conn: MultiplexedConnection| async move {
                    let remaining: i64 = redis::cmd("HLEN").arg(&key).query_async(&mut conn).await?;
                    if remaining == 0 {
                        let _: i64 = redis::cmd("SREM")
                            .arg(&index)
                            .arg(&member)
                            .query_async(&mut conn)
                            .await?;
                    }
                    Ok::<(), redis::RedisError>(())
                })
                .await
                .map_err(Self::map_error)?;
        }

        if total > 0 {
            tracing::debug!(
                table = %self.layout.table_name,
                expired = total,
                "Removed expired rows from Redis"
            );
        }

        Ok(total)
    }
}

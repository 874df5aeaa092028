//! PostgreSQL item table.
//!
//! Rows live in a table whose name and key/TTL column names come from the
//! configured `TableLayout`:
//!
//! ```sql
//! CREATE TABLE <table> (
//!     <chunk_key_name> TEXT NOT NULL,
//!     <sort_key_name>  TEXT COLLATE "C" NOT NULL,
//!     payload          TEXT NOT NULL,
//!     <ttl_name>       BIGINT NOT NULL,  -- epoch seconds
//!     PRIMARY KEY (<chunk_key_name>, <sort_key_name>)
//! );
//! ```
//!
//! Sort keys are compared with the "C" collation so database order is byte
//! order, which is `SortKey` order, even on tables created with another
//! default collation.
//!
//! PostgreSQL has no native TTL; expired rows are removed by `delete_expired`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::infrastructure::postgres::{PostgresPool, PostgresPoolError};
use crate::infrastructure::resilience::CircuitState;
use crate::queue::{expiry_from_epoch, QueueItem, SortKey};

use super::backend::{validate_identifier, KvStore, StoreError, TableLayout};

/// Error code of `unique_violation`.
const UNIQUE_VIOLATION: &str = "23505";

/// SQL statements rendered once from the table layout.
struct Statements {
    create_table: String,
    create_ttl_index: String,
    insert: String,
    select_chunk: String,
    select_last: String,
    delete_one: String,
    delete_expired: String,
}

impl Statements {
    fn render(layout: &TableLayout) -> Result<Self, StoreError> {
        for name in [
            &layout.table_name,
            &layout.chunk_key_name,
            &layout.sort_key_name,
            &layout.ttl_attribute_name,
        ] {
            validate_identifier(name)?;
        }

        let t = &layout.table_name;
        let ck = &layout.chunk_key_name;
        let sk = &layout.sort_key_name;
        let ttl = &layout.ttl_attribute_name;

        Ok(Self {
            create_table: format!(
                r#"CREATE TABLE IF NOT EXISTS "{t}" (
                    "{ck}" TEXT NOT NULL,
                    "{sk}" TEXT COLLATE "C" NOT NULL,
                    payload TEXT NOT NULL,
                    "{ttl}" BIGINT NOT NULL,
                    PRIMARY KEY ("{ck}", "{sk}")
                )"#
            ),
            create_ttl_index: format!(
                r#"CREATE INDEX IF NOT EXISTS "{t}_{ttl}_idx" ON "{t}" ("{ttl}")"#
            ),
            insert: format!(
                r#"INSERT INTO "{t}" ("{ck}", "{sk}", payload, "{ttl}")
                   VALUES ($1, $2, $3, $4)
                   ON CONFLICT ("{ck}", "{sk}") DO NOTHING"#
            ),
            select_chunk: format!(
                r#"SELECT "{sk}", payload, "{ttl}" FROM "{t}"
                   WHERE "{ck}" = $1 ORDER BY "{sk}" COLLATE "C" ASC"#
            ),
            select_last: format!(
                r#"SELECT MAX("{sk}" COLLATE "C") FROM "{t}" WHERE "{ck}" = $1"#
            ),
            delete_one: format!(r#"DELETE FROM "{t}" WHERE "{ck}" = $1 AND "{sk}" = $2"#),
            delete_expired: format!(r#"DELETE FROM "{t}" WHERE "{ttl}" <= $1"#),
        })
    }
}

/// PostgreSQL-backed item table.
pub struct PostgresStore {
    pool: PostgresPool,
    layout: TableLayout,
    sql: Statements,
}

impl PostgresStore {
    pub fn new(pool: PostgresPool, layout: TableLayout) -> Result<Self, StoreError> {
        let sql = Statements::render(&layout)?;
        Ok(Self { pool, layout, sql })
    }

    pub fn layout(&self) -> &TableLayout {
        &self.layout
    }

    /// Create the table and its TTL index if they are missing.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        let create_table = self.sql.create_table.clone();
        let create_index = self.sql.create_ttl_index.clone();

        self.pool
            .execute(move |pool: PgPool| async move {
                sqlx::query(&create_table).execute(&pool).await?;
                sqlx::query(&create_index).execute(&pool).await?;
                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(Self::map_error)?;

        tracing::info!(table = %self.layout.table_name, "PostgreSQL item table ready");
        Ok(())
    }

    fn map_error(err: PostgresPoolError) -> StoreError {
        match err {
            PostgresPoolError::Sqlx(e) => StoreError::Postgres(e),
            PostgresPoolError::CircuitOpen => {
                StoreError::Unavailable("Circuit breaker is open".to_string())
            }
            PostgresPoolError::MissingUrl => {
                StoreError::InvalidConfig("PostgreSQL URL is not configured".to_string())
            }
        }
    }

    fn row_to_item(
        &self,
        chunk_key: &str,
        (sort_key, payload, expires): (String, String, i64),
    ) -> Option<QueueItem> {
        match SortKey::parse(&sort_key) {
            Ok(sort_key) => Some(QueueItem {
                chunk_key: chunk_key.to_string(),
                sort_key,
                payload,
                expires_at: expiry_from_epoch(expires),
            }),
            Err(e) => {
                tracing::warn!(
                    chunk_key = %chunk_key,
                    error = %e,
                    "Skipping row with unparseable sort key"
                );
                None
            }
        }
    }
}

#[async_trait]
impl KvStore for PostgresStore {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    fn circuit_state(&self) -> Option<CircuitState> {
        Some(self.pool.circuit_state())
    }

    async fn put_if_absent(&self, item: &QueueItem) -> Result<(), StoreError> {
        let sql = self.sql.insert.clone();
        let chunk_key = item.chunk_key.clone();
        let sort_key = item.sort_key.to_string();
        let payload = item.payload.clone();
        let expires = item.expires_at_epoch();

        let result = self
            .pool
            .execute(move |pool: PgPool| async move {
                sqlx::query(&sql)
                    .bind(&chunk_key)
                    .bind(&sort_key)
                    .bind(&payload)
                    .bind(expires)
                    .execute(&pool)
                    .await
            })
            .await;

        let conflict = || StoreError::Conflict {
            chunk_key: item.chunk_key.clone(),
            sort_key: item.sort_key.to_string(),
        };

        match result {
            Ok(done) if done.rows_affected() == 0 => Err(conflict()),
            Ok(_) => Ok(()),
            Err(PostgresPoolError::Sqlx(sqlx::Error::Database(db)))
                if db.code().as_deref() == Some(UNIQUE_VIOLATION) =>
            {
                Err(conflict())
            }
            Err(e) => Err(Self::map_error(e)),
        }
    }

    async fn query(&self, chunk_key: &str) -> Result<Vec<QueueItem>, StoreError> {
        let sql = self.sql.select_chunk.clone();
        let key = chunk_key.to_string();

        let rows: Vec<(String, String, i64)> = self
            .pool
            .execute(move |pool: PgPool| async move {
                sqlx::query_as::<_, (String, String, i64)>(&sql).bind(&key).fetch_all(&pool).await
            })
            .await
            .map_err(Self::map_error)?;

        Ok(rows
            .into_iter()
            .filter_map(|row| self.row_to_item(chunk_key, row))
            .collect())
    }

    async fn last_sort_key(&self, chunk_key: &str) -> Result<Option<SortKey>, StoreError> {
        let sql = self.sql.select_last.clone();
        let key = chunk_key.to_string();

        let last: Option<String> = self
            .pool
            .execute(move |pool: PgPool| async move {
                sqlx::query_scalar::<_, Option<String>>(&sql).bind(&key).fetch_one(&pool).await
            })
            .await
            .map_err(Self::map_error)?;

        last.map(|s| SortKey::parse(&s).map_err(StoreError::InvalidConfig))
            .transpose()
    }

    async fn delete(&self, chunk_key: &str, sort_key: &SortKey) -> Result<bool, StoreError> {
        let sql = self.sql.delete_one.clone();
        let key = chunk_key.to_string();
        let sort = sort_key.to_string();

        let done = self
            .pool
            .execute(move |pool: PgPool| async move {
                sqlx::query(&sql).bind(&key).bind(&sort).execute(&pool).await
            })
            .await
            .map_err(Self::map_error)?;

        Ok(done.rows_affected() > 0)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let sql = self.sql.delete_expired.clone();
        let cutoff = now.timestamp();

        let done = self
            .pool
            .execute(move |pool: PgPool| async move {
                sqlx::query(&sql).bind(cutoff).execute(&pool).await
            })
            .await
            .map_err(Self::map_error)?;

        let count = done.rows_affected() as usize;
        if count > 0 {
            tracing::debug!(
                table = %self.layout.table_name,
                expired = count,
                "Removed expired rows from PostgreSQL"
            );
        }

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statements_use_layout_names() {
        let layout = TableLayout {
            table_name: "queue_table".into(),
            chunk_key_name: "ckey".into(),
            sort_key_name: "skey".into(),
            ttl_attribute_name: "expired".into(),
        };
        let sql = Statements::render(&layout).unwrap();

        assert!(sql.create_table.contains(r#"PRIMARY KEY ("ckey", "skey")"#));
        assert!(sql.insert.contains("ON CONFLICT"));
        assert!(sql.select_chunk.contains(r#"ORDER BY "skey" COLLATE "C" ASC"#));
        assert!(sql.select_last.contains(r#"MAX("skey" COLLATE "C")"#));
        assert!(sql.create_table.contains(r#""skey" TEXT COLLATE "C" NOT NULL"#));
        assert!(sql.delete_expired.contains(r#""expired" <= $1"#));
    }

    #[test]
    fn test_statements_reject_unsafe_names() {
        let layout = TableLayout {
            table_name: "queue\"; DROP TABLE x; --".into(),
            ..TableLayout::default()
        };
        assert!(matches!(
            Statements::render(&layout),
            Err(StoreError::InvalidConfig(_))
        ));
    }
}

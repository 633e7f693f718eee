//! RW-Shard Access
//!
//! While a shard is mutable its objects live in a dedicated PostgreSQL
//! table, `shard_{name}`, of `(key BYTEA PRIMARY KEY, content BYTEA)`
//! rows. The table exists from the shard's first write until the cleaner
//! drops it after packing.
//!
//! ## Why a Table per Shard?
//!
//! - Dropping a packed shard is one `DROP TABLE`, not a range delete over
//!   a hundred-billion-row table
//! - The packer scans exactly one shard's rows with no filtering
//! - Autovacuum is disabled per table: rows are written once, never
//!   updated, and the whole table is dropped at the end of its life
//!
//! ## Transactions
//!
//! `add_on` deliberately takes a caller-provided connection: the writer
//! facade runs the signature index insert, the row insert, and the
//! `inflight → present` flip in one transaction, which is what makes adds
//! exactly-once per `(signature, shard)`.

use sqlx::postgres::PgPool;
use sqlx::{PgConnection, Row};
use tracing::debug;

use crate::error::Result;

/// Table name for a shard's RW rows, derived from the 32-hex shard name.
pub fn table_name(shard_name: &str) -> String {
    format!("shard_{}", shard_name)
}

/// Handle to one shard's RW table.
pub struct RwShard {
    name: String,
    table: String,
    pool: PgPool,
}

impl RwShard {
    pub fn new(pool: PgPool, shard_name: &str) -> Self {
        Self {
            name: shard_name.to_string(),
            table: table_name(shard_name),
            pool,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Create the backing table if it does not exist yet.
    pub async fn create(&self) -> Result<()> {
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                 key BYTEA PRIMARY KEY,
                 content BYTEA
             ) WITH (autovacuum_enabled = false)",
            self.table
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Insert one object within the caller's transaction. Returns `true`
    /// when the row was written, `false` when the key already existed.
    pub async fn add_on(
        &self,
        conn: &mut PgConnection,
        key: &[u8],
        content: &[u8],
    ) -> Result<bool> {
        let result = sqlx::query(&format!(
            "INSERT INTO {} (key, content) VALUES ($1, $2)
             ON CONFLICT (key) DO NOTHING",
            self.table
        ))
        .bind(key)
        .bind(content)
        .execute(conn)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query(&format!(
            "SELECT content FROM {} WHERE key = $1",
            self.table
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("content")))
    }

    pub async fn contains(&self, key: &[u8]) -> Result<bool> {
        let row = sqlx::query(&format!(
            "SELECT 1 AS one FROM {} WHERE key = $1",
            self.table
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// Cumulative content size in bytes - the shard's logical size for
    /// the fill decision.
    pub async fn size(&self) -> Result<u64> {
        let row = sqlx::query(&format!(
            "SELECT COALESCE(SUM(OCTET_LENGTH(content)), 0)::BIGINT AS size FROM {}",
            self.table
        ))
        .fetch_one(&self.pool)
        .await?;
        let size: i64 = row.get("size");
        Ok(size as u64)
    }

    pub async fn count(&self) -> Result<u64> {
        let row = sqlx::query(&format!("SELECT COUNT(*) AS n FROM {}", self.table))
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.get("n");
        Ok(n as u64)
    }

    /// One page of rows ordered by key; drives the packer's streaming
    /// iteration without buffering the shard in memory.
    pub async fn fetch_batch(
        &self,
        after: Option<&[u8]>,
        limit: i64,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let rows = sqlx::query(&format!(
            "SELECT key, content FROM {}
             WHERE $1::bytea IS NULL OR key > $1
             ORDER BY key
             LIMIT $2",
            self.table
        ))
        .bind(after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| (r.get("key"), r.get("content")))
            .collect())
    }

    /// Destroy the backing table. Only the cleaner calls this, while it
    /// holds the shard in `cleaning`.
    pub async fn drop_table(&self) -> Result<()> {
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", self.table))
            .execute(&self.pool)
            .await?;
        debug!(shard = %self.name, "rw table dropped");
        Ok(())
    }

    /// Whether the backing table still exists.
    pub async fn exists(&self) -> Result<bool> {
        let row = sqlx::query("SELECT to_regclass($1) IS NOT NULL AS present")
            .bind(&self.table)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("present"))
    }
}

//! Throttler Telemetry Tables
//!
//! Each worker process owns one row in `t_read` and one in `t_write` and
//! refreshes it with its recently observed bytes-per-second. Aggregating
//! the fresh rows tells every worker how many peers are active and how
//! much bandwidth they are consuming - the raw material for the
//! cluster-wide rate limiting policy in `winery-store`.
//!
//! The throttler may share the catalog database or use one of its own
//! (`throttler.db`), so this module self-creates its tables on connect in
//! addition to their presence in the catalog migrations.
//!
//! ## Freshness Windows
//!
//! - Rows updated within the last 5 minutes count toward the aggregate;
//!   anything older belongs to a dead worker and is ignored.
//! - Rows untouched for 30 days are deleted opportunistically at startup
//!   (`FOR UPDATE SKIP LOCKED`, so concurrent starters do not serialize).

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::Row;
use std::str::FromStr;
use tracing::debug;

use crate::error::Result;

/// Which telemetry table a row lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    Read,
    Write,
}

impl IoDirection {
    fn table(self) -> &'static str {
        match self {
            IoDirection::Read => "t_read",
            IoDirection::Write => "t_write",
        }
    }
}

/// Handle to the throttler telemetry tables.
#[derive(Clone)]
pub struct ThrottlerDb {
    pool: PgPool,
}

impl ThrottlerDb {
    /// Connect and make sure the telemetry tables exist.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = PgConnectOptions::from_str(url)?;
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.ensure_tables().await?;
        Ok(db)
    }

    /// Wrap an existing pool (tests, shared-database deployments).
    pub async fn from_pool(pool: PgPool) -> Result<Self> {
        let db = Self { pool };
        db.ensure_tables().await?;
        Ok(db)
    }

    async fn ensure_tables(&self) -> Result<()> {
        for direction in [IoDirection::Read, IoDirection::Write] {
            let table = direction.table();
            sqlx::query(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                     id SERIAL PRIMARY KEY,
                     updated TIMESTAMP NOT NULL,
                     bytes INTEGER NOT NULL
                 )"
            ))
            .execute(&self.pool)
            .await?;
            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS {table}_updated ON {table} USING BRIN (updated)"
            ))
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    /// Insert this worker's row and prune rows from long-dead workers.
    pub async fn register(&self, direction: IoDirection) -> Result<i32> {
        let table = direction.table();

        let row = sqlx::query(&format!(
            "INSERT INTO {table} (updated, bytes) VALUES (NOW(), 0) RETURNING id"
        ))
        .fetch_one(&self.pool)
        .await?;
        let id: i32 = row.get("id");

        let pruned = sqlx::query(&format!(
            "DELETE FROM {table} WHERE id IN (
                 SELECT id FROM {table}
                 WHERE updated < NOW() - INTERVAL '30 days'
                 FOR UPDATE SKIP LOCKED
             )"
        ))
        .execute(&self.pool)
        .await?;
        if pruned.rows_affected() > 0 {
            debug!(table, pruned = pruned.rows_affected(), "stale telemetry rows removed");
        }

        Ok(id)
    }

    /// Refresh this worker's observed bytes-per-second.
    pub async fn update(&self, direction: IoDirection, id: i32, bytes: i32) -> Result<()> {
        sqlx::query(&format!(
            "UPDATE {} SET updated = NOW(), bytes = $1 WHERE id = $2",
            direction.table()
        ))
        .bind(bytes)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// `(active workers, total bytes-per-second)` over fresh, non-idle
    /// rows.
    pub async fn aggregate(&self, direction: IoDirection) -> Result<(i64, i64)> {
        let row = sqlx::query(&format!(
            "SELECT COUNT(*) AS workers, COALESCE(SUM(bytes), 0) AS total
             FROM {}
             WHERE bytes > 0 AND updated > NOW() - INTERVAL '5 minutes'",
            direction.table()
        ))
        .fetch_one(&self.pool)
        .await?;

        Ok((row.get("workers"), row.get("total")))
    }

    /// Remove this worker's row on shutdown.
    pub async fn deregister(&self, direction: IoDirection, id: i32) -> Result<()> {
        sqlx::query(&format!("DELETE FROM {} WHERE id = $1", direction.table()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

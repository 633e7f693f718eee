//! Catalog Access Layer
//!
//! [`Catalog`] wraps a PostgreSQL connection pool and exposes the shard
//! lifecycle and signature index operations. Every mutation is either a
//! plain INSERT with `ON CONFLICT` handling or a conditional UPDATE that
//! gates on the expected `(state, locker)` - the catalog never trusts the
//! caller's view of the world.
//!
//! ## Runtime Queries
//!
//! This module uses runtime queries (`sqlx::query`) instead of the
//! compile-time checked macros so the workspace builds without a live
//! DATABASE_URL. Row decoding goes through `sqlx::FromRow` on the row
//! types in [`crate::types`].
//!
//! ## Transactions
//!
//! The writer combines "create the index entry", "insert the bytes into
//! the RW-shard table" and "flip the entry to present" into one
//! transaction for exactly-once adds. The signature operations therefore
//! exist in two forms: pool-level methods on [`Catalog`], and `*_on`
//! associated functions taking a `&mut PgConnection` for use inside a
//! caller-owned transaction.

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::{PgConnection, Row};
use std::str::FromStr;
use tracing::debug;
use uuid::Uuid;

use crate::error::{CatalogError, Result};
use crate::types::{InsertOutcome, Shard, ShardState, SignatureState};

const SHARD_COLUMNS: &str = "id, state, locker_ts, locker, name, mapped_on_hosts_when_packed";

/// Handle to the catalog database.
#[derive(Clone)]
pub struct Catalog {
    pool: PgPool,
}

impl Catalog {
    /// Connect and apply pending migrations.
    pub async fn connect(url: &str, application_name: Option<&str>) -> Result<Self> {
        let mut options = PgConnectOptions::from_str(url)?;
        if let Some(name) = application_name {
            options = options.application_name(name);
        }
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Wrap an existing pool (tests, embedded deployments). Migrations are
    /// the caller's responsibility.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // ============================================================
    // SHARD LIFECYCLE
    // ============================================================

    /// Take a RW shard for writing: lock an unlocked `standby` shard if
    /// one exists, otherwise create a fresh shard directly in `writing`.
    pub async fn acquire_rw_shard(&self, locker: Uuid) -> Result<Shard> {
        if let Some(shard) = self
            .lock_one_shard(ShardState::Standby, ShardState::Writing, locker)
            .await?
        {
            return Ok(shard);
        }
        self.create_shard(locker).await
    }

    /// Lock one shard currently in `current`, moving it to `new`.
    ///
    /// `SELECT … FOR UPDATE SKIP LOCKED` keeps concurrent callers from
    /// serializing on the same candidate row; losers simply pick the next
    /// shard or create their own.
    pub async fn lock_one_shard(
        &self,
        current: ShardState,
        new: ShardState,
        locker: Uuid,
    ) -> Result<Option<Shard>> {
        let mut tx = self.pool.begin().await?;

        let candidate = sqlx::query(
            "SELECT name FROM shards
             WHERE state = $1 AND locker IS NULL
             LIMIT 1
             FOR UPDATE SKIP LOCKED",
        )
        .bind(current)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = candidate else {
            return Ok(None);
        };
        let name: String = row.get("name");

        let shard = sqlx::query_as::<_, Shard>(&format!(
            "UPDATE shards
             SET state = $1, locker = $2, locker_ts = NOW()
             WHERE name = $3
             RETURNING {SHARD_COLUMNS}"
        ))
        .bind(new)
        .bind(locker)
        .bind(&name)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(shard = %shard.name, %locker, from = ?current, to = ?new, "shard locked");
        Ok(Some(shard))
    }

    /// Create a shard directly in `writing`, locked by `locker`.
    pub async fn create_shard(&self, locker: Uuid) -> Result<Shard> {
        let name = generate_shard_name();
        let shard = sqlx::query_as::<_, Shard>(&format!(
            "INSERT INTO shards (name, state, locker, locker_ts)
             VALUES ($1, 'writing', $2, NOW())
             RETURNING {SHARD_COLUMNS}"
        ))
        .bind(&name)
        .bind(locker)
        .fetch_one(&self.pool)
        .await?;

        debug!(shard = %shard.name, %locker, "shard created");
        Ok(shard)
    }

    /// Release an idle `writing` shard back to `standby`.
    pub async fn release_rw_shard(&self, name: &str, locker: Uuid) -> Result<()> {
        self.transition(name, ShardState::Writing, ShardState::Standby, Some(locker), None)
            .await?
            .then_some(())
            .ok_or_else(|| CatalogError::Conflict(format!("release of {name}")))
    }

    /// Flip the caller's `writing` shard to `full`.
    pub async fn mark_full(&self, name: &str, locker: Uuid) -> Result<()> {
        self.transition(name, ShardState::Writing, ShardState::Full, Some(locker), None)
            .await?
            .then_some(())
            .ok_or_else(|| CatalogError::Conflict(format!("mark_full of {name}")))
    }

    /// Claim a `full` shard for packing. Returns `false` when another
    /// packer won the race.
    pub async fn start_packing(&self, name: &str, locker: Uuid) -> Result<bool> {
        self.transition(name, ShardState::Full, ShardState::Packing, None, Some(locker))
            .await
    }

    /// Take over a `packing` shard whose locker went silent.
    ///
    /// The observed stale locker is part of the condition so two reclaimers
    /// racing for the same shard cannot both win.
    pub async fn reclaim_packing(
        &self,
        name: &str,
        stale_locker: Option<Uuid>,
        locker: Uuid,
        grace_secs: f64,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE shards
             SET locker = $1, locker_ts = NOW()
             WHERE name = $2 AND state = 'packing'
               AND locker IS NOT DISTINCT FROM $3
               AND locker_ts < NOW() - make_interval(secs => $4)",
        )
        .bind(locker)
        .bind(name)
        .bind(stale_locker)
        .bind(grace_secs)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// The RO-shard file is durably closed: `packing → packed`, unlock.
    /// This is the atomic visibility switch - readers resolving the shard
    /// after this commit take the RO path.
    pub async fn finish_packing(&self, name: &str, locker: Uuid) -> Result<()> {
        self.transition(name, ShardState::Packing, ShardState::Packed, Some(locker), None)
            .await?
            .then_some(())
            .ok_or_else(|| CatalogError::Conflict(format!("finish_packing of {name}")))
    }

    /// Pack failed cleanly: `packing → full`, unlock, so any packer can
    /// retry.
    pub async fn abort_packing(&self, name: &str, locker: Uuid) -> Result<()> {
        self.transition(name, ShardState::Packing, ShardState::Full, Some(locker), None)
            .await?
            .then_some(())
            .ok_or_else(|| CatalogError::Conflict(format!("abort_packing of {name}")))
    }

    /// Claim a `packed` shard for cleaning, requiring at least
    /// `min_mapped_hosts` hosts to have mapped the RO image. Returns
    /// `false` when the criteria are not met or another cleaner won.
    pub async fn start_cleaning(
        &self,
        name: &str,
        locker: Uuid,
        min_mapped_hosts: i32,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE shards
             SET state = 'cleaning', locker = $1, locker_ts = NOW()
             WHERE name = $2 AND state = 'packed' AND locker IS NULL
               AND cardinality(mapped_on_hosts_when_packed) >= $3",
        )
        .bind(locker)
        .bind(name)
        .bind(min_mapped_hosts)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// The RW table is gone: `cleaning → readonly`, unlock. Terminal.
    pub async fn finish_cleaning(&self, name: &str, locker: Uuid) -> Result<()> {
        self.transition(name, ShardState::Cleaning, ShardState::Readonly, Some(locker), None)
            .await?
            .then_some(())
            .ok_or_else(|| CatalogError::Conflict(format!("finish_cleaning of {name}")))
    }

    /// Clean failed before the table drop: `cleaning → packed`, unlock.
    pub async fn abort_cleaning(&self, name: &str, locker: Uuid) -> Result<()> {
        self.transition(name, ShardState::Cleaning, ShardState::Packed, Some(locker), None)
            .await?
            .then_some(())
            .ok_or_else(|| CatalogError::Conflict(format!("abort_cleaning of {name}")))
    }

    /// Refresh `locker_ts` on a shard this worker holds, so a long pack or
    /// clean is not mistaken for a dead one.
    pub async fn refresh_locker(&self, name: &str, locker: Uuid) -> Result<()> {
        let result = sqlx::query(
            "UPDATE shards SET locker_ts = NOW()
             WHERE name = $1 AND locker = $2",
        )
        .bind(name)
        .bind(locker)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() != 1 {
            return Err(CatalogError::Conflict(format!("refresh_locker of {name}")));
        }
        Ok(())
    }

    /// Record that `host` has the shard's image mapped read-only.
    /// Idempotent: appending the same host twice is a no-op.
    pub async fn record_mapped_host(&self, name: &str, host: &str) -> Result<()> {
        sqlx::query(
            "UPDATE shards
             SET mapped_on_hosts_when_packed = array_append(mapped_on_hosts_when_packed, $2)
             WHERE name = $1 AND NOT ($2 = ANY(mapped_on_hosts_when_packed))",
        )
        .bind(name)
        .bind(host)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// One conditional state flip. `expected_locker = Some(_)` gates on
    /// the current locker; `new_locker = None` clears the lock.
    async fn transition(
        &self,
        name: &str,
        from: ShardState,
        to: ShardState,
        expected_locker: Option<Uuid>,
        new_locker: Option<Uuid>,
    ) -> Result<bool> {
        debug_assert!(from.can_transition_to(to), "illegal transition {from:?} -> {to:?}");

        let check_locker = expected_locker.is_some();
        let result = sqlx::query(
            "UPDATE shards
             SET state = $1,
                 locker = $2,
                 locker_ts = (CASE WHEN $3 THEN NOW() ELSE NULL END)
             WHERE name = $4 AND state = $5
               AND (CASE WHEN $6 THEN locker IS NOT DISTINCT FROM $7
                         ELSE locker IS NULL END)",
        )
        .bind(to)
        .bind(new_locker)
        .bind(new_locker.is_some())
        .bind(name)
        .bind(from)
        .bind(check_locker)
        .bind(expected_locker)
        .execute(&self.pool)
        .await?;

        let moved = result.rows_affected() == 1;
        if moved {
            debug!(shard = %name, from = ?from, to = ?to, "shard state moved");
        }
        Ok(moved)
    }

    // ============================================================
    // SHARD QUERIES
    // ============================================================

    pub async fn shard_by_id(&self, id: i64) -> Result<Option<Shard>> {
        let shard = sqlx::query_as::<_, Shard>(&format!(
            "SELECT {SHARD_COLUMNS} FROM shards WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(shard)
    }

    pub async fn shard_by_name(&self, name: &str) -> Result<Option<Shard>> {
        let shard = sqlx::query_as::<_, Shard>(&format!(
            "SELECT {SHARD_COLUMNS} FROM shards WHERE name = $1"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(shard)
    }

    pub async fn shards_in_state(&self, state: ShardState) -> Result<Vec<Shard>> {
        let shards = sqlx::query_as::<_, Shard>(&format!(
            "SELECT {SHARD_COLUMNS} FROM shards WHERE state = $1 ORDER BY id"
        ))
        .bind(state)
        .fetch_all(&self.pool)
        .await?;
        Ok(shards)
    }

    pub async fn list_shards(&self) -> Result<Vec<Shard>> {
        let shards = sqlx::query_as::<_, Shard>(&format!(
            "SELECT {SHARD_COLUMNS} FROM shards ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(shards)
    }

    /// `packing` shards whose locker has not refreshed within the grace
    /// window - candidates for reclamation by another packer.
    pub async fn stale_packing_shards(&self, grace_secs: f64) -> Result<Vec<Shard>> {
        let shards = sqlx::query_as::<_, Shard>(&format!(
            "SELECT {SHARD_COLUMNS} FROM shards
             WHERE state = 'packing'
               AND locker_ts < NOW() - make_interval(secs => $1)
             ORDER BY id"
        ))
        .bind(grace_secs)
        .fetch_all(&self.pool)
        .await?;
        Ok(shards)
    }

    // ============================================================
    // SIGNATURE INDEX
    // ============================================================

    /// Create an `inflight` entry binding `signature` to `shard_id`, or
    /// report the existing binding.
    pub async fn insert_inflight(&self, signature: &[u8], shard_id: i64) -> Result<InsertOutcome> {
        let mut conn = self.pool.acquire().await?;
        Self::insert_inflight_on(&mut conn, signature, shard_id).await
    }

    /// Transaction-scoped form of [`Self::insert_inflight`].
    pub async fn insert_inflight_on(
        conn: &mut PgConnection,
        signature: &[u8],
        shard_id: i64,
    ) -> Result<InsertOutcome> {
        let inserted = sqlx::query(
            "INSERT INTO signature2shard (signature, state, shard)
             VALUES ($1, 'inflight', $2)
             ON CONFLICT (signature) DO NOTHING
             RETURNING signature",
        )
        .bind(signature)
        .bind(shard_id)
        .fetch_optional(&mut *conn)
        .await?;

        if inserted.is_some() {
            return Ok(InsertOutcome::Created);
        }

        // Entries are never removed, so the conflicting row is still there.
        let row = sqlx::query(
            "SELECT state, shard FROM signature2shard WHERE signature = $1",
        )
        .bind(signature)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| {
            CatalogError::Conflict("signature vanished between insert and select".into())
        })?;

        Ok(InsertOutcome::Exists {
            state: row.get("state"),
            shard_id: row.get("shard"),
        })
    }

    /// Flip the caller's `inflight` entry to `present` - the commit marker
    /// that makes the object visible to readers.
    pub async fn mark_present(&self, signature: &[u8], shard_id: i64) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        Self::mark_present_on(&mut conn, signature, shard_id).await
    }

    /// Transaction-scoped form of [`Self::mark_present`].
    pub async fn mark_present_on(
        conn: &mut PgConnection,
        signature: &[u8],
        shard_id: i64,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE signature2shard SET state = 'present'
             WHERE signature = $1 AND shard = $2 AND state = 'inflight'",
        )
        .bind(signature)
        .bind(shard_id)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() != 1 {
            return Err(CatalogError::Conflict(
                "mark_present found no inflight entry for this shard".into(),
            ));
        }
        Ok(())
    }

    /// Current state and shard binding of a signature, if any.
    pub async fn lookup(&self, signature: &[u8]) -> Result<Option<(SignatureState, i64)>> {
        let row = sqlx::query(
            "SELECT state, shard FROM signature2shard WHERE signature = $1",
        )
        .bind(signature)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| (r.get("state"), r.get("shard"))))
    }

    /// Soft delete: `present → deleted`. The shard is not rewritten.
    pub async fn mark_deleted(&self, signature: &[u8]) -> Result<()> {
        let result = sqlx::query(
            "UPDATE signature2shard SET state = 'deleted'
             WHERE signature = $1 AND state = 'present'",
        )
        .bind(signature)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() != 1 {
            return Err(CatalogError::NotFound("no present entry to delete".into()));
        }
        Ok(())
    }

    /// Admin repair: restore a deleted entry. The shard binding is frozen
    /// at first write, so the caller must name the recorded shard.
    pub async fn undelete(&self, signature: &[u8], shard_id: i64) -> Result<()> {
        let result = sqlx::query(
            "UPDATE signature2shard SET state = 'present'
             WHERE signature = $1 AND shard = $2 AND state = 'deleted'",
        )
        .bind(signature)
        .bind(shard_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() != 1 {
            return Err(CatalogError::NotFound(
                "no deleted entry for this signature and shard".into(),
            ));
        }
        Ok(())
    }

    /// Keyset-paginated enumeration of `present` signatures. Not a
    /// snapshot: entries added or deleted mid-iteration may or may not
    /// appear.
    pub async fn list_signatures(
        &self,
        after: Option<&[u8]>,
        limit: i64,
    ) -> Result<Vec<Vec<u8>>> {
        let rows = sqlx::query(
            "SELECT signature FROM signature2shard
             WHERE state = 'present' AND ($1::bytea IS NULL OR signature > $1)
             ORDER BY signature
             LIMIT $2",
        )
        .bind(after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.get("signature")).collect())
    }

    /// Number of index entries in `state` (test and monitoring helper).
    pub async fn count_signatures(&self, state: SignatureState) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM signature2shard WHERE state = $1",
        )
        .bind(state)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("n"))
    }
}

/// A fresh shard name: 32 lowercase hex characters. Doubles as the
/// RO-shard file name and, on block pools, the image name.
pub fn generate_shard_name() -> String {
    Uuid::new_v4().simple().to_string()
}

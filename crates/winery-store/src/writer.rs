//! Writer Facade
//!
//! [`WineryWriter`] owns at most one RW-shard at a time and lands client
//! `add` calls in it. The interesting part is the add transaction:
//!
//! ```text
//! BEGIN
//!   INSERT INTO signature2shard (sig, 'inflight', shard)  ON CONFLICT DO NOTHING
//!   INSERT INTO shard_{name} (key, content)               ON CONFLICT DO NOTHING
//!   UPDATE signature2shard SET state = 'present' ...
//! COMMIT
//! ```
//!
//! One transaction means exactly-once semantics per `(signature, shard)`:
//! a writer killed anywhere in the middle leaves nothing behind, and a
//! client retry simply runs the same idempotent statements again. The
//! `inflight → present` flip is the commit marker readers key on.
//!
//! ## Dedup Across Writers
//!
//! The signature primary key arbitrates concurrent adds of the same
//! object anywhere in the cluster:
//!
//! - `Created`: this writer owns the object; write the bytes.
//! - `Exists(inflight, own shard)`: a previous attempt on this very
//!   shard was interrupted; finish the job.
//! - `Exists(inflight, other shard)`: some other writer is on it; report
//!   success and write nothing.
//! - `Exists(present | deleted, _)`: the object already has its home
//!   (content is immutable per id, and deleted ids keep their binding).
//!
//! ## Shard Lifecycle Duties
//!
//! The writer tracks the shard's cumulative size, flips it `full` when
//! the threshold is crossed (the crossing object is accepted - at most
//! one object of overflow), optionally spawns an inline pack, and
//! releases an idle shard back to `standby` so its slot isn't parked
//! forever.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info};
use uuid::Uuid;

use winery_catalog::{Catalog, CatalogError, InsertOutcome, Shard, SignatureState};
use winery_core::{ObjectId, OBJECT_ID_LEN};

use crate::config::WineryConfig;
use crate::error::{Error, Result};
use crate::packer::Packer;
use crate::rwshard::RwShard;
use crate::throttler::Throttler;

/// What an `add` did. Both variants are success for the client; the
/// distinction is kept for callers that track dedup rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// The bytes were written by this call.
    Written,
    /// The object was already (being) stored; nothing was written.
    Exists,
}

struct OpenShard {
    shard: Shard,
    rw: RwShard,
    size: u64,
    last_write: Instant,
}

/// Accepts `add`/`delete` calls and drives the owned shard's lifecycle.
pub struct WineryWriter {
    catalog: Catalog,
    throttler: Arc<Throttler>,
    packer: Arc<Packer>,
    max_size: u64,
    rw_idle_timeout: Duration,
    pack_immediately: bool,
    locker: Uuid,
    open: Mutex<Option<OpenShard>>,
}

impl WineryWriter {
    pub fn new(
        catalog: Catalog,
        throttler: Arc<Throttler>,
        packer: Arc<Packer>,
        config: &WineryConfig,
    ) -> Self {
        Self {
            catalog,
            throttler,
            packer,
            max_size: config.shards.max_size,
            rw_idle_timeout: Duration::from_secs(config.shards.rw_idle_timeout),
            pack_immediately: config.packer.pack_immediately,
            locker: Uuid::new_v4(),
            open: Mutex::new(None),
        }
    }

    /// Store one object. Idempotent: re-adding an existing id is a
    /// success that writes nothing.
    pub async fn add(&self, id: &ObjectId, content: &[u8]) -> Result<AddOutcome> {
        self.throttler
            .throttle_write((OBJECT_ID_LEN + content.len()) as u64)
            .await?;

        let mut guard = self.open.lock().await;
        if guard.is_none() {
            *guard = Some(self.acquire_shard().await?);
        }
        let open = guard.as_mut().expect("shard acquired above");

        let signature = id.as_bytes().as_slice();
        let mut tx = self.catalog.pool().begin().await?;

        let outcome = match Catalog::insert_inflight_on(&mut tx, signature, open.shard.id).await? {
            InsertOutcome::Created => {
                open.rw.add_on(&mut tx, signature, content).await?;
                Catalog::mark_present_on(&mut tx, signature, open.shard.id).await?;
                tx.commit().await?;
                open.size += content.len() as u64;
                AddOutcome::Written
            }
            InsertOutcome::Exists {
                state: SignatureState::Inflight,
                shard_id,
            } if shard_id == open.shard.id => {
                // A previous attempt on this shard was interrupted
                // between phases; finish what it started.
                open.rw.add_on(&mut tx, signature, content).await?;
                Catalog::mark_present_on(&mut tx, signature, open.shard.id).await?;
                tx.commit().await?;
                open.size += content.len() as u64;
                AddOutcome::Written
            }
            InsertOutcome::Exists { state, shard_id } => {
                tx.rollback().await?;
                debug!(object = %id, ?state, shard_id, "add deduplicated");
                AddOutcome::Exists
            }
        };

        open.last_write = Instant::now();
        if open.size >= self.max_size {
            self.flip_full(&mut guard).await?;
        }
        Ok(outcome)
    }

    /// Soft delete: flips the index entry; shards are never rewritten.
    pub async fn delete(&self, id: &ObjectId) -> Result<()> {
        match self.catalog.mark_deleted(id.as_bytes()).await {
            Ok(()) => Ok(()),
            Err(CatalogError::NotFound(_)) => Err(Error::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    /// Voluntarily hand the current shard back to `standby` (shutdown
    /// path). A partially filled shard will be picked up and filled
    /// further by the next writer.
    pub async fn release(&self) -> Result<()> {
        let mut guard = self.open.lock().await;
        if let Some(open) = guard.take() {
            self.catalog
                .release_rw_shard(&open.shard.name, self.locker)
                .await?;
            debug!(shard = %open.shard.name, "shard released to standby");
        }
        Ok(())
    }

    /// Release the shard if nothing has been written for
    /// `shards.rw_idle_timeout`. Returns whether a release happened.
    pub async fn release_if_idle(&self) -> Result<bool> {
        let mut guard = self.open.lock().await;
        let idle = guard
            .as_ref()
            .is_some_and(|open| open.last_write.elapsed() >= self.rw_idle_timeout);
        if !idle {
            return Ok(false);
        }
        let open = guard.take().expect("checked above");
        self.catalog
            .release_rw_shard(&open.shard.name, self.locker)
            .await?;
        info!(shard = %open.shard.name, "idle shard released to standby");
        Ok(true)
    }

    async fn acquire_shard(&self) -> Result<OpenShard> {
        let shard = self.catalog.acquire_rw_shard(self.locker).await?;
        let rw = RwShard::new(self.catalog.pool().clone(), &shard.name);
        rw.create().await?;
        // A reused standby shard already holds rows; restore the size
        // accounting from the table itself.
        let size = rw.size().await?;
        debug!(shard = %shard.name, size, "rw shard opened");
        Ok(OpenShard {
            shard,
            rw,
            size,
            last_write: Instant::now(),
        })
    }

    async fn flip_full(&self, guard: &mut Option<OpenShard>) -> Result<()> {
        let open = guard.take().expect("caller holds an open shard");
        self.catalog.mark_full(&open.shard.name, self.locker).await?;
        info!(shard = %open.shard.name, size = open.size, "shard full");

        if self.pack_immediately {
            let packer = Arc::clone(&self.packer);
            let name = open.shard.name.clone();
            tokio::spawn(async move {
                if let Err(e) = packer.pack(&name).await {
                    error!(shard = %name, error = %e, "inline pack failed");
                }
            });
        }
        Ok(())
    }
}

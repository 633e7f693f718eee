//! Packer - RW-Shard to RO-Shard Conversion
//!
//! The packer turns a `full` RW-shard (a PostgreSQL table) into an
//! immutable, perfect-hash-indexed shard file on the pool, then flips the
//! shard to `packed` - the single atomic switch that moves readers from
//! the RW path to the RO path.
//!
//! ## Pipeline
//!
//! 1. **Claim**: conditional `full → packing` with this packer as locker.
//!    Losing the race is normal - another packer took it.
//! 2. **Provision**: create the pool image, or wait (bounded backoff) for
//!    an externally created one when `create_images` is off.
//! 3. **Stream**: page through the RW rows in key order, writing payload
//!    frames. Memory holds the key set, never the payload.
//! 4. **Finalize**: build the perfect hash, write index + footer + header.
//! 5. **Verify**: reopen the file read-only, check the object count, and
//!    probe a sample of keys against the bytes that were streamed.
//! 6. **Publish**: `packing → packed`, clearing the locker.
//! 7. Optionally hand the shard straight to the cleaner
//!    (`clean_immediately`).
//!
//! ## Failure Handling
//!
//! - Clean failures (pool unavailable, database hiccup) unlock back to
//!   `full` so any packer retries later.
//! - Corruption detected during verification leaves the shard locked in
//!   `packing` for an operator: retrying cannot fix a bad file, and the
//!   lock is the audit trail.
//! - A packer that dies silently leaves `packing` + a stale `locker_ts`;
//!   `run_once` reclaims such shards after the grace window and packs
//!   them again, overwriting the half-written file under the same name.
//!
//! Long packs refresh `locker_ts` once a minute so a live pack is never
//! mistaken for a dead one.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use winery_catalog::{Catalog, ShardState};
use winery_core::{Error as ShardError, ObjectId, ShardFile, ShardFileWriter};

use crate::cleaner::Cleaner;
use crate::config::PackerConfig;
use crate::error::{Error, Result};
use crate::pool::ShardPool;
use crate::rwshard::RwShard;
use crate::throttler::Throttler;

/// Rows fetched per page while streaming a shard.
const PACK_BATCH: i64 = 1000;

/// Keep one verification sample roughly every this many objects.
const SAMPLE_STRIDE: u64 = 997;

/// Upper bound on retained verification samples.
const SAMPLE_CAP: usize = 64;

/// Locker heartbeat period during long packs.
const LOCK_REFRESH: Duration = Duration::from_secs(60);

/// Converts full RW-shards into RO-shard files.
pub struct Packer {
    catalog: Catalog,
    pool: Arc<dyn ShardPool>,
    throttler: Arc<Throttler>,
    config: PackerConfig,
    max_size: u64,
    cleaner: Cleaner,
    locker: Uuid,
}

impl Packer {
    pub fn new(
        catalog: Catalog,
        pool: Arc<dyn ShardPool>,
        throttler: Arc<Throttler>,
        config: PackerConfig,
        max_size: u64,
        cleaner: Cleaner,
    ) -> Self {
        Self {
            catalog,
            pool,
            throttler,
            config,
            max_size,
            cleaner,
            locker: Uuid::new_v4(),
        }
    }

    /// Pack one `full` shard. Returns `false` when another packer claimed
    /// it first.
    pub async fn pack(&self, name: &str) -> Result<bool> {
        if !self.catalog.start_packing(name, self.locker).await? {
            debug!(shard = name, "not full or already claimed by another packer");
            return Ok(false);
        }
        self.pack_claimed(name).await?;
        Ok(true)
    }

    /// Pack and sweep everything eligible: every `full` shard, plus
    /// `packing` shards whose locker went silent past the grace window.
    pub async fn run_once(&self) -> Result<usize> {
        let mut packed = 0;

        for shard in self.catalog.shards_in_state(ShardState::Full).await? {
            match self.pack(&shard.name).await {
                Ok(true) => packed += 1,
                Ok(false) => {}
                Err(e) => error!(shard = %shard.name, error = %e, "pack failed"),
            }
        }

        let grace = self.config.lock_grace as f64;
        for shard in self.catalog.stale_packing_shards(grace).await? {
            let reclaimed = self
                .catalog
                .reclaim_packing(&shard.name, shard.locker, self.locker, grace)
                .await?;
            if !reclaimed {
                continue;
            }
            warn!(
                shard = %shard.name,
                stale_locker = ?shard.locker,
                "reclaimed abandoned packing shard"
            );
            match self.pack_claimed(&shard.name).await {
                Ok(()) => packed += 1,
                Err(e) => error!(shard = %shard.name, error = %e, "repack failed"),
            }
        }

        Ok(packed)
    }

    /// Sweep forever.
    pub async fn run(&self, interval: Duration) {
        info!(interval_seconds = interval.as_secs(), "packer started");
        loop {
            match self.run_once().await {
                Ok(0) => {}
                Ok(packed) => info!(packed, "packer pass complete"),
                Err(e) => error!(error = %e, "packer pass failed"),
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Finish a pack the caller already holds the `packing` lock for.
    async fn pack_claimed(&self, name: &str) -> Result<()> {
        match self.build_shard_file(name).await {
            Ok(object_count) => {
                self.catalog.finish_packing(name, self.locker).await?;
                info!(shard = name, objects = object_count, "shard packed");
                if self.config.clean_immediately {
                    self.cleaner.clean(name).await?;
                }
                Ok(())
            }
            Err(e @ Error::Shard(_)) => {
                // Corruption: keep the lock so an operator sees exactly
                // which shard and which packer.
                error!(shard = name, error = %e, "pack produced a corrupt shard file");
                Err(e)
            }
            Err(e) => {
                warn!(shard = name, error = %e, "pack failed, unlocking for retry");
                self.catalog.abort_packing(name, self.locker).await?;
                Err(e)
            }
        }
    }

    /// Stream the RW rows into a shard file and verify the result.
    async fn build_shard_file(&self, name: &str) -> Result<u64> {
        let rw = RwShard::new(self.catalog.pool().clone(), name);

        let path = if self.config.create_images {
            self.pool.create(name, self.max_size * 2).await?
        } else {
            self.pool
                .ensure_visible(name, Duration::from_secs(self.config.image_wait_timeout))
                .await?
        };

        let mut writer = ShardFileWriter::create(&path)?;
        let mut samples: Vec<(ObjectId, Vec<u8>)> = Vec::new();
        let mut last: Option<(ObjectId, Vec<u8>)> = None;
        let mut after: Option<Vec<u8>> = None;
        let mut last_refresh = Instant::now();

        loop {
            let batch = rw.fetch_batch(after.as_deref(), PACK_BATCH).await?;
            if batch.is_empty() {
                break;
            }
            after = Some(batch.last().expect("non-empty batch").0.clone());

            for (key, content) in batch {
                let id = ObjectId::from_slice(&key)?;
                self.throttler
                    .throttle_write((key.len() + content.len()) as u64)
                    .await?;
                writer.write(&id, &content)?;

                let n = writer.count();
                if (n == 1 || n % SAMPLE_STRIDE == 0) && samples.len() < SAMPLE_CAP {
                    samples.push((id, content.clone()));
                }
                last = Some((id, content));
            }

            if last_refresh.elapsed() >= LOCK_REFRESH {
                self.catalog.refresh_locker(name, self.locker).await?;
                last_refresh = Instant::now();
            }
        }

        if let Some(last) = last {
            samples.push(last);
        }

        let object_count = writer.count();
        writer.finalize()?;
        self.verify(&path, object_count, &samples)?;

        debug!(shard = name, objects = object_count, path = %path.display(), "shard file written");
        Ok(object_count)
    }

    /// Reopen the finished file and probe the sampled keys.
    fn verify(
        &self,
        path: &std::path::Path,
        expected_count: u64,
        samples: &[(ObjectId, Vec<u8>)],
    ) -> Result<()> {
        let file = ShardFile::open(path)?;
        if file.count() != expected_count {
            return Err(Error::Shard(ShardError::Corrupt(format!(
                "shard file holds {} objects, packed {}",
                file.count(),
                expected_count
            ))));
        }
        for (id, content) in samples {
            match file.get(id)? {
                Some(bytes) if bytes == *content => {}
                Some(_) => {
                    return Err(Error::Shard(ShardError::Corrupt(format!(
                        "content mismatch for {} after pack",
                        id
                    ))))
                }
                None => {
                    return Err(Error::Shard(ShardError::Corrupt(format!(
                        "object {} missing after pack",
                        id
                    ))))
                }
            }
        }
        Ok(())
    }
}

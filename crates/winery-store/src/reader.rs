//! Reader Facade
//!
//! [`WineryReader`] resolves object ids through the signature index and
//! fetches bytes from whichever form of the shard is authoritative:
//!
//! ```text
//! get(id)
//!   │ signature2shard: must be 'present' (inflight/deleted → NotFound)
//!   ▼
//! shards.state ──writing|full|packing──▶ RW table lookup
//!        │
//!        └──packed|cleaning|readonly──▶ RO-shard file lookup
//! ```
//!
//! The branch is re-evaluated on every request, which is what makes the
//! packer's `packing → packed` flip an atomic visibility switch: the
//! next read simply lands on the other side.
//!
//! ## The Cleaning Race
//!
//! Between the reader's state lookup and its RW fetch, a shard can get
//! packed and its table dropped. The reader handles a failed RW fetch by
//! re-reading the shard state: if the shard moved to the RO side, the
//! read is retried there; a genuine inconsistency still surfaces.
//!
//! ## Shard File Cache
//!
//! Opening a shard file validates its index checksum - too expensive per
//! request. Open files are cached per shard name; they are immutable, so
//! the cache never invalidates.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use winery_catalog::{Catalog, Shard, SignatureState};
use winery_core::{Error as ShardError, ObjectId, ShardFile};

use crate::error::{Error, Result};
use crate::pool::ShardPool;
use crate::rwshard::RwShard;
use crate::throttler::Throttler;

/// Page size for `iter`.
const ITER_BATCH: i64 = 1000;

/// Read-side facade: `get`, `contains`, `iter`.
pub struct WineryReader {
    catalog: Catalog,
    pool: Arc<dyn ShardPool>,
    throttler: Arc<Throttler>,
    shard_files: RwLock<HashMap<String, Arc<ShardFile>>>,
}

impl WineryReader {
    pub fn new(catalog: Catalog, pool: Arc<dyn ShardPool>, throttler: Arc<Throttler>) -> Self {
        Self {
            catalog,
            pool,
            throttler,
            shard_files: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch an object's bytes. `inflight` and `deleted` ids are
    /// reported as missing.
    pub async fn get(&self, id: &ObjectId) -> Result<Vec<u8>> {
        let Some((SignatureState::Present, shard_id)) =
            self.catalog.lookup(id.as_bytes()).await?
        else {
            return Err(Error::NotFound);
        };

        let shard = self
            .catalog
            .shard_by_id(shard_id)
            .await?
            .ok_or(Error::NotFound)?;

        let content = self.read_from_shard(&shard, id).await?;
        self.throttler.throttle_read(content.len() as u64).await?;
        Ok(content)
    }

    /// Whether the object is present (not inflight, not deleted).
    pub async fn contains(&self, id: &ObjectId) -> Result<bool> {
        Ok(matches!(
            self.catalog.lookup(id.as_bytes()).await?,
            Some((SignatureState::Present, _))
        ))
    }

    /// Lazy enumeration of present object ids. No order guarantee for
    /// clients, no snapshot semantics.
    pub fn iter(&self) -> ObjectIdIter {
        ObjectIdIter {
            catalog: self.catalog.clone(),
            buffer: Vec::new(),
            after: None,
            done: false,
        }
    }

    async fn read_from_shard(&self, shard: &Shard, id: &ObjectId) -> Result<Vec<u8>> {
        if shard.state.uses_shard_file() {
            return self.read_from_file(&shard.name, id).await;
        }

        let rw = RwShard::new(self.catalog.pool().clone(), &shard.name);
        match rw.get(id.as_bytes()).await {
            Ok(Some(content)) => Ok(content),
            miss => {
                // The shard may have packed (and its table dropped)
                // since our state lookup; re-read the state once.
                let fresh = self
                    .catalog
                    .shard_by_name(&shard.name)
                    .await?
                    .ok_or(Error::NotFound)?;
                if fresh.state.uses_shard_file() {
                    debug!(shard = %shard.name, "shard packed mid-read, retrying on RO path");
                    return self.read_from_file(&shard.name, id).await;
                }
                match miss {
                    Ok(None) => Err(Error::NotFound),
                    Err(e) => Err(e),
                    Ok(Some(_)) => unreachable!("handled above"),
                }
            }
        }
    }

    async fn read_from_file(&self, name: &str, id: &ObjectId) -> Result<Vec<u8>> {
        let file = self.shard_file(name).await?;
        // The index says this shard holds the object; a miss in the
        // file is shard damage, not a client error.
        file.get(id)?.ok_or_else(|| {
            Error::Shard(ShardError::Corrupt(format!(
                "object {} indexed in shard {} but absent from its file",
                id, name
            )))
        })
    }

    /// Cached open handle for a shard file, opening and validating it on
    /// first use.
    async fn shard_file(&self, name: &str) -> Result<Arc<ShardFile>> {
        if let Some(file) = self.shard_files.read().await.get(name) {
            return Ok(Arc::clone(file));
        }

        let path = self.pool.open_ro(name).await?;
        let file = Arc::new(ShardFile::open(&path)?);

        let mut cache = self.shard_files.write().await;
        // A concurrent opener may have won; keep whichever landed first.
        let entry = cache
            .entry(name.to_string())
            .or_insert_with(|| Arc::clone(&file));
        Ok(Arc::clone(entry))
    }
}

/// Async iterator over present object ids, paged from the index.
pub struct ObjectIdIter {
    catalog: Catalog,
    buffer: Vec<Vec<u8>>,
    after: Option<Vec<u8>>,
    done: bool,
}

impl ObjectIdIter {
    /// Next object id, or `None` at the end of the index.
    pub async fn next(&mut self) -> Result<Option<ObjectId>> {
        if self.buffer.is_empty() && !self.done {
            let page = self
                .catalog
                .list_signatures(self.after.as_deref(), ITER_BATCH)
                .await?;
            if (page.len() as i64) < ITER_BATCH {
                self.done = true;
            }
            if let Some(last) = page.last() {
                self.after = Some(last.clone());
            }
            // Pop from the back; reverse to preserve index order.
            self.buffer = page;
            self.buffer.reverse();
        }

        match self.buffer.pop() {
            Some(signature) => Ok(Some(ObjectId::from_slice(&signature)?)),
            None => Ok(None),
        }
    }

    /// Drain the remaining ids into a vector (test helper).
    pub async fn collect_all(mut self) -> Result<Vec<ObjectId>> {
        let mut ids = Vec::new();
        while let Some(id) = self.next().await? {
            ids.push(id);
        }
        Ok(ids)
    }
}

//! Top-Level Facade
//!
//! [`Winery`] wires the catalog, pool, throttler, and facades together
//! from a [`WineryConfig`] and presents the client object-storage
//! contract: `add`, `get`, `contains`, `delete`, `iter`.
//!
//! A read-only configuration builds no writer at all; every mutating call
//! fails with [`Error::Readonly`] before touching the database.

use std::sync::Arc;

use winery_catalog::Catalog;
use winery_core::ObjectId;

use crate::cleaner::Cleaner;
use crate::config::WineryConfig;
use crate::error::{Error, Result};
use crate::packer::Packer;
use crate::pool::{build_pool, ShardPool};
use crate::reader::{ObjectIdIter, WineryReader};
use crate::throttler::Throttler;
use crate::writer::{AddOutcome, WineryWriter};

/// One Winery instance: a reader, and a writer unless configured
/// read-only.
pub struct Winery {
    catalog: Catalog,
    pool: Arc<dyn ShardPool>,
    reader: WineryReader,
    writer: Option<WineryWriter>,
}

impl Winery {
    /// Connect to the catalog, build the pool driver and throttler, and
    /// assemble the facades.
    pub async fn open(config: WineryConfig) -> Result<Self> {
        let catalog = Catalog::connect(
            &config.database.db,
            config.database.application_name.as_deref(),
        )
        .await?;
        let pool = build_pool(&config.shards_pool, config.shards.max_size)?;
        let throttler = Arc::new(
            Throttler::from_config(config.throttler.as_ref(), &config.database.db).await?,
        );

        let reader = WineryReader::new(catalog.clone(), Arc::clone(&pool), Arc::clone(&throttler));

        let writer = if config.readonly {
            None
        } else {
            let cleaner = Cleaner::new(
                catalog.clone(),
                Arc::clone(&pool),
                config.cleaner.min_mapped_hosts,
            );
            let packer = Arc::new(Packer::new(
                catalog.clone(),
                Arc::clone(&pool),
                Arc::clone(&throttler),
                config.packer.clone(),
                config.shards.max_size,
                cleaner,
            ));
            Some(WineryWriter::new(
                catalog.clone(),
                Arc::clone(&throttler),
                packer,
                &config,
            ))
        };

        Ok(Self {
            catalog,
            pool,
            reader,
            writer,
        })
    }

    /// Store an object. Idempotent.
    pub async fn add(&self, id: &ObjectId, content: &[u8]) -> Result<AddOutcome> {
        self.writer()?.add(id, content).await
    }

    /// Fetch an object's bytes.
    pub async fn get(&self, id: &ObjectId) -> Result<Vec<u8>> {
        self.reader.get(id).await
    }

    /// Whether an object is present.
    pub async fn contains(&self, id: &ObjectId) -> Result<bool> {
        self.reader.contains(id).await
    }

    /// Soft-delete an object.
    pub async fn delete(&self, id: &ObjectId) -> Result<()> {
        self.writer()?.delete(id).await
    }

    /// Enumerate present object ids.
    pub fn iter(&self) -> ObjectIdIter {
        self.reader.iter()
    }

    /// Shutdown path: return the writer's shard to `standby`.
    pub async fn release(&self) -> Result<()> {
        match &self.writer {
            Some(writer) => writer.release().await,
            None => Ok(()),
        }
    }

    pub fn reader(&self) -> &WineryReader {
        &self.reader
    }

    pub fn writer(&self) -> Result<&WineryWriter> {
        self.writer.as_ref().ok_or(Error::Readonly)
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn shard_pool(&self) -> &Arc<dyn ShardPool> {
        &self.pool
    }
}

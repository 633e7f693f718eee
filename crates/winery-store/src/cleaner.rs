//! RW-Shard Cleaner
//!
//! Once a shard is `packed` and enough hosts have mapped its RO image,
//! the RW table is dead weight: the cleaner drops it and flips the shard
//! to its terminal `readonly` state.
//!
//! Readers treat `cleaning` exactly like `packed` and `readonly` - the
//! RO file is authoritative - so there is no window in which the table
//! drop is observable.
//!
//! The replication gate (`min_mapped_hosts`) only applies to pools where
//! hosts map images individually. On a directory pool every host sees
//! every file the moment it exists, so the gate is waived.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};
use uuid::Uuid;

use winery_catalog::{Catalog, ShardState};

use crate::error::Result;
use crate::pool::ShardPool;
use crate::rwshard::RwShard;

/// Drops RW tables of packed shards once replication criteria are met.
pub struct Cleaner {
    catalog: Catalog,
    pool: Arc<dyn ShardPool>,
    min_mapped_hosts: i32,
    locker: Uuid,
}

impl Cleaner {
    pub fn new(catalog: Catalog, pool: Arc<dyn ShardPool>, min_mapped_hosts: i32) -> Self {
        Self {
            catalog,
            pool,
            min_mapped_hosts,
            locker: Uuid::new_v4(),
        }
    }

    /// Clean one `packed` shard. Returns `false` when the replication
    /// criteria are not met yet or another cleaner claimed it.
    pub async fn clean(&self, name: &str) -> Result<bool> {
        let min_hosts = if self.pool.requires_host_mapping() {
            self.min_mapped_hosts
        } else {
            0
        };

        if !self
            .catalog
            .start_cleaning(name, self.locker, min_hosts)
            .await?
        {
            return Ok(false);
        }

        let rw = RwShard::new(self.catalog.pool().clone(), name);
        match rw.drop_table().await {
            Ok(()) => {
                self.catalog.finish_cleaning(name, self.locker).await?;
                info!(shard = name, "shard cleaned, now readonly");
                Ok(true)
            }
            Err(e) => {
                self.catalog.abort_cleaning(name, self.locker).await?;
                Err(e)
            }
        }
    }

    /// Try to clean every `packed` shard.
    pub async fn run_once(&self) -> Result<usize> {
        let mut cleaned = 0;
        for shard in self.catalog.shards_in_state(ShardState::Packed).await? {
            match self.clean(&shard.name).await {
                Ok(true) => cleaned += 1,
                Ok(false) => {}
                Err(e) => error!(shard = %shard.name, error = %e, "clean failed"),
            }
        }
        Ok(cleaned)
    }

    /// Sweep forever.
    pub async fn run(&self, interval: Duration) {
        info!(interval_seconds = interval.as_secs(), "cleaner started");
        loop {
            match self.run_once().await {
                Ok(0) => {}
                Ok(cleaned) => info!(cleaned, "cleaner pass complete"),
                Err(e) => error!(error = %e, "cleaner pass failed"),
            }
            tokio::time::sleep(interval).await;
        }
    }
}

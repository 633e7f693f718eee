//! Image Manager for Block-Device Pools
//!
//! On an RBD deployment, every host that wants to read packed shards must
//! map their images into `/dev/rbd/...` itself. The image manager runs on
//! each host and keeps the local mappings in line with the catalog:
//!
//! - `packed | cleaning | readonly` shards: mapped read-only, and the
//!   host is recorded in `mapped_on_hosts_when_packed` - the signal the
//!   cleaner's replication gate counts.
//! - `standby | writing` shards, when this host provisions images for
//!   writers (`manage_rw_images`): image created and mapped read-write.
//!
//! Every pass is idempotent; a crashed or restarted manager simply
//! reconverges on the next pass. Directory pools have no manager - the
//! shared filesystem does all of this by existing.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use winery_catalog::{Catalog, ShardState};

use crate::error::Result;
use crate::pool::{RbdPool, ShardPool};

/// Keeps one host's RBD mappings aligned with the catalog.
pub struct ImageManager {
    catalog: Catalog,
    pool: Arc<RbdPool>,
    host: String,
    manage_rw_images: bool,
}

impl ImageManager {
    pub fn new(catalog: Catalog, pool: Arc<RbdPool>, host: String, manage_rw_images: bool) -> Self {
        Self {
            catalog,
            pool,
            host,
            manage_rw_images,
        }
    }

    /// One idempotent convergence pass.
    pub async fn run_once(&self) -> Result<()> {
        let existing: HashSet<String> = self.pool.list().await?.into_iter().collect();

        for shard in self.catalog.list_shards().await? {
            let outcome = match shard.state {
                ShardState::Standby | ShardState::Writing => {
                    if self.manage_rw_images && !existing.contains(&shard.name) {
                        self.provision_rw(&shard.name).await
                    } else {
                        Ok(())
                    }
                }
                ShardState::Packed | ShardState::Cleaning | ShardState::Readonly => {
                    if shard.mapped_on_hosts_when_packed.contains(&self.host) {
                        Ok(())
                    } else {
                        self.map_ro(&shard.name).await
                    }
                }
                // Mid-pack shards belong to their packer.
                ShardState::Full | ShardState::Packing => Ok(()),
            };

            if let Err(e) = outcome {
                error!(shard = %shard.name, state = ?shard.state, error = %e,
                       "image convergence failed, will retry next pass");
            }
        }
        Ok(())
    }

    async fn provision_rw(&self, name: &str) -> Result<()> {
        self.pool.image_create(name).await?;
        self.pool.image_map(name, false).await?;
        debug!(image = name, "rw image provisioned");
        Ok(())
    }

    async fn map_ro(&self, name: &str) -> Result<()> {
        // The image may still be mapped rw from its packing days.
        self.pool.image_remap_ro(name).await?;
        self.catalog.record_mapped_host(name, &self.host).await?;
        debug!(image = name, host = %self.host, "image mapped read-only");
        Ok(())
    }

    /// Converge forever.
    pub async fn run(&self, interval: Duration) {
        info!(
            host = %self.host,
            manage_rw_images = self.manage_rw_images,
            interval_seconds = interval.as_secs(),
            "image manager started"
        );
        loop {
            if let Err(e) = self.run_once().await {
                error!(error = %e, "image manager pass failed");
            }
            tokio::time::sleep(interval).await;
        }
    }
}

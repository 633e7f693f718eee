//! Shard Pools
//!
//! A pool is the durable home of RO-shard files. Two drivers share one
//! interface:
//!
//! - [`DirectoryPool`]: regular files on a shared filesystem; every host
//!   sees every file the moment it is written.
//! - [`RbdPool`]: one RBD image per shard in a Ceph pool; images must be
//!   provisioned and mapped into `/dev/rbd/...` before they are usable on
//!   a given host.
//!
//! The interface hands out *paths* rather than open handles: the shard
//! file layer (`winery-core`) owns all reads and writes, and a path works
//! identically for a regular file and a mapped block device.
//!
//! ## Visibility
//!
//! On a block pool, a shard being in the catalog does not mean its image
//! is usable on this host yet - creation and mapping may be delegated to
//! an external manager. [`ShardPool::ensure_visible`] encapsulates the
//! bounded-backoff wait for that window and fails with `PoolUnavailable`
//! past the deadline.

mod directory;
mod rbd;

pub use directory::DirectoryPool;
pub use rbd::RbdPool;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::PoolConfig;
use crate::error::{Error, Result};

/// Abstract storage for RO-shard files.
#[async_trait]
pub trait ShardPool: Send + Sync {
    /// Provision storage for a new shard and return a writable path.
    /// `size` is the capacity hint for fixed-size backends; directory
    /// pools ignore it.
    async fn create(&self, name: &str, size: u64) -> Result<PathBuf>;

    /// Path to an existing shard for reading. `PoolUnavailable` when the
    /// shard is not (yet) visible on this host.
    async fn open_ro(&self, name: &str) -> Result<PathBuf>;

    /// Remove a shard's storage. Idempotent.
    async fn delete(&self, name: &str) -> Result<()>;

    /// Names of all shards in the pool.
    async fn list(&self) -> Result<Vec<String>>;

    /// Whether this host can currently read the shard. Directory pools
    /// answer for the shared filesystem; block pools for the local
    /// device node.
    async fn host_mapped(&self, name: &str) -> Result<bool>;

    /// Whether `host_mapped` carries information: block pools need hosts
    /// to map images one by one, directory pools are visible everywhere
    /// by construction.
    fn requires_host_mapping(&self) -> bool;

    /// Wait for a shard to become visible, with exponential backoff
    /// bounded by `deadline`.
    async fn ensure_visible(&self, name: &str, deadline: Duration) -> Result<PathBuf> {
        let started = tokio::time::Instant::now();
        let mut backoff = Duration::from_millis(100);
        loop {
            match self.open_ro(name).await {
                Ok(path) => return Ok(path),
                Err(Error::PoolUnavailable(_)) if started.elapsed() < deadline => {
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(5));
                }
                Err(Error::PoolUnavailable(reason)) => {
                    return Err(Error::PoolUnavailable(format!(
                        "{reason} (gave up after {:?})",
                        deadline
                    )));
                }
                Err(other) => return Err(other),
            }
        }
    }
}

/// Build the pool driver described by the configuration.
pub fn build_pool(config: &PoolConfig, shard_max_size: u64) -> Result<Arc<dyn ShardPool>> {
    match config {
        PoolConfig::Directory {
            base_directory,
            pool_name,
        } => Ok(Arc::new(DirectoryPool::new(base_directory, pool_name)?)),
        PoolConfig::Rbd {
            pool_name,
            data_pool_name,
            use_sudo,
            map_options,
            image_features_unsupported,
        } => Ok(Arc::new(RbdPool::new(
            pool_name.clone(),
            data_pool_name.clone(),
            *use_sudo,
            map_options.clone(),
            image_features_unsupported.clone(),
            shard_max_size,
        ))),
    }
}

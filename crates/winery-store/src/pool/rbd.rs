//! RBD-Based Shard Pool
//!
//! Each shard is one RBD image in a Ceph pool, mapped into `/dev/rbd/...`
//! on the hosts that use it. The pool shells out to the `rbd` CLI
//! (optionally through sudo) - the same operations an operator would run
//! by hand, which keeps the driver auditable and the capability split
//! (who may map images) in the system's sudoers file rather than in this
//! process.
//!
//! ## Image Lifecycle
//!
//! 1. `image_create`: provision at twice the shard fill threshold (the
//!    shard file index and frame overhead never approach 2x, so the image
//!    cannot run out of space mid-pack), disable whatever features the
//!    running kernel cannot handle, and map read-write for the packer.
//! 2. The packer writes the shard file straight onto the device node.
//! 3. `image_remap_ro`: once packed, every reader host maps the image
//!    read-only and records itself in the catalog.
//!
//! The pool never maps on demand in `open_ro`: mapping needs privileges
//! and is the image manager's job. Readers only check for the device
//! node.

use std::path::PathBuf;
use std::process::Output;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::pool::ShardPool;

/// Shard pool backed by RBD images.
pub struct RbdPool {
    pool_name: String,
    data_pool_name: Option<String>,
    use_sudo: bool,
    map_options: String,
    image_features_unsupported: Vec<String>,
    image_size_mib: u64,
}

impl RbdPool {
    pub fn new(
        pool_name: String,
        data_pool_name: Option<String>,
        use_sudo: bool,
        map_options: String,
        image_features_unsupported: Vec<String>,
        shard_max_size: u64,
    ) -> Self {
        // Twice the fill threshold, in MiB, rounded up.
        let image_size_mib = (shard_max_size * 2).div_ceil(1024 * 1024).max(1);
        Self {
            pool_name,
            data_pool_name,
            use_sudo,
            map_options,
            image_features_unsupported,
            image_size_mib,
        }
    }

    /// Device node of a mapped image on this host.
    pub fn device_path(&self, name: &str) -> PathBuf {
        PathBuf::from(format!("/dev/rbd/{}/{}", self.pool_name, name))
    }

    async fn rbd(&self, args: &[&str]) -> Result<Output> {
        let mut command = if self.use_sudo {
            let mut c = Command::new("sudo");
            c.arg("rbd");
            c
        } else {
            Command::new("rbd")
        };
        command.arg(format!("--pool={}", self.pool_name));
        command.args(args);

        debug!(?args, pool = %self.pool_name, "rbd");
        let output = command.output().await?;
        if !output.status.success() {
            return Err(Error::PoolUnavailable(format!(
                "rbd {:?} failed: {}",
                args,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output)
    }

    /// Provision an image sized for one packed shard.
    pub async fn image_create(&self, name: &str) -> Result<()> {
        let size = format!("--size={}", self.image_size_mib);
        let mut args = vec!["create", size.as_str()];
        let data_pool;
        if let Some(pool) = &self.data_pool_name {
            data_pool = format!("--data-pool={}", pool);
            args.push(&data_pool);
        }
        args.push(name);
        self.rbd(&args).await?;

        if !self.image_features_unsupported.is_empty() {
            let spec = format!("{}/{}", self.pool_name, name);
            let mut args = vec!["feature", "disable", spec.as_str()];
            args.extend(self.image_features_unsupported.iter().map(|f| f.as_str()));
            self.rbd(&args).await?;
        }

        info!(image = name, size_mib = self.image_size_mib, "rbd image created");
        Ok(())
    }

    /// Map an image on this host, read-only or read-write.
    pub async fn image_map(&self, name: &str, readonly: bool) -> Result<()> {
        let mut options = if readonly { "ro".to_string() } else { "rw".to_string() };
        if !self.map_options.is_empty() {
            options.push(',');
            options.push_str(&self.map_options);
        }
        self.rbd(&["device", "map", "-o", &options, name]).await?;

        // The packer runs unprivileged but writes to the device node.
        if !readonly {
            let path = self.device_path(name);
            let output = Command::new("sudo")
                .args(["chmod", "666"])
                .arg(&path)
                .output()
                .await?;
            if !output.status.success() {
                return Err(Error::PoolUnavailable(format!(
                    "chmod of {} failed: {}",
                    path.display(),
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
        }
        debug!(image = name, readonly, "rbd image mapped");
        Ok(())
    }

    /// Unmap an image from this host. Already-unmapped is fine.
    pub async fn image_unmap(&self, name: &str) -> Result<()> {
        let spec = format!("{}/{}", self.pool_name, name);
        match self.rbd(&["device", "unmap", &spec]).await {
            Ok(_) => Ok(()),
            // EINVAL from unmap means "not mapped here".
            Err(Error::PoolUnavailable(reason)) if reason.contains("Invalid argument") => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Switch an image's mapping on this host to read-only.
    pub async fn image_remap_ro(&self, name: &str) -> Result<()> {
        self.image_unmap(name).await?;
        self.image_map(name, true).await
    }

    /// Whether the image exists in the pool (mapped or not).
    pub async fn image_exists(&self, name: &str) -> Result<bool> {
        Ok(self
            .list()
            .await?
            .iter()
            .any(|image| image == name))
    }
}

#[async_trait]
impl ShardPool for RbdPool {
    async fn create(&self, name: &str, _size: u64) -> Result<PathBuf> {
        self.image_create(name).await?;
        self.image_map(name, false).await?;
        Ok(self.device_path(name))
    }

    async fn open_ro(&self, name: &str) -> Result<PathBuf> {
        let path = self.device_path(name);
        match tokio::fs::metadata(&path).await {
            Ok(_) => Ok(path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::PoolUnavailable(
                format!("image {} not mapped on this host", name),
            )),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.image_unmap(name).await?;
        self.rbd(&["remove", name]).await?;
        info!(image = name, "rbd image removed");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        let output = match self.rbd(&["ls"]).await {
            Ok(output) => output,
            // An empty, never-written pool lists as ENOENT.
            Err(Error::PoolUnavailable(reason))
                if reason.contains("No such file or directory") =>
            {
                return Ok(Vec::new())
            }
            Err(e) => return Err(e),
        };
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect())
    }

    async fn host_mapped(&self, name: &str) -> Result<bool> {
        Ok(tokio::fs::metadata(self.device_path(name)).await.is_ok())
    }

    fn requires_host_mapping(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> RbdPool {
        RbdPool::new(
            "shards".into(),
            None,
            false,
            String::new(),
            Vec::new(),
            100 * 1024 * 1024 * 1024,
        )
    }

    #[test]
    fn test_device_path_layout() {
        assert_eq!(
            pool().device_path("abc123"),
            PathBuf::from("/dev/rbd/shards/abc123")
        );
    }

    #[test]
    fn test_image_size_is_twice_max_size() {
        let pool = pool();
        assert_eq!(pool.image_size_mib, 200 * 1024);
    }

    #[test]
    fn test_image_size_rounds_up_to_a_mib() {
        let pool = RbdPool::new(
            "shards".into(),
            None,
            false,
            String::new(),
            Vec::new(),
            1000, // 2000 bytes doubled, still under 1 MiB
        );
        assert_eq!(pool.image_size_mib, 1);
    }
}

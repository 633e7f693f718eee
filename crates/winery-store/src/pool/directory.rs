//! Directory-Based Shard Pool
//!
//! Stores each RO-shard as a regular file at
//! `{base_directory}/{pool_name}/{shard_name}` on a shared filesystem.
//! Every host sees every file, so `host_mapped` is trivially true and the
//! cleaner's replication gate does not apply.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::error::{Error, Result};
use crate::pool::ShardPool;

/// Shard pool backed by a directory of regular files.
pub struct DirectoryPool {
    root: PathBuf,
}

impl DirectoryPool {
    /// Create the pool, making `{base_directory}/{pool_name}` if needed.
    pub fn new(base_directory: &Path, pool_name: &str) -> Result<Self> {
        let root = base_directory.join(pool_name);
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn shard_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

#[async_trait]
impl ShardPool for DirectoryPool {
    async fn create(&self, name: &str, _size: u64) -> Result<PathBuf> {
        // Capacity is the filesystem's problem; just hand out the path.
        Ok(self.shard_path(name))
    }

    async fn open_ro(&self, name: &str) -> Result<PathBuf> {
        let path = self.shard_path(name);
        match tokio::fs::metadata(&path).await {
            Ok(_) => Ok(path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::PoolUnavailable(
                format!("shard file {} does not exist", path.display()),
            )),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let path = self.shard_path(name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(shard = name, "shard file deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                if let Ok(name) = entry.file_name().into_string() {
                    names.push(name);
                }
            }
        }
        names.sort();
        Ok(names)
    }

    async fn host_mapped(&self, name: &str) -> Result<bool> {
        Ok(tokio::fs::metadata(self.shard_path(name)).await.is_ok())
    }

    fn requires_host_mapping(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pool(dir: &tempfile::TempDir) -> DirectoryPool {
        DirectoryPool::new(dir.path(), "shards").unwrap()
    }

    #[tokio::test]
    async fn test_create_open_delete() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(&dir);

        let path = pool.create("abc", 0).await.unwrap();
        assert_eq!(path, dir.path().join("shards").join("abc"));

        // Not visible until something is actually written.
        assert!(matches!(
            pool.open_ro("abc").await,
            Err(Error::PoolUnavailable(_))
        ));

        tokio::fs::write(&path, b"shard bytes").await.unwrap();
        assert_eq!(pool.open_ro("abc").await.unwrap(), path);
        assert!(pool.host_mapped("abc").await.unwrap());

        pool.delete("abc").await.unwrap();
        pool.delete("abc").await.unwrap(); // idempotent
        assert!(!pool.host_mapped("abc").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_names() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(&dir);

        for name in ["b", "a", "c"] {
            let path = pool.create(name, 0).await.unwrap();
            tokio::fs::write(&path, b"x").await.unwrap();
        }
        assert_eq!(pool.list().await.unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_visible_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(&dir);

        let err = pool
            .ensure_visible("missing", Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PoolUnavailable(_)));
    }

    #[tokio::test]
    async fn test_ensure_visible_sees_late_file() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(&dir);
        let path = dir.path().join("shards").join("late");

        let writer = tokio::spawn({
            let path = path.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(150)).await;
                tokio::fs::write(&path, b"here now").await.unwrap();
            }
        });

        let found = pool
            .ensure_visible("late", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(found, path);
        writer.await.unwrap();
    }
}

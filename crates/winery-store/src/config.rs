//! Winery Configuration
//!
//! [`WineryConfig`] is the serde-deserializable settings tree for a Winery
//! instance. Parsing the outer configuration file is the caller's concern;
//! this module only defines the recognized sections and their defaults.
//!
//! ## Sections
//!
//! - **database**: catalog connection string and connection label
//! - **shards**: fill threshold and idle-release timeout
//! - **shards_pool**: where RO-shard files live (`directory` or `rbd`)
//! - **packer**: which follow-up work the writer performs inline
//! - **throttler**: cluster-wide bandwidth limits; omit to disable
//! - **cleaner**: replication criteria for dropping RW tables
//!
//! ## Example
//!
//! ```ignore
//! let config: WineryConfig = serde_json::from_value(json!({
//!     "database": { "db": "postgres://winery@db/winery" },
//!     "shards": { "max_size": 107374182400u64 },
//!     "shards_pool": { "type": "directory", "base_directory": "/srv/winery" },
//!     "throttler": { "max_read_bps": 200_000_000, "max_write_bps": 100_000_000 }
//! }))?;
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WineryConfig {
    /// Writers refuse to start when set.
    #[serde(default)]
    pub readonly: bool,

    pub database: DatabaseConfig,
    pub shards: ShardsConfig,
    pub shards_pool: PoolConfig,

    #[serde(default)]
    pub packer: PackerConfig,

    /// Omit the section entirely to disable throttling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throttler: Option<ThrottlerConfig>,

    #[serde(default)]
    pub cleaner: CleanerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Catalog connection string.
    pub db: String,

    /// Connection label shown in `pg_stat_activity`.
    #[serde(default)]
    pub application_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardsConfig {
    /// Fill threshold in bytes. May be exceeded by at most one oversized
    /// object: the add that crosses the line is accepted, then the shard
    /// flips `full`.
    pub max_size: u64,

    /// Seconds without a write before a writer releases its shard back to
    /// `standby` (default: 300).
    #[serde(default = "default_rw_idle_timeout")]
    pub rw_idle_timeout: u64,
}

/// Storage for RO-shard files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PoolConfig {
    /// Regular files on a shared filesystem:
    /// `{base_directory}/{pool_name}/{shard_name}`.
    Directory {
        base_directory: PathBuf,
        #[serde(default = "default_pool_name")]
        pool_name: String,
    },

    /// RBD images in a Ceph pool, one per shard.
    Rbd {
        #[serde(default = "default_pool_name")]
        pool_name: String,
        /// Separate data pool (erasure-coded deployments).
        #[serde(default)]
        data_pool_name: Option<String>,
        #[serde(default = "default_true")]
        use_sudo: bool,
        /// Extra options passed to `rbd device map -o`.
        #[serde(default)]
        map_options: String,
        /// Image features the kernel RBD driver cannot handle, disabled
        /// right after image creation (e.g. object-map, fast-diff on
        /// kernels < 5.3).
        #[serde(default)]
        image_features_unsupported: Vec<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackerConfig {
    /// Writer spawns the packer inline when a shard fills; otherwise an
    /// external packer picks `full` shards up.
    #[serde(default = "default_true")]
    pub pack_immediately: bool,

    /// Packer creates pool images itself; otherwise it waits (bounded)
    /// for an external manager to provision them.
    #[serde(default = "default_true")]
    pub create_images: bool,

    /// Packer proceeds straight to cleaning after a successful pack.
    #[serde(default = "default_true")]
    pub clean_immediately: bool,

    /// Seconds after which a silent `packing` locker is considered dead
    /// and the shard may be reclaimed (default: 300).
    #[serde(default = "default_lock_grace")]
    pub lock_grace: u64,

    /// Seconds to wait for an externally created image to appear
    /// (default: 300).
    #[serde(default = "default_image_wait_timeout")]
    pub image_wait_timeout: u64,
}

impl Default for PackerConfig {
    fn default() -> Self {
        Self {
            pack_immediately: true,
            create_images: true,
            clean_immediately: true,
            lock_grace: default_lock_grace(),
            image_wait_timeout: default_image_wait_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottlerConfig {
    /// Telemetry database; defaults to `database.db` when omitted.
    #[serde(default)]
    pub db: Option<String>,

    /// Cluster-wide read limit, bytes per second.
    pub max_read_bps: u64,

    /// Cluster-wide write limit, bytes per second.
    pub max_write_bps: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanerConfig {
    /// Hosts that must have mapped a packed shard read-only before its RW
    /// table may be dropped. Ignored for pools where every host sees
    /// every file (directory pools).
    #[serde(default = "default_min_mapped_hosts")]
    pub min_mapped_hosts: i32,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            min_mapped_hosts: default_min_mapped_hosts(),
        }
    }
}

fn default_rw_idle_timeout() -> u64 {
    300
}

fn default_pool_name() -> String {
    "shards".to_string()
}

fn default_true() -> bool {
    true
}

fn default_lock_grace() -> u64 {
    300
}

fn default_image_wait_timeout() -> u64 {
    300
}

fn default_min_mapped_hosts() -> i32 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config: WineryConfig = serde_json::from_value(serde_json::json!({
            "database": { "db": "postgres://localhost/winery" },
            "shards": { "max_size": 1024 },
            "shards_pool": { "type": "directory", "base_directory": "/srv/winery" }
        }))
        .unwrap();

        assert!(!config.readonly);
        assert_eq!(config.shards.rw_idle_timeout, 300);
        assert!(config.packer.pack_immediately);
        assert!(config.packer.create_images);
        assert!(config.packer.clean_immediately);
        assert_eq!(config.packer.lock_grace, 300);
        assert!(config.throttler.is_none());
        assert_eq!(config.cleaner.min_mapped_hosts, 1);

        match config.shards_pool {
            PoolConfig::Directory { pool_name, .. } => assert_eq!(pool_name, "shards"),
            _ => panic!("expected directory pool"),
        }
    }

    #[test]
    fn test_rbd_pool_defaults() {
        let config: WineryConfig = serde_json::from_value(serde_json::json!({
            "database": { "db": "postgres://localhost/winery" },
            "shards": { "max_size": 1024 },
            "shards_pool": { "type": "rbd" }
        }))
        .unwrap();

        match config.shards_pool {
            PoolConfig::Rbd {
                pool_name,
                data_pool_name,
                use_sudo,
                map_options,
                image_features_unsupported,
            } => {
                assert_eq!(pool_name, "shards");
                assert_eq!(data_pool_name, None);
                assert!(use_sudo);
                assert_eq!(map_options, "");
                assert!(image_features_unsupported.is_empty());
            }
            _ => panic!("expected rbd pool"),
        }
    }

    #[test]
    fn test_throttler_section_enables_throttling() {
        let config: WineryConfig = serde_json::from_value(serde_json::json!({
            "database": { "db": "postgres://localhost/winery" },
            "shards": { "max_size": 1024 },
            "shards_pool": { "type": "directory", "base_directory": "/srv/winery" },
            "throttler": { "max_read_bps": 100, "max_write_bps": 200 }
        }))
        .unwrap();

        let throttler = config.throttler.unwrap();
        assert_eq!(throttler.db, None); // falls back to database.db
        assert_eq!(throttler.max_read_bps, 100);
        assert_eq!(throttler.max_write_bps, 200);
    }

    #[test]
    fn test_readonly_flag() {
        let config: WineryConfig = serde_json::from_value(serde_json::json!({
            "readonly": true,
            "database": { "db": "postgres://localhost/winery" },
            "shards": { "max_size": 1024 },
            "shards_pool": { "type": "directory", "base_directory": "/srv/winery" }
        }))
        .unwrap();
        assert!(config.readonly);
    }
}

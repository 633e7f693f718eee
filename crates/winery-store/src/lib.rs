//! Winery Store
//!
//! This crate assembles the Winery object store out of the catalog
//! (`winery-catalog`) and the shard file format (`winery-core`): shard
//! pools, the RW-shard access layer, the packer, the image manager, the
//! cleaner, the cluster-wide throttler, and the writer/reader facades
//! clients actually call.
//!
//! ## Architecture
//!
//! ```text
//!                      ┌────────────────────┐
//!   add ──────────────▶│    WineryWriter    │─── one tx ──▶ signature2shard
//!                      │  (owns 1 RW shard) │               shard_{name}
//!                      └─────────┬──────────┘
//!                                │ size ≥ max_size: 'full'
//!                                ▼
//!                      ┌────────────────────┐   stream    ┌──────────────┐
//!                      │       Packer       │────────────▶│ RO-shard file │
//!                      │ full→packing→packed│             │  (pool)       │
//!                      └─────────┬──────────┘             └──────┬───────┘
//!                                │                               │
//!                      ┌─────────▼──────────┐            ┌───────▼───────┐
//!                      │      Cleaner       │            │ WineryReader  │◀── get
//!                      │ packed→…→readonly  │            │ (state branch)│
//!                      └────────────────────┘            └───────────────┘
//! ```
//!
//! All coordination between these actors - and between their copies on
//! other hosts - goes through conditional updates on the catalog. No
//! process talks to another process directly.
//!
//! ## Components
//!
//! | Component | Role |
//! |-----------|------|
//! | [`Winery`] | Config-driven composition root and client facade |
//! | [`WineryWriter`] | Exactly-once adds, fill detection, idle release |
//! | [`WineryReader`] | RW/RO branch per request, shard file cache |
//! | [`Packer`] | full → packed conversion, stale-lock reclamation |
//! | [`Cleaner`] | RW table teardown after replication criteria |
//! | [`ImageManager`] | Per-host RBD mapping convergence |
//! | [`Throttler`] | Cluster-wide read/write bandwidth bounds |
//! | [`DirectoryPool`] / [`RbdPool`] | RO-shard storage drivers |

pub mod cleaner;
pub mod config;
pub mod error;
pub mod images;
pub mod packer;
pub mod pool;
pub mod reader;
pub mod rwshard;
pub mod throttler;
pub mod winery;
pub mod writer;

pub use cleaner::Cleaner;
pub use config::{
    CleanerConfig, DatabaseConfig, PackerConfig, PoolConfig, ShardsConfig, ThrottlerConfig,
    WineryConfig,
};
pub use error::{Error, Result};
pub use images::ImageManager;
pub use packer::Packer;
pub use pool::{build_pool, DirectoryPool, RbdPool, ShardPool};
pub use reader::{ObjectIdIter, WineryReader};
pub use rwshard::RwShard;
pub use throttler::{BandwidthCalculator, LeakyBucket, Throttler};
pub use winery::Winery;
pub use writer::{AddOutcome, WineryWriter};

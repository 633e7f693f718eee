//! Store Error Types
//!
//! ## Error Categories
//!
//! ### Client-visible
//! - `NotFound`: object id absent, inflight, or deleted
//! - `Readonly`: write attempted on a read-only configuration
//! - `Throttled`: throttler database unreachable while throttling is
//!   enabled; I/O fails closed and the client may retry later
//!
//! ### Worker-recoverable
//! - `PoolUnavailable`: image not yet mapped / file not yet visible;
//!   retried with bounded backoff before surfacing
//! - `Catalog(Conflict)`: a conditional UPDATE lost a race; workers move
//!   on to other shards
//!
//! ### Operator-facing
//! - `Shard`: RO-shard corruption (bad magic, checksum, key mismatch);
//!   fatal for that shard, and locks are left in place for intervention

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("object not found")]
    NotFound,

    #[error("write attempted on a read-only configuration")]
    Readonly,

    #[error("shard pool unavailable: {0}")]
    PoolUnavailable(String),

    #[error("throttler unavailable, refusing I/O: {0}")]
    Throttled(String),

    #[error("catalog error: {0}")]
    Catalog(#[from] winery_catalog::CatalogError),

    #[error("shard file error: {0}")]
    Shard(#[from] winery_core::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

//! Winery Core Types and Shard File Format
//!
//! This crate holds the pieces of Winery that do not touch the database:
//! object ids, the perfect hash used to index packed shards, and the
//! read-only shard file container itself.
//!
//! ## What is Winery?
//!
//! Winery stores very large populations of small immutable blobs (target:
//! 100 billion objects, ~4 KB median). Writes land in per-writer PostgreSQL
//! tables (RW-shards); once a shard fills up, a packer converts it into an
//! immutable, constant-time-indexed file (RO-shard) on a shared pool, and
//! the database table is eventually dropped.
//!
//! ```text
//! ┌─────────────┐
//! │   Writers   │
//! └──────┬──────┘
//!        │ INSERT (key, content)
//!        ▼
//! ┌─────────────────┐        ┌──────────────────┐
//! │ RW-shard table  │──pack─▶│ RO-shard file    │ ◄── this crate
//! │ (PostgreSQL)    │        │ (perfect-hashed) │
//! └─────────────────┘        └────────┬─────────┘
//!                                     │ get(object_id)
//!                                     ▼
//!                            ┌─────────────────┐
//!                            │     Readers     │
//!                            └─────────────────┘
//! ```
//!
//! ## Main Components
//!
//! ### ObjectId
//! A 32-byte content hash (SHA-256 by default) treated as an opaque key by
//! everything in this workspace.
//!
//! ### PerfectHash
//! A hash-and-displace (CHD) perfect hash built once at pack time over the
//! full key set of a shard. Lookup is O(1) with no collision probing.
//!
//! ### ShardFileWriter / ShardFile
//! The writer streams `(key, content)` pairs into the payload region while
//! collecting key locations in memory, then lays down the perfect-hash
//! index and a checksummed footer. The reader validates the container and
//! answers `get(key)` with two reads: one for the slot, one for the blob.
//!
//! ## Why a Perfect Hash?
//!
//! A packed shard holds tens of millions of keys and is read with uniform
//! random access. A perfect hash gives:
//! - **One slot probe per lookup**: no bucket chains, no open addressing
//! - **No false positives**: the slot stores the key, which is verified
//!   before any payload bytes are returned
//! - **Compact index**: ~44 bytes per object plus a small displacement array
//!
//! The index is not updatable, which is exactly right: RO-shard files are
//! written once and never modified.

pub mod error;
pub mod id;
pub mod phf;
pub mod shard;

pub use error::{Error, Result};
pub use id::{ObjectId, OBJECT_ID_LEN};
pub use phf::PerfectHash;
pub use shard::{ShardFile, ShardFileWriter};

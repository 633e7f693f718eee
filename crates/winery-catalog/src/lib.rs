//! Winery Catalog
//!
//! This crate implements the catalog - the PostgreSQL schema that is the
//! *only* shared mutable state in a Winery deployment, and the access layer
//! every actor (writer, packer, image manager, cleaner, reader) goes
//! through.
//!
//! ## What Gets Stored Here?
//!
//! | Table | Contents | Size per entry |
//! |-------|----------|----------------|
//! | `shards` | One row per shard: state, lock, 32-hex name, mapped hosts | ~100 bytes |
//! | `signature2shard` | Object id → shard id, with inflight/present/deleted state | ~60 bytes |
//! | `t_read` / `t_write` | One telemetry row per worker and direction | ~30 bytes |
//!
//! **Object content is NOT stored here** - it lives in per-shard tables
//! while a shard is mutable and in RO-shard files once packed.
//!
//! ## Concurrency Control via the Database
//!
//! There are no in-process locks and no advisory locks. Every lifecycle
//! transition is a single conditional UPDATE that names the expected prior
//! state and (where relevant) the expected locker:
//!
//! ```sql
//! UPDATE shards
//! SET state = 'packing', locker = $me, locker_ts = NOW()
//! WHERE name = $name AND state = 'full' AND locker IS NULL
//! ```
//!
//! Zero rows affected means another worker won the race - a `Conflict`,
//! which callers either retry or walk away from. This compare-and-swap in
//! SQL extends across processes and hosts for free, which is the whole
//! point: writers, packers, and cleaners are independent processes that
//! share nothing but the database.
//!
//! ## Shard Lifecycle
//!
//! ```text
//! standby ──acquire──▶ writing ──size≥max──▶ full
//!    ▲                    │                    │
//!    └────idle release────┘     packer locks   ▼
//!                                           packing ──fail──▶ full
//!                                              │
//!                                           pack ok
//!                                              ▼
//!                                           packed ──hosts mapped──▶ cleaning
//!                                              ▲                       │
//!                                              └──────fail─────────────┤
//!                                                            drop table▼
//!                                                               readonly
//! ```
//!
//! `writing`, `packing` and `cleaning` are locked states: the `locker`
//! UUID and `locker_ts` identify the worker mid-transition. The others are
//! unlocked steady states.
//!
//! ## Signature Index
//!
//! `signature2shard` maps each object id to the shard that holds (or will
//! hold) its bytes. An entry is created `inflight` before any bytes are
//! written and flipped to `present` in the same transaction that lands the
//! bytes - readers only ever see `present` objects. Deletes flip
//! `present → deleted` without touching shards. A signature is never moved
//! between shards (the binding is frozen at first write).
//!
//! ## Usage
//!
//! ```ignore
//! use winery_catalog::{Catalog, ShardState};
//! use uuid::Uuid;
//!
//! let catalog = Catalog::connect("postgres://winery@db/winery", None).await?;
//! let me = Uuid::new_v4();
//!
//! // Writer: take a shard
//! let shard = catalog.acquire_rw_shard(me).await?;
//!
//! // Packer: claim a full shard (false = another packer won)
//! if catalog.start_packing(&shard.name, me).await? {
//!     // ... build the RO-shard file ...
//!     catalog.finish_packing(&shard.name, me).await?;
//! }
//! ```
//!
//! ## Schema Versioning
//!
//! The schema is applied through ordered migrations
//! (`sqlx::migrate!("./migrations")`) on `Catalog::connect`. The throttler
//! tables additionally self-create on [`ThrottlerDb::connect`] because
//! deployments may point the throttler at a database of its own.

pub mod catalog;
pub mod error;
pub mod throttler;
pub mod types;

pub use catalog::Catalog;
pub use error::{CatalogError, Result};
pub use throttler::{IoDirection, ThrottlerDb};
pub use types::{InsertOutcome, Shard, ShardState, SignatureState};

//! RO-Shard File Format
//!
//! This module implements the immutable container a packed shard is stored
//! in. A shard file holds tens of millions of `(object id → blob)` pairs
//! and answers keyed lookups in constant time.
//!
//! ## File Structure
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Header (48 bytes)                                            │
//! │ - Magic bytes: "WNRY" (4 bytes)                              │
//! │ - Version: 1 (2 bytes)                                       │
//! │ - Reserved (2 bytes)                                         │
//! │ - Object count (8 bytes)                                     │
//! │ - Slot count (8 bytes)                                       │
//! │ - Bucket count (8 bytes)                                     │
//! │ - Hash seed (8 bytes)                                        │
//! │ - Index offset (8 bytes)                                     │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Payload (one frame per object, in insertion order)           │
//! │ - Key (32 bytes)                                             │
//! │ - Content length (4 bytes)                                   │
//! │ - Content bytes                                              │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Index (at index offset)                                      │
//! │ - Displacement array: bucket count × u32                     │
//! │ - Slot table: slot count × 44 bytes                          │
//! │   * Content offset (8 bytes)                                 │
//! │   * Content length (4 bytes)                                 │
//! │   * Key (32 bytes)                                           │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Footer (16 bytes)                                            │
//! │ - CRC32 of the index region (4 bytes)                        │
//! │ - Magic bytes: "WNRY" again (4 bytes)                        │
//! │ - Reserved (8 bytes)                                         │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! All integers are big-endian. Empty slots hold all zeroes.
//!
//! ## Why This Design?
//!
//! ### Payload First, Index Last
//! The packer streams blobs out of the RW-shard table without knowing the
//! final key set; only the `(key, offset, length)` triples are held in
//! memory. The perfect hash and slot table are written once the last blob
//! has landed, then the header is completed in place. The file therefore
//! works on pre-sized block devices as well as regular files: nothing is
//! ever truncated.
//!
//! ### Key Stored in the Slot
//! The perfect hash is a total function: keys outside the built set still
//! map to a slot. Every lookup compares the slot's stored key with the
//! probe key before touching payload bytes, so unknown keys are a clean
//! not-found and a damaged index cannot serve the wrong blob.
//!
//! ### CRC32 over the Index
//! The index is the part whose silent corruption would misdirect every
//! lookup, so it is checksummed and verified at open. Payload bytes are
//! implicitly verified by the content-addressable scheme: the key is the
//! hash of the blob.
//!
//! ### No Compression
//! Payload blobs are stored raw. The median object is ~4 KB of already
//! high-entropy content, and raw frames keep `get` a single positioned
//! read.
//!
//! ## Lookup Path
//!
//! 1. Compute the slot with the in-memory displacement array
//! 2. Read the 44-byte slot entry (one positioned read)
//! 3. Verify the stored key; mismatch → not found
//! 4. Read `length` bytes at `offset` (one positioned read)
//!
//! ## Immutability
//!
//! After `finalize()` there is no write path. Readers may keep the file
//! open indefinitely; the state machine in the catalog guarantees the file
//! is never modified or deleted while a shard still resolves to it.

mod reader;
mod writer;

pub use reader::{ShardFile, ShardFileIter};
pub use writer::ShardFileWriter;

use crate::id::OBJECT_ID_LEN;

/// Magic bytes for shard files: "WNRY"
pub const SHARD_MAGIC: [u8; 4] = *b"WNRY";

/// Version number for the shard file format
pub const SHARD_VERSION: u16 = 1;

/// Shard file header size (48 bytes)
pub const HEADER_SIZE: usize = 48;

/// Shard file footer size (16 bytes)
pub const FOOTER_SIZE: usize = 16;

/// Size of one slot table entry: offset + length + key
pub const SLOT_SIZE: usize = 8 + 4 + OBJECT_ID_LEN;

/// Bytes preceding the content in a payload frame: key + length
pub const FRAME_OVERHEAD: usize = OBJECT_ID_LEN + 4;

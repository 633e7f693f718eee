//! Shard Format Error Types
//!
//! Errors raised by the shard file container and the object id parser.
//!
//! ## Error Categories
//!
//! ### Validation Errors
//! - `InvalidMagic`: file does not start (or end) with the shard magic
//! - `UnsupportedVersion`: file was produced by a newer format revision
//! - `CrcMismatch`: index checksum does not match, the file is damaged
//!
//! ### Data Errors
//! - `Corrupt`: structural damage found after validation (bad frame,
//!   duplicate key at build time, slot out of range)
//! - `InvalidObjectId`: a key of the wrong width or non-hex text
//!
//! All corruption errors are fatal for the affected shard and must be
//! surfaced to the operator; retrying the read cannot help.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid shard file magic")]
    InvalidMagic,

    #[error("unsupported shard file version: {0}")]
    UnsupportedVersion(u16),

    #[error("shard file index checksum mismatch")]
    CrcMismatch,

    #[error("corrupt shard file: {0}")]
    Corrupt(String),

    #[error("invalid object id: expected {expected} bytes, got {got}")]
    InvalidObjectId { expected: usize, got: usize },

    #[error("shard file I/O error: {0}")]
    Io(#[from] std::io::Error),
}

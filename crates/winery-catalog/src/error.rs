//! Catalog Error Types
//!
//! ## Error Categories
//!
//! - `Conflict`: a conditional UPDATE affected zero rows - another worker
//!   won the race or the caller's view of the state was stale. Always
//!   retriable or ignorable; never fatal.
//! - `NotFound`: the named shard or signature does not exist (or is not in
//!   the state the operation requires).
//! - `Database` / `Migration`: the underlying PostgreSQL operation failed.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CatalogError>;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("conditional update lost the race: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(String),
}

impl From<sqlx::migrate::MigrateError> for CatalogError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        CatalogError::Migration(e.to_string())
    }
}

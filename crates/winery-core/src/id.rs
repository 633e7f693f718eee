//! Object Identifiers
//!
//! An [`ObjectId`] is the primary key of everything Winery stores: a fixed
//! 32-byte content hash (SHA-256 of the blob by default). The rest of the
//! system treats it as an uninterpreted byte string, which keeps the door
//! open for other 256-bit digests.

use std::fmt;
use std::str::FromStr;

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Width of an object id in bytes.
pub const OBJECT_ID_LEN: usize = 32;

/// A fixed-width content hash identifying one immutable object.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; OBJECT_ID_LEN]);

impl ObjectId {
    /// Wrap raw id bytes.
    pub const fn new(bytes: [u8; OBJECT_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Build an id from a byte slice, checking the width.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; OBJECT_ID_LEN] =
            bytes.try_into().map_err(|_| Error::InvalidObjectId {
                expected: OBJECT_ID_LEN,
                got: bytes.len(),
            })?;
        Ok(Self(arr))
    }

    /// Compute the id of a blob: SHA-256 over its content.
    pub fn from_content(content: &[u8]) -> Self {
        let digest = Sha256::digest(content);
        Self(digest.into())
    }

    pub fn as_bytes(&self) -> &[u8; OBJECT_ID_LEN] {
        &self.0
    }

    /// Lowercase hex rendering, 64 characters.
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(OBJECT_ID_LEN * 2);
        for byte in self.0 {
            out.push_str(&format!("{:02x}", byte));
        }
        out
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl FromStr for ObjectId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != OBJECT_ID_LEN * 2 {
            return Err(Error::InvalidObjectId {
                expected: OBJECT_ID_LEN,
                got: s.len() / 2,
            });
        }
        let mut bytes = [0u8; OBJECT_ID_LEN];
        for (i, chunk) in s.as_bytes().chunks_exact(2).enumerate() {
            let hex = std::str::from_utf8(chunk)
                .ok()
                .and_then(|h| u8::from_str_radix(h, 16).ok());
            match hex {
                Some(b) => bytes[i] = b,
                None => {
                    return Err(Error::InvalidObjectId {
                        expected: OBJECT_ID_LEN,
                        got: 0,
                    })
                }
            }
        }
        Ok(Self(bytes))
    }
}

impl AsRef<[u8]> for ObjectId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

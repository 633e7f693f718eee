//! Shard File Writer
//!
//! [`ShardFileWriter`] builds an RO-shard file from a stream of
//! `(object id, content)` pairs. It is used exclusively by the packer.
//!
//! ## Usage
//!
//! ```ignore
//! let mut writer = ShardFileWriter::create(&path)?;
//! for (id, content) in rw_shard_rows {
//!     writer.write(&id, &content)?;
//! }
//! writer.finalize()?;
//! ```
//!
//! ## Memory Usage
//!
//! Content is streamed straight to the file; only one `(key, offset,
//! length)` triple per object (44 bytes) is retained for the index build.
//! Packing a 100 GB shard of 4 KB objects holds ~1 GB of index state, not
//! 100 GB of payload.
//!
//! ## Failure Behaviour
//!
//! Until `finalize()` completes, the header is all zeroes, so a reader
//! opening a partially-written file fails the magic check instead of
//! seeing a truncated object set. A packer retry recreates the file under
//! the same name from scratch.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::Path;

use bytes::{BufMut, BytesMut};

use crate::error::{Error, Result};
use crate::id::ObjectId;
use crate::phf::PerfectHash;

use super::{FOOTER_SIZE, FRAME_OVERHEAD, HEADER_SIZE, SHARD_MAGIC, SHARD_VERSION, SLOT_SIZE};

/// Sentinel for an unoccupied slot while assembling the slot table.
const EMPTY_SLOT: u32 = u32::MAX;

struct Entry {
    key: ObjectId,
    offset: u64,
    length: u32,
}

/// Streams objects into a new shard file and lays down the index.
pub struct ShardFileWriter {
    writer: BufWriter<File>,
    entries: Vec<Entry>,
    position: u64,
}

impl ShardFileWriter {
    /// Create a shard file at `path`.
    ///
    /// The file is opened without truncation so the same code path works
    /// on pre-sized block devices. Any previous content is logically
    /// replaced: the header is rewritten last and readers never look past
    /// the index.
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let mut writer = BufWriter::new(file);

        // Header placeholder; completed in finalize() once the index
        // offset and hash parameters are known.
        writer.write_all(&[0u8; HEADER_SIZE])?;

        Ok(Self {
            writer,
            entries: Vec::new(),
            position: HEADER_SIZE as u64,
        })
    }

    /// Append one object. Keys must be unique across the whole file;
    /// duplicates are detected at `finalize()`.
    pub fn write(&mut self, key: &ObjectId, content: &[u8]) -> Result<()> {
        let length = u32::try_from(content.len())
            .map_err(|_| Error::Corrupt(format!("object {} larger than 4 GiB", key)))?;

        self.writer.write_all(key.as_bytes())?;
        self.writer.write_all(&length.to_be_bytes())?;
        self.writer.write_all(content)?;

        self.entries.push(Entry {
            key: *key,
            offset: self.position + FRAME_OVERHEAD as u64,
            length,
        });
        self.position += (FRAME_OVERHEAD + content.len()) as u64;
        Ok(())
    }

    /// Number of objects written so far.
    pub fn count(&self) -> u64 {
        self.entries.len() as u64
    }

    /// Cumulative payload bytes written so far (frame overhead included).
    pub fn payload_size(&self) -> u64 {
        self.position - HEADER_SIZE as u64
    }

    /// Build the perfect-hash index, write index + footer, complete the
    /// header, and flush everything to stable storage.
    pub fn finalize(mut self) -> Result<()> {
        let keys: Vec<ObjectId> = self.entries.iter().map(|e| e.key).collect();
        let hash = PerfectHash::build(&keys)?;
        let index_offset = self.position;

        let mut slot_of = vec![EMPTY_SLOT; hash.slot_count()];
        for (i, entry) in self.entries.iter().enumerate() {
            slot_of[hash.slot(&entry.key)] = i as u32;
        }

        let mut crc = crc32fast::Hasher::new();

        for &d in hash.displacements() {
            let bytes = d.to_be_bytes();
            crc.update(&bytes);
            self.writer.write_all(&bytes)?;
        }

        let mut slot_buf = [0u8; SLOT_SIZE];
        for &entry_index in &slot_of {
            if entry_index == EMPTY_SLOT {
                slot_buf.fill(0);
            } else {
                let entry = &self.entries[entry_index as usize];
                slot_buf[..8].copy_from_slice(&entry.offset.to_be_bytes());
                slot_buf[8..12].copy_from_slice(&entry.length.to_be_bytes());
                slot_buf[12..].copy_from_slice(entry.key.as_bytes());
            }
            crc.update(&slot_buf);
            self.writer.write_all(&slot_buf)?;
        }

        let mut footer = BytesMut::with_capacity(FOOTER_SIZE);
        footer.put_u32(crc.finalize());
        footer.put_slice(&SHARD_MAGIC);
        footer.put_bytes(0, 8);
        self.writer.write_all(&footer)?;

        let mut header = BytesMut::with_capacity(HEADER_SIZE);
        header.put_slice(&SHARD_MAGIC);
        header.put_u16(SHARD_VERSION);
        header.put_u16(0); // reserved
        header.put_u64(self.entries.len() as u64);
        header.put_u64(hash.slot_count() as u64);
        header.put_u64(hash.bucket_count() as u64);
        header.put_u64(hash.seed());
        header.put_u64(index_offset);

        self.writer.flush()?;
        let mut file = self
            .writer
            .into_inner()
            .map_err(|e| Error::Io(e.into_error()))?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header)?;
        file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::ShardFile;

    #[test]
    fn test_writer_tracks_count_and_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shard");
        let mut writer = ShardFileWriter::create(&path).unwrap();

        assert_eq!(writer.count(), 0);
        assert_eq!(writer.payload_size(), 0);

        let id = ObjectId::from_content(b"one");
        writer.write(&id, b"one").unwrap();
        assert_eq!(writer.count(), 1);
        assert_eq!(writer.payload_size(), (FRAME_OVERHEAD + 3) as u64);
    }

    #[test]
    fn test_duplicate_keys_fail_finalize() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shard");
        let mut writer = ShardFileWriter::create(&path).unwrap();

        let id = ObjectId::from_content(b"dup");
        writer.write(&id, b"dup").unwrap();
        writer.write(&id, b"dup").unwrap();
        assert!(writer.finalize().is_err());
    }

    #[test]
    fn test_unfinalized_file_fails_magic_check() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shard");
        let mut writer = ShardFileWriter::create(&path).unwrap();
        let id = ObjectId::from_content(b"partial");
        writer.write(&id, b"partial").unwrap();
        drop(writer); // simulate a crash before finalize

        assert!(matches!(
            ShardFile::open(&path),
            Err(Error::InvalidMagic) | Err(Error::Io(_))
        ));
    }
}

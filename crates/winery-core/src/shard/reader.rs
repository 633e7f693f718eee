//! Shard File Reader
//!
//! [`ShardFile`] opens a finalized RO-shard file, validates it, and
//! answers keyed lookups and sequential scans.
//!
//! ## Validation at Open
//!
//! 1. Header magic and version
//! 2. Plausibility of the slot/bucket counts against the object count
//! 3. CRC32 of the whole index region (streamed, not buffered)
//! 4. Footer magic
//!
//! A file that fails any check is reported as corrupt and never serves a
//! single object.
//!
//! ## Memory Profile
//!
//! Only the displacement array (~1 byte per object) is kept in memory.
//! Slot entries and payload are fetched with positioned reads, so a
//! process can keep hundreds of large shards open at once - the usual
//! situation for a reader node in front of a populated pool.
//!
//! ## Thread Safety
//!
//! `get`/`contains` use positioned reads on a shared descriptor and take
//! `&self`; a `ShardFile` can be shared behind an `Arc` across tasks.
//! `iter()` clones the descriptor so scans do not disturb lookups.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::path::Path;

use bytes::Buf;

use crate::error::{Error, Result};
use crate::id::{ObjectId, OBJECT_ID_LEN};
use crate::phf::PerfectHash;

use super::{FOOTER_SIZE, FRAME_OVERHEAD, HEADER_SIZE, SHARD_MAGIC, SHARD_VERSION, SLOT_SIZE};

/// Read-only handle to a finalized shard file.
pub struct ShardFile {
    file: File,
    hash: PerfectHash,
    count: u64,
    /// End of the payload region == start of the index.
    payload_end: u64,
    /// Start of the slot table (index offset + displacement array).
    slots_offset: u64,
}

impl ShardFile {
    /// Open and validate a shard file.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;

        let mut header = [0u8; HEADER_SIZE];
        file.read_exact_at(&mut header, 0)?;
        let mut cursor = &header[..];

        let mut magic = [0u8; 4];
        cursor.copy_to_slice(&mut magic);
        if magic != SHARD_MAGIC {
            return Err(Error::InvalidMagic);
        }

        let version = cursor.get_u16();
        if version != SHARD_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let _reserved = cursor.get_u16();

        let count = cursor.get_u64();
        let slot_count = cursor.get_u64();
        let bucket_count = cursor.get_u64();
        let seed = cursor.get_u64();
        let index_offset = cursor.get_u64();

        // An absurd slot or bucket count means a damaged header; reject it
        // before allocating anything proportional to it.
        if slot_count == 0
            || bucket_count == 0
            || slot_count > count.saturating_mul(2) + 1
            || bucket_count > count + 1
            || index_offset < HEADER_SIZE as u64
        {
            return Err(Error::Corrupt("implausible header geometry".into()));
        }

        // Stream the index region through the checksum, keeping only the
        // displacement array.
        let mut crc = crc32fast::Hasher::new();

        let mut disp_bytes = vec![0u8; bucket_count as usize * 4];
        file.read_exact_at(&mut disp_bytes, index_offset)?;
        crc.update(&disp_bytes);

        let slots_offset = index_offset + disp_bytes.len() as u64;
        let slots_len = slot_count * SLOT_SIZE as u64;
        let mut remaining = slots_len;
        let mut position = slots_offset;
        let mut chunk = [0u8; 64 * 1024];
        while remaining > 0 {
            let take = remaining.min(chunk.len() as u64) as usize;
            file.read_exact_at(&mut chunk[..take], position)?;
            crc.update(&chunk[..take]);
            position += take as u64;
            remaining -= take as u64;
        }

        let mut footer = [0u8; FOOTER_SIZE];
        file.read_exact_at(&mut footer, slots_offset + slots_len)?;
        let mut cursor = &footer[..];
        let stored_crc = cursor.get_u32();
        let mut magic = [0u8; 4];
        cursor.copy_to_slice(&mut magic);
        if magic != SHARD_MAGIC {
            return Err(Error::InvalidMagic);
        }
        if stored_crc != crc.finalize() {
            return Err(Error::CrcMismatch);
        }

        let disp = disp_bytes
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes(c.try_into().expect("4-byte chunk")))
            .collect();

        Ok(Self {
            file,
            hash: PerfectHash::from_parts(seed, disp, slot_count as usize),
            count,
            payload_end: index_offset,
            slots_offset,
        })
    }

    /// Number of objects in this shard.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Fetch one object. Unknown keys return `None`.
    pub fn get(&self, key: &ObjectId) -> Result<Option<Vec<u8>>> {
        let Some((offset, length)) = self.locate(key)? else {
            return Ok(None);
        };
        let mut content = vec![0u8; length as usize];
        self.file.read_exact_at(&mut content, offset)?;
        Ok(Some(content))
    }

    /// Membership test without reading payload bytes.
    pub fn contains(&self, key: &ObjectId) -> Result<bool> {
        Ok(self.locate(key)?.is_some())
    }

    /// Resolve a key to its payload location, verifying the stored key.
    fn locate(&self, key: &ObjectId) -> Result<Option<(u64, u32)>> {
        if self.count == 0 {
            return Ok(None);
        }

        let slot = self.hash.slot(key);
        let mut entry = [0u8; SLOT_SIZE];
        self.file
            .read_exact_at(&mut entry, self.slots_offset + (slot * SLOT_SIZE) as u64)?;

        if entry[12..] != key.as_bytes()[..] {
            return Ok(None);
        }

        let offset = u64::from_be_bytes(entry[..8].try_into().expect("8 bytes"));
        let length = u32::from_be_bytes(entry[8..12].try_into().expect("4 bytes"));
        if offset < HEADER_SIZE as u64 || offset + length as u64 > self.payload_end {
            return Err(Error::Corrupt(format!(
                "slot for {} points outside the payload region",
                key
            )));
        }
        Ok(Some((offset, length)))
    }

    /// Sequential scan over all objects in insertion order.
    pub fn iter(&self) -> Result<ShardFileIter> {
        let mut file = self.file.try_clone()?;
        file.seek(SeekFrom::Start(HEADER_SIZE as u64))?;
        Ok(ShardFileIter {
            reader: BufReader::new(file),
            position: HEADER_SIZE as u64,
            end: self.payload_end,
        })
    }
}

/// Iterator over the payload frames of a shard file.
pub struct ShardFileIter {
    reader: BufReader<File>,
    position: u64,
    end: u64,
}

impl Iterator for ShardFileIter {
    type Item = Result<(ObjectId, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.end {
            return None;
        }
        Some(self.read_frame())
    }
}

impl ShardFileIter {
    fn read_frame(&mut self) -> Result<(ObjectId, Vec<u8>)> {
        let mut head = [0u8; FRAME_OVERHEAD];
        self.reader.read_exact(&mut head)?;
        let key = ObjectId::from_slice(&head[..OBJECT_ID_LEN])?;
        let length = u32::from_be_bytes(head[OBJECT_ID_LEN..].try_into().expect("4 bytes"));

        self.position += (FRAME_OVERHEAD + length as usize) as u64;
        if self.position > self.end {
            return Err(Error::Corrupt(format!(
                "payload frame for {} runs past the index",
                key
            )));
        }

        let mut content = vec![0u8; length as usize];
        self.reader.read_exact(&mut content)?;
        Ok((key, content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::ShardFileWriter;
    use std::collections::HashSet;

    fn build_shard(path: &Path, objects: &[(ObjectId, Vec<u8>)]) {
        let mut writer = ShardFileWriter::create(path).unwrap();
        for (id, content) in objects {
            writer.write(id, content).unwrap();
        }
        writer.finalize().unwrap();
    }

    fn sample_objects(n: usize) -> Vec<(ObjectId, Vec<u8>)> {
        (0..n)
            .map(|i| {
                let content = format!("content-{}-{}", i, "x".repeat(i % 97)).into_bytes();
                (ObjectId::from_content(&content), content)
            })
            .collect()
    }

    // ---------------------------------------------------------------
    // Roundtrips
    // ---------------------------------------------------------------

    #[test]
    fn test_roundtrip_single_object() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shard");
        let id = ObjectId::from_content(b"hello");
        build_shard(&path, &[(id, b"hello".to_vec())]);

        let shard = ShardFile::open(&path).unwrap();
        assert_eq!(shard.count(), 1);
        assert_eq!(shard.get(&id).unwrap().unwrap(), b"hello");
        assert!(shard.contains(&id).unwrap());
    }

    #[test]
    fn test_roundtrip_many_objects() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shard");
        let objects = sample_objects(2_000);
        build_shard(&path, &objects);

        let shard = ShardFile::open(&path).unwrap();
        assert_eq!(shard.count(), 2_000);
        for (id, content) in &objects {
            assert_eq!(shard.get(id).unwrap().unwrap(), *content);
        }
    }

    #[test]
    fn test_unknown_key_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shard");
        build_shard(&path, &sample_objects(100));

        let shard = ShardFile::open(&path).unwrap();
        let stranger = ObjectId::from_content(b"never stored");
        assert!(shard.get(&stranger).unwrap().is_none());
        assert!(!shard.contains(&stranger).unwrap());
    }

    #[test]
    fn test_empty_shard() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shard");
        build_shard(&path, &[]);

        let shard = ShardFile::open(&path).unwrap();
        assert_eq!(shard.count(), 0);
        let probe = ObjectId::from_content(b"anything");
        assert!(shard.get(&probe).unwrap().is_none());
        assert_eq!(shard.iter().unwrap().count(), 0);
    }

    #[test]
    fn test_empty_content_object() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shard");
        let id = ObjectId::from_content(b"");
        build_shard(&path, &[(id, Vec::new())]);

        let shard = ShardFile::open(&path).unwrap();
        assert_eq!(shard.get(&id).unwrap().unwrap(), Vec::<u8>::new());
    }

    // ---------------------------------------------------------------
    // Iteration
    // ---------------------------------------------------------------

    #[test]
    fn test_iter_yields_all_objects() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shard");
        let objects = sample_objects(500);
        build_shard(&path, &objects);

        let shard = ShardFile::open(&path).unwrap();
        let mut seen = HashSet::new();
        for frame in shard.iter().unwrap() {
            let (id, content) = frame.unwrap();
            assert_eq!(ObjectId::from_content(&content), id);
            seen.insert(id);
        }
        assert_eq!(seen.len(), objects.len());
        for (id, _) in &objects {
            assert!(seen.contains(id));
        }
    }

    #[test]
    fn test_iter_does_not_disturb_lookups() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shard");
        let objects = sample_objects(200);
        build_shard(&path, &objects);

        let shard = ShardFile::open(&path).unwrap();
        let mut iter = shard.iter().unwrap();
        iter.next().unwrap().unwrap();
        // Concurrent lookup while a scan is mid-flight
        assert_eq!(
            shard.get(&objects[150].0).unwrap().unwrap(),
            objects[150].1
        );
        assert_eq!(iter.count(), 199);
    }

    // ---------------------------------------------------------------
    // Corruption detection
    // ---------------------------------------------------------------

    #[test]
    fn test_bad_magic_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shard");
        build_shard(&path, &sample_objects(10));

        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.write_all_at(b"XXXX", 0).unwrap();
        assert!(matches!(ShardFile::open(&path), Err(Error::InvalidMagic)));
    }

    #[test]
    fn test_index_corruption_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shard");
        build_shard(&path, &sample_objects(10));

        // Flip a byte in the displacement array (right after the payload).
        let header = {
            let shard_bytes = std::fs::read(&path).unwrap();
            shard_bytes[..HEADER_SIZE].to_vec()
        };
        let index_offset =
            u64::from_be_bytes(header[40..48].try_into().unwrap());
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.write_all_at(&[0xFF], index_offset).unwrap();

        assert!(matches!(ShardFile::open(&path), Err(Error::CrcMismatch)));
    }

    #[test]
    fn test_truncated_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shard");
        build_shard(&path, &sample_objects(10));

        let len = std::fs::metadata(&path).unwrap().len();
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 8).unwrap();

        assert!(ShardFile::open(&path).is_err());
    }

    // ---------------------------------------------------------------
    // Block-device behaviour
    // ---------------------------------------------------------------

    #[test]
    fn test_oversized_backing_file() {
        // A mapped RBD image is larger than its logical content; the
        // format must not depend on the file ending at the footer.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shard");

        let file = std::fs::File::create(&path).unwrap();
        file.set_len(1024 * 1024).unwrap();
        drop(file);

        let objects = sample_objects(50);
        build_shard(&path, &objects);

        assert_eq!(std::fs::metadata(&path).unwrap().len(), 1024 * 1024);
        let shard = ShardFile::open(&path).unwrap();
        assert_eq!(shard.count(), 50);
        for (id, content) in &objects {
            assert_eq!(shard.get(id).unwrap().unwrap(), *content);
        }
        assert_eq!(shard.iter().unwrap().count(), 50);
    }
}

//! Perfect Hash for Packed Shards
//!
//! This module implements the hash-and-displace (CHD) construction used to
//! index RO-shard files. The hash is built once, at pack time, over the
//! complete key set of a shard; afterwards every lookup computes its slot
//! in O(1) with no collision probing.
//!
//! ## How It Works
//!
//! 1. Keys are distributed into `bucket_count ≈ n/4` buckets by a first
//!    hash.
//! 2. Buckets are processed largest-first. For each bucket, displacement
//!    values `d = 0, 1, 2, …` are tried until every key in the bucket maps
//!    to a distinct free slot through a second, `d`-seeded hash.
//! 3. The winning `d` for each bucket is recorded in a displacement array
//!    of `u32`s - the entire construction state needed at lookup time.
//!
//! Lookup recomputes the bucket, reads its displacement, and derives the
//! slot. The caller must compare the key stored in the slot against the
//! probe key: a perfect hash is a total function, so keys outside the
//! built set still map to *some* slot.
//!
//! ## Why Not a Library B-tree or HashMap?
//!
//! The index lives on disk inside an immutable file and is shared between
//! processes. CHD needs only `~n/4` u32 displacements in memory and one
//! slot probe per lookup, and the slot table itself can stay on disk.
//!
//! ## Hashing
//!
//! Object ids are usually SHA-256 digests and already uniform, but test
//! keys (and future non-hash ids) may not be. Both hash lanes therefore
//! run the key through a splitmix64-based mixer, folded with the seed, so
//! the construction converges on adversarial key sets too. The seed is
//! bumped and the construction retried on the rare pathological layout.

use crate::error::{Error, Result};
use crate::id::ObjectId;

/// Slots are over-provisioned by 1/8th so displacement search stays fast.
const SLOT_HEADROOM_SHIFT: u32 = 3;

/// Average keys per bucket.
const BUCKET_LOAD: usize = 4;

/// Give up on a bucket after this many displacement candidates.
const DISPLACEMENT_LIMIT: u32 = 1_000_000;

/// Retry the whole construction with a bumped seed this many times.
const MAX_SEED_ATTEMPTS: u64 = 16;

const BASE_SEED: u64 = 0x57_49_4e_45_52_59; // "WINERY"

/// A minimal perfect-hash function over a fixed set of object ids.
#[derive(Debug, Clone)]
pub struct PerfectHash {
    seed: u64,
    disp: Vec<u32>,
    slots: usize,
}

impl PerfectHash {
    /// Build the hash over `keys`. Fails on duplicate keys.
    pub fn build(keys: &[ObjectId]) -> Result<Self> {
        if let Some(dup) = find_duplicate(keys) {
            return Err(Error::Corrupt(format!("duplicate key {}", dup)));
        }

        for attempt in 0..MAX_SEED_ATTEMPTS {
            let seed = BASE_SEED.wrapping_add(attempt);
            if let Some(hash) = Self::try_build(keys, seed) {
                return Ok(hash);
            }
        }
        // With seed retries and slot headroom this only happens on
        // pathological inputs that made it past the duplicate check.
        Err(Error::Corrupt(
            "perfect hash construction did not converge".into(),
        ))
    }

    /// Reconstruct a hash from its serialized parts (shard file header +
    /// displacement array).
    pub fn from_parts(seed: u64, disp: Vec<u32>, slots: usize) -> Self {
        Self { seed, disp, slots }
    }

    fn try_build(keys: &[ObjectId], seed: u64) -> Option<Self> {
        let n = keys.len();
        let slots = n + (n >> SLOT_HEADROOM_SHIFT) + 1;
        let bucket_count = n / BUCKET_LOAD + 1;

        let mut buckets: Vec<Vec<usize>> = vec![Vec::new(); bucket_count];
        for (i, key) in keys.iter().enumerate() {
            let (h1, _) = hash_pair(key, seed);
            buckets[(h1 % bucket_count as u64) as usize].push(i);
        }

        // Largest buckets are placed first, while most slots are free.
        let mut order: Vec<usize> = (0..bucket_count).collect();
        order.sort_by_key(|&b| std::cmp::Reverse(buckets[b].len()));

        let mut disp = vec![0u32; bucket_count];
        let mut taken = vec![false; slots];
        let mut scratch: Vec<usize> = Vec::with_capacity(BUCKET_LOAD * 4);

        for &b in &order {
            let bucket = &buckets[b];
            if bucket.is_empty() {
                continue;
            }
            let mut placed = false;
            'displacement: for d in 0..DISPLACEMENT_LIMIT {
                scratch.clear();
                for &ki in bucket {
                    let (_, h2) = hash_pair(&keys[ki], seed);
                    let slot = displace(h2, d as u64, slots);
                    if taken[slot] || scratch.contains(&slot) {
                        continue 'displacement;
                    }
                    scratch.push(slot);
                }
                for &slot in &scratch {
                    taken[slot] = true;
                }
                disp[b] = d;
                placed = true;
                break;
            }
            if !placed {
                return None;
            }
        }

        Some(Self { seed, disp, slots })
    }

    /// Slot index for `key`. Total function: callers verify the key stored
    /// in the slot before trusting the result.
    pub fn slot(&self, key: &ObjectId) -> usize {
        let (h1, h2) = hash_pair(key, self.seed);
        let bucket = (h1 % self.disp.len() as u64) as usize;
        displace(h2, self.disp[bucket] as u64, self.slots)
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn slot_count(&self) -> usize {
        self.slots
    }

    pub fn bucket_count(&self) -> usize {
        self.disp.len()
    }

    pub fn displacements(&self) -> &[u32] {
        &self.disp
    }
}

fn displace(h2: u64, d: u64, slots: usize) -> usize {
    (splitmix64(h2 ^ d) % slots as u64) as usize
}

/// Two independent 64-bit hash lanes derived from the key and seed.
fn hash_pair(key: &ObjectId, seed: u64) -> (u64, u64) {
    let mut h = splitmix64(seed ^ 0x9e37_79b9_7f4a_7c15);
    for chunk in key.as_bytes().chunks_exact(8) {
        let lane = u64::from_be_bytes(chunk.try_into().expect("8-byte chunk"));
        h = splitmix64(h ^ lane);
    }
    (h, splitmix64(h))
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

fn find_duplicate(keys: &[ObjectId]) -> Option<ObjectId> {
    let mut sorted: Vec<&ObjectId> = keys.iter().collect();
    sorted.sort();
    sorted.windows(2).find(|w| w[0] == w[1]).map(|w| *w[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(n: usize) -> Vec<ObjectId> {
        (0..n)
            .map(|i| ObjectId::from_content(format!("key-{}", i).as_bytes()))
            .collect()
    }

    #[test]
    fn test_build_empty() {
        let hash = PerfectHash::build(&[]).unwrap();
        assert_eq!(hash.slot_count(), 1);
        // Any probe maps somewhere; the caller's key check rejects it.
        let probe = ObjectId::from_content(b"anything");
        assert!(hash.slot(&probe) < hash.slot_count());
    }

    #[test]
    fn test_build_single_key() {
        let ks = keys(1);
        let hash = PerfectHash::build(&ks).unwrap();
        assert!(hash.slot(&ks[0]) < hash.slot_count());
    }

    #[test]
    fn test_slots_are_distinct() {
        let ks = keys(10_000);
        let hash = PerfectHash::build(&ks).unwrap();

        let mut seen = vec![false; hash.slot_count()];
        for key in &ks {
            let slot = hash.slot(key);
            assert!(!seen[slot], "slot collision at {}", slot);
            seen[slot] = true;
        }
    }

    #[test]
    fn test_adversarial_keys_converge() {
        // Sequential ids, not hash output: all structure, no entropy.
        let ks: Vec<ObjectId> = (0u32..5_000)
            .map(|i| {
                let mut bytes = [0u8; 32];
                bytes[28..].copy_from_slice(&i.to_be_bytes());
                ObjectId::new(bytes)
            })
            .collect();
        let hash = PerfectHash::build(&ks).unwrap();

        let mut seen = vec![false; hash.slot_count()];
        for key in &ks {
            let slot = hash.slot(key);
            assert!(!seen[slot]);
            seen[slot] = true;
        }
    }

    #[test]
    fn test_duplicate_keys_rejected() {
        let mut ks = keys(10);
        ks.push(ks[3]);
        let err = PerfectHash::build(&ks).unwrap_err();
        assert!(matches!(err, Error::Corrupt(_)));
    }

    #[test]
    fn test_from_parts_reproduces_slots() {
        let ks = keys(500);
        let built = PerfectHash::build(&ks).unwrap();
        let restored = PerfectHash::from_parts(
            built.seed(),
            built.displacements().to_vec(),
            built.slot_count(),
        );
        for key in &ks {
            assert_eq!(built.slot(key), restored.slot(key));
        }
    }
}

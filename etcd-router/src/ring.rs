//! Consistent-hash ring - CRC32 with virtual points
//!
//! Each target is placed on a 32-bit ring `replicas` times, at
//! `crc32(target ++ i)`. A key belongs to the first point strictly after
//! `crc32(key)`, wrapping around to the lowest point. Adding or removing a
//! target only moves the keys adjacent to its points.

use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};

/// Default number of virtual points per target
pub const DEFAULT_REPLICAS: usize = 64;

/// Position of a string on the ring
pub fn ring_position(data: &str) -> u32 {
    crc32fast::hash(data.as_bytes())
}

/// Extract hash tag from key
///
/// Hash tags allow multiple keys to be stored on the same shard.
/// Format: `{tag}key` or `key{tag}` - only the tag is hashed.
pub fn extract_hash_tag(key: &str) -> Option<&str> {
    let start = key.find('{')?;
    let end = key[start + 1..].find('}')?;
    let tag = &key[start + 1..start + 1 + end];
    if tag.is_empty() { None } else { Some(tag) }
}

/// Ring of target indices
#[derive(Debug, Clone)]
pub struct HashRing {
    /// position -> index of the target in the slice the ring was built from
    points: BTreeMap<u32, usize>,
}

impl HashRing {
    /// Build a ring over `targets`. On a position collision the later target wins.
    pub fn new<S: AsRef<str>>(targets: &[S], replicas: usize) -> Self {
        let mut points = BTreeMap::new();
        for (index, target) in targets.iter().enumerate() {
            for i in 0..replicas {
                let position = ring_position(&format!("{}{}", target.as_ref(), i));
                points.insert(position, index);
            }
        }
        Self { points }
    }

    /// Index of the target owning `key`, `None` on an empty ring
    pub fn lookup(&self, key: &str) -> Option<usize> {
        let position = ring_position(key);
        self.points
            .range((Excluded(position), Unbounded))
            .next()
            .or_else(|| self.points.iter().next())
            .map(|(_, &index)| index)
    }

    /// Number of points on the ring
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

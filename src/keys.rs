// Copyright (c) 2024-present
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Composite-key encoding for the digest store's four column families (§6).
//!
//! Every key is prefixed with a one-byte map tag so a single flat, lexicographically
//! sorted key/value backend can host all four maps while keeping range scans over one
//! map from ever crossing into another.

use byteorder::{BigEndian, WriteBytesExt};
use std::io::Write;

pub type TreeId = u64;

const TAG_SEGMENT_DATA: u8 = 0x01;
const TAG_SEGMENT_HASH: u8 = 0x02;
const TAG_DIRTY_SEGMENT: u8 = 0x03;
const TAG_META: u8 = 0x04;

pub const META_SCOPE_LAST_FULL_REBUILD: u8 = 0x01;

/// `0x01 | treeId(8B BE) | segId(4B BE) | keyBytes`
#[must_use]
pub fn segment_data_key(tree_id: TreeId, seg_id: u32, key: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + 8 + 4 + key.len());
    buf.push(TAG_SEGMENT_DATA);
    buf.write_u64::<BigEndian>(tree_id).expect("vec write cannot fail");
    buf.write_u32::<BigEndian>(seg_id).expect("vec write cannot fail");
    buf.write_all(key).expect("vec write cannot fail");
    buf
}

/// Prefix shared by every key in segment `(tree_id, seg_id)`; also used to bound range
/// scans over segment data.
#[must_use]
pub fn segment_data_prefix(tree_id: TreeId, seg_id: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + 8 + 4);
    buf.push(TAG_SEGMENT_DATA);
    buf.write_u64::<BigEndian>(tree_id).expect("vec write cannot fail");
    buf.write_u32::<BigEndian>(seg_id).expect("vec write cannot fail");
    buf
}

/// Returns the raw key bytes with the `(tag, treeId, segId)` prefix stripped off.
#[must_use]
pub fn strip_segment_data_prefix(tree_id: TreeId, seg_id: u32, full_key: &[u8]) -> Vec<u8> {
    let prefix = segment_data_prefix(tree_id, seg_id);
    full_key
        .get(prefix.len()..)
        .expect("key shorter than its own prefix")
        .to_vec()
}

/// `0x02 | treeId(8B BE) | nodeId(4B BE)`
#[must_use]
pub fn segment_hash_key(tree_id: TreeId, node_id: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + 8 + 4);
    buf.push(TAG_SEGMENT_HASH);
    buf.write_u64::<BigEndian>(tree_id).expect("vec write cannot fail");
    buf.write_u32::<BigEndian>(node_id).expect("vec write cannot fail");
    buf
}

/// `0x03 | treeId(8B BE) | segId(4B BE)`
#[must_use]
pub fn dirty_segment_key(tree_id: TreeId, seg_id: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + 8 + 4);
    buf.push(TAG_DIRTY_SEGMENT);
    buf.write_u64::<BigEndian>(tree_id).expect("vec write cannot fail");
    buf.write_u32::<BigEndian>(seg_id).expect("vec write cannot fail");
    buf
}

/// Prefix bounding every dirty-segment key for `tree_id`.
#[must_use]
pub fn dirty_segment_prefix(tree_id: TreeId) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + 8);
    buf.push(TAG_DIRTY_SEGMENT);
    buf.write_u64::<BigEndian>(tree_id).expect("vec write cannot fail");
    buf
}

/// `0x04 | treeId(8B BE) | scope(1B)`
#[must_use]
pub fn meta_key(tree_id: TreeId, scope: u8) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + 8 + 1);
    buf.push(TAG_META);
    buf.write_u64::<BigEndian>(tree_id).expect("vec write cannot fail");
    buf.push(scope);
    buf
}

/// The exclusive upper bound of the range covered by `prefix`: the lexicographically
/// smallest key that is *not* prefixed by `prefix`. Returns `None` if `prefix` is
/// empty or consists entirely of `0xFF` bytes, in which case the range is unbounded
/// above.
#[must_use]
pub fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    if prefix.is_empty() {
        return None;
    }

    let mut end = prefix.to_vec();
    let len = end.len();

    for (idx, byte) in end.iter_mut().rev().enumerate() {
        let idx = len - 1 - idx;

        if *byte < 255 {
            *byte += 1;
            end.truncate(idx + 1);
            return Some(end);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_data_keys_sort_by_key_within_a_segment() {
        let a = segment_data_key(1, 1, b"a");
        let b = segment_data_key(1, 1, b"b");
        let z = segment_data_key(1, 1, b"zz");
        assert!(a < b);
        assert!(b < z);
    }

    #[test]
    fn segments_do_not_collide_across_tree_or_segment_id() {
        let a = segment_data_key(1, 1, b"x");
        let b = segment_data_key(1, 2, b"x");
        let c = segment_data_key(2, 1, b"x");
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn prefix_strip_round_trips() {
        let key = b"hello-world".to_vec();
        let full = segment_data_key(7, 3, &key);
        assert_eq!(key, strip_segment_data_prefix(7, 3, &full));
    }

    #[test]
    fn prefix_upper_bound_excludes_siblings() {
        let prefix = segment_data_prefix(1, 1);
        let upper = prefix_upper_bound(&prefix).expect("prefix is not all 0xFF");

        let inside = segment_data_key(1, 1, &[0xFF, 0xFF]);
        let sibling = segment_data_key(1, 2, b"a");

        assert!(inside < upper);
        assert!(sibling >= upper);
    }

    #[test]
    fn maps_are_disjoint_by_tag() {
        let data = segment_data_key(1, 0, b"k");
        let hash = segment_hash_key(1, 0);
        let dirty = dirty_segment_key(1, 0);
        let meta = meta_key(1, META_SCOPE_LAST_FULL_REBUILD);
        assert_ne!(data[0], hash[0]);
        assert_ne!(hash[0], dirty[0]);
        assert_ne!(dirty[0], meta[0]);
    }
}

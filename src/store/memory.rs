// Copyright (c) 2024-present
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{DigestStore, SegmentEntry};
use crate::digest::Hash;
use crate::keys::{self, TreeId};
use crate::tree_math::{NodeId, SegmentId};
use crate::{Error, Result};
use crossbeam_skiplist::SkipMap;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::{Arc, RwLock};

/// In-process default [`DigestStore`], backed by a single
/// [`crossbeam_skiplist::SkipMap`] over the big-endian composite-key layout of
/// [`crate::keys`] -- the same way the teacher crate's own `MemTable` uses a
/// `SkipMap` as a concurrently-readable, ordered in-memory index.
///
/// Range scans (`get_segment`, `segment_data_iter`, `dirty_segments`) are genuine
/// range scans over the skiplist rather than filtered full scans, since keys already
/// sort the way the logical column families require.
#[derive(Default)]
pub struct MemoryDigestStore {
    map: SkipMap<Vec<u8>, Vec<u8>>,
    dirty_locks: RwLock<FxHashMap<TreeId, Arc<Mutex<()>>>>,
}

impl MemoryDigestStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn dirty_lock(&self, tree_id: TreeId) -> Arc<Mutex<()>> {
        if let Some(lock) = self.dirty_locks.read().expect("lock is poisoned").get(&tree_id) {
            return Arc::clone(lock);
        }

        Arc::clone(
            self.dirty_locks
                .write()
                .expect("lock is poisoned")
                .entry(tree_id)
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    fn hash_at(&self, key: &[u8]) -> Result<Option<Hash>> {
        let Some(entry) = self.map.get(key) else {
            return Ok(None);
        };

        let hash: Hash = entry
            .value()
            .as_slice()
            .try_into()
            .map_err(|_| Error::Store("corrupt digest (not 20 bytes)".into()))?;

        Ok(Some(hash))
    }
}

impl DigestStore for MemoryDigestStore {
    fn put_segment_data(&self, tree_id: TreeId, seg_id: SegmentId, key: &[u8], digest: Hash) -> Result<()> {
        self.map
            .insert(keys::segment_data_key(tree_id, seg_id, key), digest.to_vec());
        Ok(())
    }

    fn delete_segment_data(&self, tree_id: TreeId, seg_id: SegmentId, key: &[u8]) -> Result<()> {
        self.map.remove(&keys::segment_data_key(tree_id, seg_id, key));
        Ok(())
    }

    fn get_segment_data(&self, tree_id: TreeId, seg_id: SegmentId, key: &[u8]) -> Result<Option<Hash>> {
        self.hash_at(&keys::segment_data_key(tree_id, seg_id, key))
    }

    fn get_segment(&self, tree_id: TreeId, seg_id: SegmentId) -> Result<Vec<SegmentEntry>> {
        let prefix = keys::segment_data_prefix(tree_id, seg_id);
        let mut out = Vec::new();

        for entry in self.map.range(prefix.clone()..) {
            if !entry.key().starts_with(&prefix) {
                break;
            }

            let key = keys::strip_segment_data_prefix(tree_id, seg_id, entry.key());
            let digest: Hash = entry
                .value()
                .as_slice()
                .try_into()
                .map_err(|_| Error::Store("corrupt digest (not 20 bytes)".into()))?;

            out.push((key, digest));
        }

        Ok(out)
    }

    fn segment_data_iter(
        &self,
        tree_id: TreeId,
        leaf_from: SegmentId,
        leaf_to: SegmentId,
    ) -> Result<Box<dyn Iterator<Item = Result<(SegmentId, Vec<u8>, Hash)>> + '_>> {
        let lower = keys::segment_data_prefix(tree_id, leaf_from);
        let upper_prefix = keys::segment_data_prefix(tree_id, leaf_to);
        let upper = keys::prefix_upper_bound(&upper_prefix);

        let iter: Box<dyn Iterator<Item = crossbeam_skiplist::map::Entry<'_, Vec<u8>, Vec<u8>>>> =
            match upper {
                Some(upper) => Box::new(self.map.range(lower..upper)),
                None => Box::new(self.map.range(lower..)),
            };

        let tag = lower[0];

        Ok(Box::new(iter.map(move |entry| {
            let full_key = entry.key();

            if full_key.first() != Some(&tag) {
                return Err(Error::Store("iterator crossed column-family boundary".into()));
            }

            #[allow(clippy::cast_possible_truncation)]
            let seg_id = u32::from_be_bytes(
                full_key
                    .get(9..13)
                    .ok_or_else(|| Error::Store("malformed segment-data key".into()))?
                    .try_into()
                    .expect("slice is exactly 4 bytes"),
            );

            let key = full_key.get(13..).unwrap_or_default().to_vec();
            let digest: Hash = entry
                .value()
                .as_slice()
                .try_into()
                .map_err(|_| Error::Store("corrupt digest (not 20 bytes)".into()))?;

            Ok((seg_id, key, digest))
        })))
    }

    fn put_segment_hash(&self, tree_id: TreeId, node_id: NodeId, hash: Hash) -> Result<()> {
        self.map.insert(keys::segment_hash_key(tree_id, node_id), hash.to_vec());
        Ok(())
    }

    fn get_segment_hash(&self, tree_id: TreeId, node_id: NodeId) -> Result<Option<Hash>> {
        self.hash_at(&keys::segment_hash_key(tree_id, node_id))
    }

    fn get_segment_hashes(&self, tree_id: TreeId, node_ids: &[NodeId]) -> Result<Vec<(NodeId, Hash)>> {
        let mut sorted_ids = node_ids.to_vec();
        sorted_ids.sort_unstable();
        sorted_ids.dedup();

        let mut out = Vec::with_capacity(sorted_ids.len());
        for node_id in sorted_ids {
            if let Some(hash) = self.get_segment_hash(tree_id, node_id)? {
                out.push((node_id, hash));
            }
        }
        Ok(out)
    }

    fn set_dirty_segment(&self, tree_id: TreeId, seg_id: SegmentId) -> Result<bool> {
        let key = keys::dirty_segment_key(tree_id, seg_id);
        let was_present = self.map.get(&key).is_some();
        self.map.insert(key, Vec::new());
        Ok(was_present)
    }

    fn clear_dirty_segment(&self, tree_id: TreeId, seg_id: SegmentId) -> Result<bool> {
        let key = keys::dirty_segment_key(tree_id, seg_id);
        Ok(self.map.remove(&key).is_some())
    }

    fn dirty_segments(&self, tree_id: TreeId) -> Result<Vec<SegmentId>> {
        let prefix = keys::dirty_segment_prefix(tree_id);
        let mut out = Vec::new();

        for entry in self.map.range(prefix.clone()..) {
            if !entry.key().starts_with(&prefix) {
                break;
            }

            let seg_id_bytes: [u8; 4] = entry
                .key()
                .get(9..13)
                .ok_or_else(|| Error::Store("malformed dirty-segment key".into()))?
                .try_into()
                .expect("slice is exactly 4 bytes");

            out.push(u32::from_be_bytes(seg_id_bytes));
        }

        Ok(out)
    }

    fn clear_and_get_dirty_segments(&self, tree_id: TreeId) -> Result<Vec<SegmentId>> {
        let lock = self.dirty_lock(tree_id);
        let _guard = lock.lock();

        let snapshot = self.dirty_segments(tree_id)?;
        self.unmark_segments(tree_id, &snapshot)?;
        Ok(snapshot)
    }

    fn mark_segments(&self, tree_id: TreeId, seg_ids: &[SegmentId]) -> Result<()> {
        for &seg_id in seg_ids {
            self.set_dirty_segment(tree_id, seg_id)?;
        }
        Ok(())
    }

    fn unmark_segments(&self, tree_id: TreeId, seg_ids: &[SegmentId]) -> Result<()> {
        for &seg_id in seg_ids {
            self.clear_dirty_segment(tree_id, seg_id)?;
        }
        Ok(())
    }

    fn last_full_rebuild(&self, tree_id: TreeId) -> Result<u64> {
        let key = keys::meta_key(tree_id, keys::META_SCOPE_LAST_FULL_REBUILD);
        match self.map.get(&key) {
            Some(entry) => {
                let bytes: [u8; 8] = entry
                    .value()
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::Store("corrupt rebuild timestamp".into()))?;
                Ok(u64::from_be_bytes(bytes))
            }
            None => Ok(0),
        }
    }

    fn set_last_full_rebuild(&self, tree_id: TreeId, millis: u64) -> Result<()> {
        let key = keys::meta_key(tree_id, keys::META_SCOPE_LAST_FULL_REBUILD);
        self.map.insert(key, millis.to_be_bytes().to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_segment_data() {
        let store = MemoryDigestStore::new();
        let digest = [7u8; 20];
        store.put_segment_data(1, 0, b"k", digest).unwrap();
        assert_eq!(Some(digest), store.get_segment_data(1, 0, b"k").unwrap());
    }

    #[test]
    fn get_segment_is_ordered_by_key() {
        let store = MemoryDigestStore::new();
        store.put_segment_data(1, 0, b"zeta", [1; 20]).unwrap();
        store.put_segment_data(1, 0, b"alpha", [2; 20]).unwrap();
        store.put_segment_data(1, 0, b"mid", [3; 20]).unwrap();

        let entries = store.get_segment(1, 0).unwrap();
        let keys: Vec<_> = entries.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(vec![b"alpha".to_vec(), b"mid".to_vec(), b"zeta".to_vec()], keys);
    }

    #[test]
    fn get_segment_does_not_cross_segment_boundary() {
        let store = MemoryDigestStore::new();
        store.put_segment_data(1, 0, b"a", [1; 20]).unwrap();
        store.put_segment_data(1, 1, b"b", [2; 20]).unwrap();

        assert_eq!(1, store.get_segment(1, 0).unwrap().len());
        assert_eq!(1, store.get_segment(1, 1).unwrap().len());
    }

    #[test]
    fn get_segment_does_not_cross_tree_boundary() {
        let store = MemoryDigestStore::new();
        store.put_segment_data(1, 0, b"a", [1; 20]).unwrap();
        store.put_segment_data(2, 0, b"a", [2; 20]).unwrap();

        assert_eq!(1, store.get_segment(1, 0).unwrap().len());
        assert_eq!(1, store.get_segment(2, 0).unwrap().len());
    }

    #[test]
    fn dirty_set_and_clear_and_get() {
        let store = MemoryDigestStore::new();
        assert!(!store.set_dirty_segment(1, 3).unwrap());
        assert!(store.set_dirty_segment(1, 3).unwrap());

        assert_eq!(vec![3], store.dirty_segments(1).unwrap());
        assert_eq!(vec![3], store.clear_and_get_dirty_segments(1).unwrap());
        assert!(store.dirty_segments(1).unwrap().is_empty());
    }

    #[test]
    fn mark_and_unmark_are_idempotent() {
        let store = MemoryDigestStore::new();
        store.mark_segments(1, &[1, 2, 3]).unwrap();
        store.mark_segments(1, &[1, 2, 3]).unwrap();
        assert_eq!(vec![1, 2, 3], store.dirty_segments(1).unwrap());

        store.unmark_segments(1, &[2]).unwrap();
        store.unmark_segments(1, &[2]).unwrap();
        assert_eq!(vec![1, 3], store.dirty_segments(1).unwrap());
    }

    #[test]
    fn segment_data_iter_spans_a_leaf_range() {
        let store = MemoryDigestStore::new();
        store.put_segment_data(1, 0, b"a", [1; 20]).unwrap();
        store.put_segment_data(1, 1, b"b", [2; 20]).unwrap();
        store.put_segment_data(1, 2, b"c", [3; 20]).unwrap();

        let items: Vec<_> = store
            .segment_data_iter(1, 0, 1)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(2, items.len());
        assert_eq!(0, items[0].0);
        assert_eq!(1, items[1].0);
    }

    #[test]
    fn last_full_rebuild_defaults_to_zero() {
        let store = MemoryDigestStore::new();
        assert_eq!(0, store.last_full_rebuild(1).unwrap());
        store.set_last_full_rebuild(1, 1234).unwrap();
        assert_eq!(1234, store.last_full_rebuild(1).unwrap());
    }
}

// Copyright (c) 2024-present
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Test-only [`DigestStore`] decorator that fails a chosen call deterministically, used
//! to exercise the engine's failure-recovery paths (dirty-segment re-marking on a
//! mid-rebuild error) without a real flaky backend.

use super::{DigestStore, SegmentEntry};
use crate::digest::Hash;
use crate::keys::TreeId;
use crate::tree_math::{NodeId, SegmentId};
use crate::{Error, Result};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Wraps a [`DigestStore`] so its `get_segment` calls fail starting from the `fail_at`th
/// call (1-indexed); every other method and every call before that one passes through
/// to `inner` unchanged.
pub struct FailingDigestStore<D> {
    inner: D,
    fail_at: usize,
    get_segment_calls: AtomicUsize,
}

impl<D> FailingDigestStore<D> {
    pub fn new(inner: D, fail_at: usize) -> Self {
        Self { inner, fail_at, get_segment_calls: AtomicUsize::new(0) }
    }
}

impl<D: DigestStore> DigestStore for FailingDigestStore<D> {
    fn put_segment_data(&self, tree_id: TreeId, seg_id: SegmentId, key: &[u8], digest: Hash) -> Result<()> {
        self.inner.put_segment_data(tree_id, seg_id, key, digest)
    }

    fn delete_segment_data(&self, tree_id: TreeId, seg_id: SegmentId, key: &[u8]) -> Result<()> {
        self.inner.delete_segment_data(tree_id, seg_id, key)
    }

    fn get_segment_data(&self, tree_id: TreeId, seg_id: SegmentId, key: &[u8]) -> Result<Option<Hash>> {
        self.inner.get_segment_data(tree_id, seg_id, key)
    }

    fn get_segment(&self, tree_id: TreeId, seg_id: SegmentId) -> Result<Vec<SegmentEntry>> {
        let call = self.get_segment_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_at {
            return Err(Error::Store("injected failure".into()));
        }
        self.inner.get_segment(tree_id, seg_id)
    }

    fn segment_data_iter(
        &self,
        tree_id: TreeId,
        leaf_from: SegmentId,
        leaf_to: SegmentId,
    ) -> Result<Box<dyn Iterator<Item = Result<(SegmentId, Vec<u8>, Hash)>> + '_>> {
        self.inner.segment_data_iter(tree_id, leaf_from, leaf_to)
    }

    fn put_segment_hash(&self, tree_id: TreeId, node_id: NodeId, hash: Hash) -> Result<()> {
        self.inner.put_segment_hash(tree_id, node_id, hash)
    }

    fn get_segment_hash(&self, tree_id: TreeId, node_id: NodeId) -> Result<Option<Hash>> {
        self.inner.get_segment_hash(tree_id, node_id)
    }

    fn get_segment_hashes(&self, tree_id: TreeId, node_ids: &[NodeId]) -> Result<Vec<(NodeId, Hash)>> {
        self.inner.get_segment_hashes(tree_id, node_ids)
    }

    fn set_dirty_segment(&self, tree_id: TreeId, seg_id: SegmentId) -> Result<bool> {
        self.inner.set_dirty_segment(tree_id, seg_id)
    }

    fn clear_dirty_segment(&self, tree_id: TreeId, seg_id: SegmentId) -> Result<bool> {
        self.inner.clear_dirty_segment(tree_id, seg_id)
    }

    fn dirty_segments(&self, tree_id: TreeId) -> Result<Vec<SegmentId>> {
        self.inner.dirty_segments(tree_id)
    }

    fn clear_and_get_dirty_segments(&self, tree_id: TreeId) -> Result<Vec<SegmentId>> {
        self.inner.clear_and_get_dirty_segments(tree_id)
    }

    fn mark_segments(&self, tree_id: TreeId, seg_ids: &[SegmentId]) -> Result<()> {
        self.inner.mark_segments(tree_id, seg_ids)
    }

    fn unmark_segments(&self, tree_id: TreeId, seg_ids: &[SegmentId]) -> Result<()> {
        self.inner.unmark_segments(tree_id, seg_ids)
    }

    fn last_full_rebuild(&self, tree_id: TreeId) -> Result<u64> {
        self.inner.last_full_rebuild(tree_id)
    }

    fn set_last_full_rebuild(&self, tree_id: TreeId, millis: u64) -> Result<()> {
        self.inner.set_last_full_rebuild(tree_id, millis)
    }
}

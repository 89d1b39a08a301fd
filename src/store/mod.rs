// Copyright (c) 2024-present
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The digest store: a persistent, ordered key/value backend holding the four column
//! families described in §4.2 / §6. This module only defines the contract
//! ([`DigestStore`]); [`memory::MemoryDigestStore`] is the shipped in-process default.

#[cfg(test)]
mod fault_injecting;
mod memory;

#[cfg(test)]
pub(crate) use fault_injecting::FailingDigestStore;
pub use memory::MemoryDigestStore;

use crate::digest::Hash;
use crate::keys::TreeId;
use crate::tree_math::{NodeId, SegmentId};
use crate::Result;

/// One `(key, digest)` pair as stored under a segment, ordered by `key`.
pub type SegmentEntry = (Vec<u8>, Hash);

/// Persistent, ordered key/value contract consumed by the hash-tree engine.
///
/// Implementors only need to guarantee the per-key atomicity and snapshot-consistency
/// described in §4.2; the engine does the rest. A real backend (an embedded LSM-tree,
/// `sled`, a column-family RocksDB handle, ...) can implement this directly over the
/// byte layout documented in [`crate::keys`].
pub trait DigestStore: Send + Sync {
    /// Writes `(key, digest)` under `(tree_id, seg_id)`. Durable before return.
    fn put_segment_data(&self, tree_id: TreeId, seg_id: SegmentId, key: &[u8], digest: Hash) -> Result<()>;

    /// Removes the datum for `key` under `(tree_id, seg_id)`, if present.
    fn delete_segment_data(&self, tree_id: TreeId, seg_id: SegmentId, key: &[u8]) -> Result<()>;

    /// Exact lookup of a single datum.
    fn get_segment_data(&self, tree_id: TreeId, seg_id: SegmentId, key: &[u8]) -> Result<Option<Hash>>;

    /// All data in the segment, ordered by key ascending, snapshot-consistent with
    /// respect to concurrent writes.
    fn get_segment(&self, tree_id: TreeId, seg_id: SegmentId) -> Result<Vec<SegmentEntry>>;

    /// Lazily iterates all `(seg_id, key, digest)` triples across a contiguous,
    /// inclusive leaf range `[leaf_from, leaf_to]`, ordered by `(seg_id, key)`.
    fn segment_data_iter(
        &self,
        tree_id: TreeId,
        leaf_from: SegmentId,
        leaf_to: SegmentId,
    ) -> Result<Box<dyn Iterator<Item = Result<(SegmentId, Vec<u8>, Hash)>> + '_>>;

    /// Writes the digest of a tree node.
    fn put_segment_hash(&self, tree_id: TreeId, node_id: NodeId, hash: Hash) -> Result<()>;

    /// Exact lookup of a single node hash.
    fn get_segment_hash(&self, tree_id: TreeId, node_id: NodeId) -> Result<Option<Hash>>;

    /// Batched lookup; returns only the nodes that currently have a stored hash,
    /// ordered by `node_id` ascending.
    fn get_segment_hashes(&self, tree_id: TreeId, node_ids: &[NodeId]) -> Result<Vec<(NodeId, Hash)>>;

    /// Sets the dirty bit for `seg_id`, returning the prior value.
    fn set_dirty_segment(&self, tree_id: TreeId, seg_id: SegmentId) -> Result<bool>;

    /// Test-and-clear of the dirty bit for `seg_id`, returning the prior value.
    fn clear_dirty_segment(&self, tree_id: TreeId, seg_id: SegmentId) -> Result<bool>;

    /// Snapshot of every currently-dirty segment for `tree_id`.
    fn dirty_segments(&self, tree_id: TreeId) -> Result<Vec<SegmentId>>;

    /// Snapshot-then-clear of every dirty segment, atomic against readers.
    fn clear_and_get_dirty_segments(&self, tree_id: TreeId) -> Result<Vec<SegmentId>>;

    /// Sets the dirty bit for each of `seg_ids` (idempotent).
    fn mark_segments(&self, tree_id: TreeId, seg_ids: &[SegmentId]) -> Result<()>;

    /// Clears the dirty bit for each of `seg_ids` (idempotent).
    fn unmark_segments(&self, tree_id: TreeId, seg_ids: &[SegmentId]) -> Result<()>;

    /// The unix-ms timestamp of the last full rebuild, or 0 if none occurred yet.
    fn last_full_rebuild(&self, tree_id: TreeId) -> Result<u64>;

    /// Records a new last-full-rebuild timestamp.
    fn set_last_full_rebuild(&self, tree_id: TreeId, millis: u64) -> Result<()>;
}

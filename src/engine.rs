// Copyright (c) 2024-present
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The hash-tree engine (§3, §4.4): owns the data-model invariants, `h_put`/`h_remove`,
//! `rebuild`, `synch`, and the peer-driven write surface (`s_put`/`s_remove`/
//! `delete_tree_node`). Roughly the core of the crate; every other module exists to
//! support this one.

use crate::config::{FullRebuildMode, HashTreeConfig};
use crate::digest::{self, Hash};
use crate::observer::ObserverRegistry;
use crate::queue::{NonBlockingQueue, QueueItem};
use crate::rpc::Peer;
use crate::store::{DigestStore, SegmentEntry};
use crate::time;
use crate::tree_math::{self, NodeId, SegmentId};
use crate::user_store::UserStore;
use crate::walker;
use crate::{Error, Result};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;

/// Which side of a sync the outcome was measured against, as returned by [`HashTree::synch`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncType {
    /// Differences are computed and pushed to the remote.
    Update,
    /// Differences are computed only; nothing is sent to the remote.
    LocalOnly,
}

/// Result of a [`HashTree::synch`] call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Number of individual keys found to differ (added, changed, or removed).
    pub key_differences: usize,
    /// Number of whole subtrees found missing on one side (a stronger signal than a
    /// single key difference -- an entire segment range is out of sync).
    pub extrinsic_segments: usize,
}

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq)]
enum EngineState {
    Created = 0,
    Started = 1,
    Stopped = 2,
}

impl From<u8> for EngineState {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Started,
            2 => Self::Stopped,
            _ => Self::Created,
        }
    }
}

/// The hash-tree engine. Generic over the digest-store and user-store backends; the
/// tree-id/seg-id/lock providers are held as trait objects inside [`HashTreeConfig`]
/// since they are chosen once at construction and never need monomorphizing.
pub struct HashTree<D, U> {
    config: HashTreeConfig,
    digest_store: D,
    user_store: U,
    observers: ObserverRegistry,
    queue: Option<Arc<NonBlockingQueue>>,
    worker: RwLock<Option<JoinHandle<()>>>,
    state: AtomicU8,
}

impl<D, U> HashTree<D, U>
where
    D: DigestStore,
    U: UserStore,
{
    /// Builds and starts the engine over the given stores, returned behind an `Arc`
    /// since the non-blocking worker thread (when enabled) holds a handle back into
    /// the engine to apply drained updates.
    pub fn new(config: HashTreeConfig, digest_store: D, user_store: U) -> Arc<Self>
    where
        D: 'static,
        U: 'static,
    {
        let queue = config
            .enable_non_blocking_calls
            .then(|| Arc::new(NonBlockingQueue::new(config.non_blocking_queue_size)));

        let tree = Arc::new(Self {
            config,
            digest_store,
            user_store,
            observers: ObserverRegistry::new(),
            queue,
            worker: RwLock::new(None),
            state: AtomicU8::new(EngineState::Started as u8),
        });

        if let Some(queue) = tree.queue.clone() {
            let worker_tree = Arc::clone(&tree);
            let handle = NonBlockingQueue::spawn_worker(queue, move |item| worker_tree.apply_queue_item(item));
            *tree.worker.write().expect("lock is poisoned") = Some(handle);
        }

        tree
    }

    fn apply_queue_item(&self, item: &QueueItem) -> Result<()> {
        match item {
            QueueItem::Put { key, value, .. } => self.apply_put(key, value),
            QueueItem::Remove { key, .. } => self.apply_remove(key),
            QueueItem::PutIfAbsent { tree_id, key, value } => {
                let seg_id = self.config.seg_id_of(key);
                if self.digest_store.get_segment_data(*tree_id, seg_id, key)?.is_none() {
                    self.apply_put(key, value)?;
                }
                Ok(())
            }
            QueueItem::RemoveIfAbsent { key, .. } => {
                if self.user_store.get(key)?.is_none() {
                    self.apply_remove(key)?;
                }
                Ok(())
            }
            QueueItem::Stop => Ok(()),
        }
    }

    fn state(&self) -> EngineState {
        EngineState::from(self.state.load(Ordering::Acquire))
    }

    fn ensure_started(&self) -> Result<()> {
        if self.state() != EngineState::Started {
            return Err(Error::Config("hash-tree engine is not started"));
        }
        Ok(())
    }

    /// Registers an observer. See [`crate::observer::ObserverRegistry::register`].
    pub fn register_observer(&self, observer: Arc<dyn crate::observer::HashTreeObserver>) {
        self.observers.register(observer);
    }

    /// Direct access to the user store, e.g. for a caller seeding or inspecting data
    /// outside the digest path.
    pub fn user_store(&self) -> &U {
        &self.user_store
    }

    /// Direct access to the digest store.
    pub fn digest_store(&self) -> &D {
        &self.digest_store
    }

    fn route(&self, key: &[u8]) -> Result<(u64, SegmentId)> {
        let tree_id_provider = self
            .config
            .tree_id_provider
            .as_ref()
            .expect("build() guarantees a tree_id_provider is set");
        let tree_id = tree_id_provider.tree_id_of(key);
        let seg_id = self.config.seg_id_of(key);
        Ok((tree_id, seg_id))
    }

    /// Writes `value` under `key`: computes `(tree_id, seg_id)`, stores `(key,
    /// SHA-1(value))` in segment-data, and marks the segment dirty. When non-blocking
    /// is enabled, this only enqueues the write and returns; the worker thread applies
    /// it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the engine has been stopped, or whatever the
    /// digest store reports for the underlying write.
    pub fn h_put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.ensure_started()?;

        if let Some(queue) = &self.queue {
            queue.enqueue(QueueItem::Put {
                tree_id: self.route(key)?.0,
                key: key.to_vec(),
                value: value.to_vec(),
            });
            return Ok(());
        }

        self.apply_put(key, value)
    }

    /// Symmetric to [`Self::h_put`]: deletes the datum for `key` and marks its
    /// segment dirty.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the engine has been stopped, or whatever the
    /// digest store reports for the underlying write.
    pub fn h_remove(&self, key: &[u8]) -> Result<()> {
        self.ensure_started()?;

        if let Some(queue) = &self.queue {
            queue.enqueue(QueueItem::Remove {
                tree_id: self.route(key)?.0,
                key: key.to_vec(),
            });
            return Ok(());
        }

        self.apply_remove(key)
    }

    fn apply_put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let (tree_id, seg_id) = self.route(key)?;
        self.observers.notify_pre_h_put(tree_id, key);

        self.digest_store
            .put_segment_data(tree_id, seg_id, key, digest::value_digest(value))?;
        self.digest_store.set_dirty_segment(tree_id, seg_id)?;

        self.observers.notify_post_h_put(tree_id, key);
        Ok(())
    }

    fn apply_remove(&self, key: &[u8]) -> Result<()> {
        let (tree_id, seg_id) = self.route(key)?;
        self.observers.notify_pre_h_remove(tree_id, key);

        self.digest_store.delete_segment_data(tree_id, seg_id, key)?;
        self.digest_store.set_dirty_segment(tree_id, seg_id)?;

        self.observers.notify_post_h_remove(tree_id, key);
        Ok(())
    }

    /// Reads a single node's stored hash.
    ///
    /// # Errors
    ///
    /// Propagates whatever the digest store reports.
    pub fn get_segment_hash(&self, tree_id: u64, node_id: NodeId) -> Result<Option<Hash>> {
        self.digest_store.get_segment_hash(tree_id, node_id)
    }

    /// Batched node-hash lookup; see [`DigestStore::get_segment_hashes`].
    ///
    /// # Errors
    ///
    /// Propagates whatever the digest store reports.
    pub fn get_segment_hashes(&self, tree_id: u64, node_ids: &[NodeId]) -> Result<Vec<(NodeId, Hash)>> {
        self.digest_store.get_segment_hashes(tree_id, node_ids)
    }

    /// Exact single-key digest lookup within a segment.
    ///
    /// # Errors
    ///
    /// Propagates whatever the digest store reports.
    pub fn get_segment_data(&self, tree_id: u64, seg_id: SegmentId, key: &[u8]) -> Result<Option<Hash>> {
        self.digest_store.get_segment_data(tree_id, seg_id, key)
    }

    /// All `(key, digest)` pairs currently stored for a segment, key-ordered.
    ///
    /// # Errors
    ///
    /// Propagates whatever the digest store reports.
    pub fn get_segment(&self, tree_id: u64, seg_id: SegmentId) -> Result<Vec<SegmentEntry>> {
        self.digest_store.get_segment(tree_id, seg_id)
    }

    /// Runs a rebuild pass for `tree_id` (§4.4). Returns the number of dirty segments
    /// processed, or `Ok(0)` immediately if another rebuild or sync already holds the
    /// tree's lock.
    ///
    /// # Errors
    ///
    /// Propagates any digest-store or user-store failure encountered mid-rebuild,
    /// after re-marking the segments that were about to be rebuilt so no work is
    /// silently lost.
    pub fn rebuild(&self, tree_id: u64, mode: FullRebuildMode) -> Result<usize> {
        let lock_provider = &self.config.lock_provider;
        let Some(_guard) = lock_provider.try_acquire(tree_id) else {
            return Ok(0);
        };

        self.observers.notify_pre_rebuild(tree_id);
        let result = self.rebuild_locked(tree_id, mode);
        let processed = result.as_ref().copied().unwrap_or(0);
        self.observers.notify_post_rebuild(tree_id, processed);
        result
    }

    fn rebuild_locked(&self, tree_id: u64, mode: FullRebuildMode) -> Result<usize> {
        let last_full = self.digest_store.last_full_rebuild(tree_id)?;
        let full_rebuild = match mode {
            FullRebuildMode::Always => true,
            FullRebuildMode::Never => false,
            FullRebuildMode::Periodic(period) => {
                last_full == 0 || time::unix_timestamp_millis().saturating_sub(last_full) > period.as_millis() as u64
            }
        };

        if full_rebuild {
            self.reconcile_user_store(tree_id)?;
        }

        let snapshot = self.digest_store.clear_and_get_dirty_segments(tree_id)?;
        // Re-mark immediately: if anything below fails, the segments are already
        // flagged dirty again and a future rebuild will retry them.
        self.digest_store.mark_segments(tree_id, &snapshot)?;

        match self.rebuild_segments(tree_id, &snapshot) {
            Ok(()) => {
                self.digest_store.unmark_segments(tree_id, &snapshot)?;
                if full_rebuild {
                    self.digest_store.set_last_full_rebuild(tree_id, time::unix_timestamp_millis())?;
                }
                Ok(snapshot.len())
            }
            Err(e) => Err(e),
        }
    }

    /// Step 1 of a full rebuild: reconcile the digest store against the current user
    /// store so drift between the two (missed notifications, crash recovery) is
    /// repaired. When the non-blocking queue is running, every reconciliation op is
    /// routed through it as a `PutIfAbsent`/`RemoveIfAbsent` and waited on, so a
    /// genuinely concurrent `h_put`/`h_remove` for the same key -- applied by the same
    /// single worker thread -- always wins over this scan's possibly-stale view,
    /// instead of racing it directly against the digest store.
    fn reconcile_user_store(&self, tree_id: u64) -> Result<()> {
        if let Some(queue) = &self.queue {
            for (key, value) in self.user_store.iter(tree_id)? {
                queue.enqueue_and_wait(QueueItem::PutIfAbsent { tree_id, key, value });
            }

            let height = self.config.height();
            let leaf_count = 1u32 << height;
            for seg_id in 0..leaf_count.min(self.config.no_of_segments) {
                for (key, _digest) in self.digest_store.get_segment(tree_id, seg_id)? {
                    queue.enqueue_and_wait(QueueItem::RemoveIfAbsent { tree_id, key });
                }
            }

            return Ok(());
        }

        for (key, value) in self.user_store.iter(tree_id)? {
            let (owner, seg_id) = self.route(&key)?;
            debug_assert_eq!(tree_id, owner, "tree_id_provider must be consistent with iter()'s tree_id");

            let existing = self.digest_store.get_segment_data(tree_id, seg_id, &key)?;
            let digest = digest::value_digest(&value);
            if existing.is_none() {
                // PutIfAbsent: a concurrent h_put for this key wins over the scan.
                self.digest_store.put_segment_data(tree_id, seg_id, &key, digest)?;
                self.digest_store.set_dirty_segment(tree_id, seg_id)?;
            }
        }

        let height = self.config.height();
        let leaf_count = 1u32 << height;
        for seg_id in 0..leaf_count.min(self.config.no_of_segments) {
            for (key, _digest) in self.digest_store.get_segment(tree_id, seg_id)? {
                // RemoveIfAbsent: only remove if the user store still lacks the key.
                if self.user_store.get(&key)?.is_none() {
                    self.digest_store.delete_segment_data(tree_id, seg_id, &key)?;
                    self.digest_store.set_dirty_segment(tree_id, seg_id)?;
                }
            }
        }

        Ok(())
    }

    /// Steps 2-3 of rebuild: rehash each dirty leaf, then propagate hashes upward
    /// level by level until the frontier empties.
    fn rebuild_segments(&self, tree_id: u64, dirty: &[SegmentId]) -> Result<()> {
        let height = self.config.height();
        let mut frontier: Vec<NodeId> = Vec::with_capacity(dirty.len());

        for &seg_id in dirty {
            if !self.digest_store.clear_dirty_segment(tree_id, seg_id)? {
                // Another concurrent rebuild already claimed this segment.
                continue;
            }

            if let Err(e) = self.rehash_leaf(tree_id, height, seg_id, &mut frontier) {
                // The dirty bit was just cleared above but the leaf hash was never
                // written, so the segment's pending work would otherwise be lost.
                // Re-mark it so a future rebuild retries it, then propagate the error.
                if let Err(remark_err) = self.digest_store.set_dirty_segment(tree_id, seg_id) {
                    log::error!(
                        "hash-tree: failed to re-mark segment {seg_id} dirty after rebuild failure: {remark_err}"
                    );
                }
                return Err(e);
            }
        }

        while !frontier.is_empty() {
            if frontier == [tree_math::ROOT] {
                break;
            }

            let mut parents: Vec<NodeId> = frontier.iter().map(|&n| tree_math::parent(n)).collect();
            parents.sort_unstable();
            parents.dedup();

            for &parent in &parents {
                let [l, r] = tree_math::immediate_children(parent);
                let children = self.digest_store.get_segment_hashes(tree_id, &[l, r])?;
                let hash = digest::internal_hash(children.iter().map(|(_, h)| h));
                self.digest_store.put_segment_hash(tree_id, parent, hash)?;
            }

            frontier = parents;
        }

        Ok(())
    }

    /// Computes and stores one leaf's hash, pushing its node id onto `frontier` for
    /// upward propagation. Split out of [`Self::rebuild_segments`] so the dirty-bit
    /// re-mark on failure has a single fallible unit to wrap.
    fn rehash_leaf(&self, tree_id: u64, height: u32, seg_id: SegmentId, frontier: &mut Vec<NodeId>) -> Result<()> {
        let entries = self.digest_store.get_segment(tree_id, seg_id)?;
        let hash = digest::leaf_hash(entries.iter().map(|(k, h)| (k.as_slice(), h)));
        let node = tree_math::leaf_id(height, seg_id);
        self.digest_store.put_segment_hash(tree_id, node, hash)?;
        frontier.push(node);
        Ok(())
    }

    /// Reconciles `tree_id` against `remote` (§4.5), acquiring the tree lock for the
    /// duration. Returns a zeroed [`SyncOutcome`] immediately if the lock is already
    /// held by a concurrent rebuild or sync.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Remote`] if the peer fails mid-walk; propagates digest-store
    /// and user-store failures otherwise.
    pub fn synch(&self, tree_id: u64, remote: &dyn Peer, sync_type: SyncType) -> Result<SyncOutcome> {
        let Some(_guard) = self.config.lock_provider.try_acquire(tree_id) else {
            return Ok(SyncOutcome::default());
        };

        self.observers.notify_pre_sync(tree_id);
        let outcome = walker::synch(
            tree_id,
            self.config.height(),
            &self.digest_store,
            &self.user_store,
            remote,
            sync_type,
        );
        let result = outcome.as_ref().copied().unwrap_or_default();
        self.observers
            .notify_post_sync(tree_id, result.key_differences, result.extrinsic_segments);
        outcome
    }

    /// Applies a batch of peer-driven writes to the *user store* (not the digest
    /// store directly -- the normal `h_put` notification path keeps the digest in
    /// sync, mirroring how a real remote write would arrive).
    ///
    /// # Errors
    ///
    /// Propagates any user-store or digest-store failure.
    pub fn s_put(&self, tree_id: u64, entries: &[(Vec<u8>, Vec<u8>)]) -> Result<()> {
        self.observers.notify_pre_s_put(tree_id, entries.len());
        for (key, value) in entries {
            self.user_store.put(key, value)?;
            self.apply_put(key, value)?;
        }
        self.observers.notify_post_s_put(tree_id, entries.len());
        Ok(())
    }

    /// Peer-driven removal of a batch of keys from the user store and digest store.
    ///
    /// # Errors
    ///
    /// Propagates any user-store or digest-store failure.
    pub fn s_remove(&self, tree_id: u64, keys: &[Vec<u8>]) -> Result<()> {
        self.observers.notify_pre_s_remove(tree_id, keys.len());
        for key in keys {
            self.user_store.delete(key)?;
            self.apply_remove(key)?;
        }
        self.observers.notify_post_s_remove(tree_id, keys.len());
        Ok(())
    }

    /// Peer-driven deletion of every user-store key whose segment falls under
    /// `node_id` (used when the remote side of a sync has an entire subtree this
    /// side lacks).
    ///
    /// # Errors
    ///
    /// Propagates any user-store or digest-store failure.
    pub fn delete_tree_node(&self, tree_id: u64, node_id: NodeId) -> Result<()> {
        let height = self.config.height();
        let from = tree_math::seg_id_of_leaf(height, tree_math::left_most_leaf(height, node_id));
        let to = tree_math::seg_id_of_leaf(height, tree_math::right_most_leaf(height, node_id));

        for item in self.digest_store.segment_data_iter(tree_id, from, to)? {
            let (_, key, _) = item?;
            self.user_store.delete(&key)?;
            self.apply_remove(&key)?;
        }
        Ok(())
    }

    /// Stops the engine: if non-blocking calls are enabled, enqueues the shutdown
    /// sentinel and joins the worker thread, draining everything queued before it.
    /// Idempotent.
    pub fn stop(&self) {
        if self.state() == EngineState::Stopped {
            return;
        }
        self.state.store(EngineState::Stopped as u8, Ordering::Release);

        if let Some(queue) = &self.queue {
            queue.stop();
        }
        if let Some(handle) = self.worker.write().expect("lock is poisoned").take() {
            let _ = handle.join();
        }
    }
}

impl<D, U> Drop for HashTree<D, U> {
    fn drop(&mut self) {
        if let Some(queue) = &self.queue {
            queue.stop();
        }
        if let Some(handle) = self.worker.write().expect("lock is poisoned").take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::FixedTreeId;
    use crate::store::{FailingDigestStore, MemoryDigestStore};
    use crate::user_store::MemoryUserStore;
    use std::collections::HashSet;
    use test_log::test;

    fn engine() -> Arc<HashTree<MemoryDigestStore, MemoryUserStore>> {
        let config = HashTreeConfig::new()
            .enable_non_blocking_calls(false)
            .no_of_segments(4)
            .tree_id_provider(Arc::new(FixedTreeId(1)))
            .build()
            .unwrap();

        HashTree::new(config, MemoryDigestStore::new(), MemoryUserStore::single_tree(1))
    }

    #[test]
    fn h_put_marks_segment_dirty_and_stores_digest() {
        let tree = engine();
        tree.h_put(b"a", b"1").unwrap();

        let digest = tree.get_segment_data(1, tree.route(b"a").unwrap().1, b"a").unwrap();
        assert_eq!(Some(digest::value_digest(b"1")), digest);
        assert!(!tree.digest_store().dirty_segments(1).unwrap().is_empty());
    }

    #[test]
    fn rebuild_clears_dirty_segments_and_produces_root_hash() {
        let tree = engine();
        tree.h_put(b"a", b"1").unwrap();
        tree.h_put(b"b", b"2").unwrap();

        let processed = tree.rebuild(1, FullRebuildMode::Always).unwrap();
        assert!(processed >= 1);
        assert!(tree.digest_store().dirty_segments(1).unwrap().is_empty());
        assert!(tree.get_segment_hash(1, tree_math::ROOT).unwrap().is_some());
    }

    #[test]
    fn rebuild_failure_leaves_the_failed_segment_marked_dirty() {
        // Property P6: on an injected failure partway through a rebuild, the
        // post-failure dirty set must be a superset of the pre-rebuild one -- no
        // segment's pending work is silently lost.
        let config = HashTreeConfig::new()
            .enable_non_blocking_calls(false)
            .no_of_segments(4)
            .tree_id_provider(Arc::new(FixedTreeId(1)))
            .full_rebuild_mode(FullRebuildMode::Never)
            .build()
            .unwrap();

        // Fails the very first `get_segment` call made during `rebuild_segments`'s
        // per-segment loop, i.e. while the first dirty segment is being rehashed.
        let store = FailingDigestStore::new(MemoryDigestStore::new(), 1);
        let tree = HashTree::new(config, store, MemoryUserStore::single_tree(1));

        tree.h_put(b"a", b"1").unwrap();
        tree.h_put(b"b", b"2").unwrap();
        tree.h_put(b"c", b"3").unwrap();

        let pre_rebuild_dirty: HashSet<_> = tree.digest_store().dirty_segments(1).unwrap().into_iter().collect();
        assert!(!pre_rebuild_dirty.is_empty());

        let result = tree.rebuild(1, FullRebuildMode::Never);
        assert!(result.is_err());

        let post_failure_dirty: HashSet<_> = tree.digest_store().dirty_segments(1).unwrap().into_iter().collect();
        assert!(
            post_failure_dirty.is_superset(&pre_rebuild_dirty),
            "post-failure dirty set {post_failure_dirty:?} must be a superset of the pre-rebuild set {pre_rebuild_dirty:?}"
        );
    }

    #[test]
    fn h_remove_clears_the_digest() {
        let tree = engine();
        tree.h_put(b"a", b"1").unwrap();
        tree.h_remove(b"a").unwrap();

        let seg_id = tree.route(b"a").unwrap().1;
        assert_eq!(None, tree.get_segment_data(1, seg_id, b"a").unwrap());
    }

    #[test]
    fn rebuild_is_a_no_op_while_already_locked() {
        let tree = engine();
        tree.h_put(b"a", b"1").unwrap();

        let _guard = tree.config.lock_provider.try_acquire(1).unwrap();
        assert_eq!(0, tree.rebuild(1, FullRebuildMode::Always).unwrap());
    }

    #[test]
    fn reads_are_allowed_after_stop_but_writes_are_rejected() {
        let tree = engine();
        tree.h_put(b"a", b"1").unwrap();
        tree.stop();

        assert!(tree.h_put(b"b", b"2").is_err());
        assert!(tree.get_segment(1, 0).is_ok());
    }

    #[test]
    fn s_put_and_s_remove_update_both_stores() {
        let tree = engine();
        tree.s_put(1, &[(b"x".to_vec(), b"y".to_vec())]).unwrap();
        assert_eq!(Some(b"y".to_vec()), tree.user_store().get(b"x").unwrap());

        tree.s_remove(1, &[b"x".to_vec()]).unwrap();
        assert_eq!(None, tree.user_store().get(b"x").unwrap());
    }

    #[test]
    fn default_non_blocking_configuration_does_not_crash_on_construction() {
        // Exercises the engine without disabling the non-blocking queue, unlike every
        // other test in this module -- regression coverage for the queue's default
        // "unbounded" capacity previously being handed straight to a bounded,
        // array-backed channel.
        let config = HashTreeConfig::new().tree_id_provider(Arc::new(FixedTreeId(1))).build().unwrap();
        let tree = HashTree::new(config, MemoryDigestStore::new(), MemoryUserStore::single_tree(1));

        tree.h_put(b"a", b"1").unwrap();
        // `stop()` joins the worker thread, so the queued write is guaranteed applied.
        tree.stop();

        let seg_id = tree.route(b"a").unwrap().1;
        assert_eq!(Some(digest::value_digest(b"1")), tree.get_segment_data(1, seg_id, b"a").unwrap());
    }

    #[test]
    fn concurrent_h_put_wins_over_a_stale_reconcile_scan() {
        // Property: spec.md:102 -- a full rebuild's user-store reconciliation scan must
        // never clobber a genuinely concurrent write for the same key. Non-blocking
        // mode is left enabled (the default) so both `h_put` and the rebuild's
        // `PutIfAbsent` are serialized through the single queue-draining worker.
        let config = HashTreeConfig::new()
            .no_of_segments(4)
            .tree_id_provider(Arc::new(FixedTreeId(1)))
            .build()
            .unwrap();
        let tree = HashTree::new(config, MemoryDigestStore::new(), MemoryUserStore::single_tree(1));

        // Seed the user store directly, bypassing h_put, so the digest store starts out
        // with no entry for "k" -- exactly the state the reconciliation scan's
        // PutIfAbsent is meant to repair.
        tree.user_store().put(b"k", b"stale").unwrap();

        let writer_tree = Arc::clone(&tree);
        let writer = std::thread::spawn(move || {
            for _ in 0..50 {
                writer_tree.h_put(b"k", b"fresh").unwrap();
            }
        });

        for _ in 0..50 {
            tree.rebuild(1, FullRebuildMode::Always).unwrap();
        }

        writer.join().unwrap();
        tree.stop();

        let seg_id = tree.route(b"k").unwrap().1;
        assert_eq!(
            Some(digest::value_digest(b"fresh")),
            tree.get_segment_data(1, seg_id, b"k").unwrap(),
            "a concurrent h_put must win over the rebuild's reconciliation scan"
        );
    }

    #[test]
    fn reconcile_user_store_picks_up_writes_missed_by_h_put() {
        let tree = engine();
        // Simulate a write that reached the user store but never notified the engine.
        tree.user_store().put(b"orphan", b"v").unwrap();

        tree.rebuild(1, FullRebuildMode::Always).unwrap();

        let seg_id = tree.route(b"orphan").unwrap().1;
        assert_eq!(
            Some(digest::value_digest(b"v")),
            tree.get_segment_data(1, seg_id, b"orphan").unwrap()
        );
    }
}

// Copyright (c) 2024-present
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Observer fan-out (§4.7, §9): a fixed, typed event surface with default no-op
//! methods, backed by an unbounded, concurrent, insertion-ordered registry.

use crate::keys::TreeId;
use std::sync::{Arc, RwLock};

/// Fixed event surface an observer can hook into. Every method defaults to a no-op,
/// so an observer only implements what it cares about.
pub trait HashTreeObserver: Send + Sync {
    /// Called before a key/value write is applied.
    fn pre_h_put(&self, _tree_id: TreeId, _key: &[u8]) {}
    /// Called after a key/value write has been applied.
    fn post_h_put(&self, _tree_id: TreeId, _key: &[u8]) {}

    /// Called before a key removal is applied.
    fn pre_h_remove(&self, _tree_id: TreeId, _key: &[u8]) {}
    /// Called after a key removal has been applied.
    fn post_h_remove(&self, _tree_id: TreeId, _key: &[u8]) {}

    /// Called before a rebuild starts (after the tree lock is acquired).
    fn pre_rebuild(&self, _tree_id: TreeId) {}
    /// Called after a rebuild completes, with the count of segments rebuilt.
    fn post_rebuild(&self, _tree_id: TreeId, _segments_rebuilt: usize) {}

    /// Called before applying a batch of peer-driven puts.
    fn pre_s_put(&self, _tree_id: TreeId, _count: usize) {}
    /// Called after applying a batch of peer-driven puts.
    fn post_s_put(&self, _tree_id: TreeId, _count: usize) {}

    /// Called before applying a batch of peer-driven removes.
    fn pre_s_remove(&self, _tree_id: TreeId, _count: usize) {}
    /// Called after applying a batch of peer-driven removes.
    fn post_s_remove(&self, _tree_id: TreeId, _count: usize) {}

    /// Called before a sync starts (after the tree lock is acquired).
    fn pre_sync(&self, _tree_id: TreeId) {}
    /// Called after a sync completes, with the key-difference and extrinsic-segment
    /// counts.
    fn post_sync(&self, _tree_id: TreeId, _key_differences: usize, _extrinsic_segments: usize) {}
}

/// An unbounded, concurrent, insertion-ordered collection of observers. Notifications
/// iterate a stable snapshot taken under the read lock, so a registration made
/// mid-iteration never races a notification already in flight.
#[derive(Default)]
pub struct ObserverRegistry {
    observers: RwLock<Vec<Arc<dyn HashTreeObserver>>>,
}

impl ObserverRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an observer. Observers are never unregistered; this mirrors the
    /// simple, process-lifetime registries used elsewhere in the crate (locks,
    /// providers).
    pub fn register(&self, observer: Arc<dyn HashTreeObserver>) {
        self.observers.write().expect("lock is poisoned").push(observer);
    }

    fn snapshot(&self) -> Vec<Arc<dyn HashTreeObserver>> {
        self.observers.read().expect("lock is poisoned").clone()
    }

    pub(crate) fn notify_pre_h_put(&self, tree_id: TreeId, key: &[u8]) {
        for o in self.snapshot() {
            o.pre_h_put(tree_id, key);
        }
    }

    pub(crate) fn notify_post_h_put(&self, tree_id: TreeId, key: &[u8]) {
        for o in self.snapshot() {
            o.post_h_put(tree_id, key);
        }
    }

    pub(crate) fn notify_pre_h_remove(&self, tree_id: TreeId, key: &[u8]) {
        for o in self.snapshot() {
            o.pre_h_remove(tree_id, key);
        }
    }

    pub(crate) fn notify_post_h_remove(&self, tree_id: TreeId, key: &[u8]) {
        for o in self.snapshot() {
            o.post_h_remove(tree_id, key);
        }
    }

    pub(crate) fn notify_pre_rebuild(&self, tree_id: TreeId) {
        for o in self.snapshot() {
            o.pre_rebuild(tree_id);
        }
    }

    pub(crate) fn notify_post_rebuild(&self, tree_id: TreeId, segments_rebuilt: usize) {
        for o in self.snapshot() {
            o.post_rebuild(tree_id, segments_rebuilt);
        }
    }

    pub(crate) fn notify_pre_s_put(&self, tree_id: TreeId, count: usize) {
        for o in self.snapshot() {
            o.pre_s_put(tree_id, count);
        }
    }

    pub(crate) fn notify_post_s_put(&self, tree_id: TreeId, count: usize) {
        for o in self.snapshot() {
            o.post_s_put(tree_id, count);
        }
    }

    pub(crate) fn notify_pre_s_remove(&self, tree_id: TreeId, count: usize) {
        for o in self.snapshot() {
            o.pre_s_remove(tree_id, count);
        }
    }

    pub(crate) fn notify_post_s_remove(&self, tree_id: TreeId, count: usize) {
        for o in self.snapshot() {
            o.post_s_remove(tree_id, count);
        }
    }

    pub(crate) fn notify_pre_sync(&self, tree_id: TreeId) {
        for o in self.snapshot() {
            o.pre_sync(tree_id);
        }
    }

    pub(crate) fn notify_post_sync(&self, tree_id: TreeId, key_differences: usize, extrinsic_segments: usize) {
        for o in self.snapshot() {
            o.post_sync(tree_id, key_differences, extrinsic_segments);
        }
    }
}

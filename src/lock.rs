// Copyright (c) 2024-present
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Per-treeId locking (§4.6). Rebuild and sync hold this lock for the duration of the
//! operation; `h_put`/`h_remove` never take it.

use crate::keys::TreeId;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::{Arc, RwLock};
use std::thread::ThreadId;

/// A non-blocking, per-treeId reentrant mutex.
pub trait LockProvider: Send + Sync {
    /// Non-blocking acquire. Returns `None` if another operation already holds the
    /// lock for `tree_id` -- callers (rebuild, sync) must treat that as "busy" and
    /// return a zero-difference result rather than waiting.
    fn try_acquire(&self, tree_id: TreeId) -> Option<TreeLockGuard>;
}

struct TreeLockState {
    // `(owner, depth)`, guarded by a short-lived critical section only -- never held
    // across user code, unlike the logical per-tree lock itself.
    slot: Mutex<Option<(ThreadId, u32)>>,
}

impl TreeLockState {
    fn new() -> Arc<Self> {
        Arc::new(Self { slot: Mutex::new(None) })
    }

    fn try_acquire(self: &Arc<Self>) -> Option<TreeLockGuard> {
        let current = std::thread::current().id();
        let mut slot = self.slot.lock();

        match &mut *slot {
            Some((owner, depth)) if *owner == current => {
                *depth += 1;
            }
            Some(_) => return None,
            None => *slot = Some((current, 1)),
        }

        drop(slot);

        Some(TreeLockGuard {
            state: Arc::clone(self),
        })
    }

    fn release(&self) {
        let mut slot = self.slot.lock();
        if let Some((_, depth)) = slot.as_mut() {
            *depth -= 1;
            if *depth == 0 {
                *slot = None;
            }
        }
    }
}

/// An acquired per-tree lock. Dropping it releases the lock (or decrements the
/// reentrancy depth, for a nested acquire on the same thread).
pub struct TreeLockGuard {
    state: Arc<TreeLockState>,
}

impl Drop for TreeLockGuard {
    fn drop(&mut self) {
        self.state.release();
    }
}

/// Default [`LockProvider`]: one reentrant lock per `tree_id`, stored in a map guarded
/// by a coarse `RwLock`. Locks are created lazily and never removed, mirroring the
/// teacher crate's own long-lived per-tree state.
#[derive(Default)]
pub struct ReentrantLockProvider {
    locks: RwLock<FxHashMap<TreeId, Arc<TreeLockState>>>,
}

impl ReentrantLockProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state_for(&self, tree_id: TreeId) -> Arc<TreeLockState> {
        if let Some(state) = self.locks.read().expect("lock is poisoned").get(&tree_id) {
            return Arc::clone(state);
        }

        Arc::clone(
            self.locks
                .write()
                .expect("lock is poisoned")
                .entry(tree_id)
                .or_insert_with(TreeLockState::new),
        )
    }
}

impl LockProvider for ReentrantLockProvider {
    fn try_acquire(&self, tree_id: TreeId) -> Option<TreeLockGuard> {
        self.state_for(tree_id).try_acquire()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_for_same_tree_fails_while_first_is_held() {
        let provider = ReentrantLockProvider::new();
        let first = provider.try_acquire(1);
        assert!(first.is_some());

        let second = provider.try_acquire(1);
        assert!(second.is_none());
    }

    #[test]
    fn lock_is_reentrant_on_the_same_thread() {
        let provider = ReentrantLockProvider::new();
        let outer = provider.try_acquire(1).expect("first acquire succeeds");
        let inner = provider.try_acquire(1);
        assert!(inner.is_some(), "same-thread reacquire must succeed");
        drop(inner);
        drop(outer);
    }

    #[test]
    fn different_trees_do_not_contend() {
        let provider = ReentrantLockProvider::new();
        let a = provider.try_acquire(1);
        let b = provider.try_acquire(2);
        assert!(a.is_some());
        assert!(b.is_some());
    }

    #[test]
    fn releasing_allows_reacquiring() {
        let provider = ReentrantLockProvider::new();
        {
            let _guard = provider.try_acquire(1).unwrap();
        }
        assert!(provider.try_acquire(1).is_some());
    }

    #[test]
    fn other_thread_can_acquire_after_owner_releases() {
        let provider = Arc::new(ReentrantLockProvider::new());
        let guard = provider.try_acquire(1).unwrap();

        let provider2 = Arc::clone(&provider);
        let handle = std::thread::spawn(move || provider2.try_acquire(1).is_none());
        assert!(handle.join().unwrap(), "other thread must not acquire while held");

        drop(guard);

        let provider3 = Arc::clone(&provider);
        let handle = std::thread::spawn(move || provider3.try_acquire(1).is_some());
        assert!(handle.join().unwrap());
    }
}

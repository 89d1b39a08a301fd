// Copyright (c) 2024-present
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The user key/value store contract (§6): the actual dataset the hash-tree engine
//! shadows. Only `get`/`contains`/`iter`/`put`/`delete` are consumed.

use crate::keys::TreeId;
use crate::Result;
use std::collections::BTreeMap;
use std::sync::RwLock;

/// The dataset the hash-tree engine maintains a digest of.
///
/// Implementors decide how keys map to `tree_id`s on their own (commonly: one user
/// store instance per logical tree, or a prefix convention); the hash-tree engine
/// itself only ever calls `iter(tree_id)` to enumerate a tree's full key set.
pub trait UserStore: Send + Sync {
    /// Looks up the current value for `key`, if any.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Whether `key` currently has a value.
    fn contains(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Enumerates the full key set belonging to `tree_id`, in no particular order.
    fn iter(&self, tree_id: TreeId) -> Result<Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + '_>>;

    /// Writes `value` under `key`.
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Removes `key`, if present.
    fn delete(&self, key: &[u8]) -> Result<()>;
}

/// An in-process [`UserStore`] over a `BTreeMap`, keyed by `(tree_id, key)`.
///
/// This is a reference implementation for tests and small embeddings; production use
/// is expected to plug in a real key/value store.
#[derive(Default)]
pub struct MemoryUserStore {
    inner: RwLock<BTreeMap<(TreeId, Vec<u8>), Vec<u8>>>,
    tree_id_of: Box<dyn Fn(&[u8]) -> TreeId + Send + Sync>,
}

impl MemoryUserStore {
    /// Creates a store where every key belongs to the given fixed `tree_id`.
    #[must_use]
    pub fn single_tree(tree_id: TreeId) -> Self {
        Self {
            inner: RwLock::default(),
            tree_id_of: Box::new(move |_| tree_id),
        }
    }

    /// Creates a store that derives a key's `tree_id` with the given function, mirroring
    /// how a real embedding might route keys to logical trees.
    pub fn with_tree_id_provider<F>(tree_id_of: F) -> Self
    where
        F: Fn(&[u8]) -> TreeId + Send + Sync + 'static,
    {
        Self {
            inner: RwLock::default(),
            tree_id_of: Box::new(tree_id_of),
        }
    }
}

impl UserStore for MemoryUserStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let tree_id = (self.tree_id_of)(key);
        Ok(self
            .inner
            .read()
            .expect("lock is poisoned")
            .get(&(tree_id, key.to_vec()))
            .cloned())
    }

    fn iter(&self, tree_id: TreeId) -> Result<Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + '_>> {
        let snapshot: Vec<_> = self
            .inner
            .read()
            .expect("lock is poisoned")
            .range((tree_id, Vec::new())..(tree_id + 1, Vec::new()))
            .map(|((_, k), v)| (k.clone(), v.clone()))
            .collect();

        Ok(Box::new(snapshot.into_iter()))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let tree_id = (self.tree_id_of)(key);
        self.inner
            .write()
            .expect("lock is poisoned")
            .insert((tree_id, key.to_vec()), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        let tree_id = (self.tree_id_of)(key);
        self.inner
            .write()
            .expect("lock is poisoned")
            .remove(&(tree_id, key.to_vec()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete_round_trip() {
        let store = MemoryUserStore::single_tree(1);
        store.put(b"a", b"1").unwrap();
        assert_eq!(Some(b"1".to_vec()), store.get(b"a").unwrap());
        assert!(store.contains(b"a").unwrap());

        store.delete(b"a").unwrap();
        assert_eq!(None, store.get(b"a").unwrap());
        assert!(!store.contains(b"a").unwrap());
    }

    #[test]
    fn iter_only_returns_keys_for_the_requested_tree() {
        let store = MemoryUserStore::with_tree_id_provider(|k| if k.starts_with(b"a") { 1 } else { 2 });
        store.put(b"apple", b"1").unwrap();
        store.put(b"avocado", b"2").unwrap();
        store.put(b"banana", b"3").unwrap();

        let mut tree1: Vec<_> = store.iter(1).unwrap().map(|(k, _)| k).collect();
        tree1.sort();
        assert_eq!(vec![b"apple".to_vec(), b"avocado".to_vec()], tree1);

        let tree2: Vec<_> = store.iter(2).unwrap().map(|(k, _)| k).collect();
        assert_eq!(vec![b"banana".to_vec()], tree2);
    }
}

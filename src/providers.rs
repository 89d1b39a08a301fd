// Copyright (c) 2024-present
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Tree-id and segment-id providers (§3, §4.4). Both are capability interfaces
//! injected at [`crate::config::HashTreeConfig`] construction, the same way the
//! teacher crate injects a `PrefixExtractor` or `FileSystem` implementation.

use crate::keys::TreeId;
use crate::tree_math::SegmentId;

fn hash64(bytes: &[u8]) -> u64 {
    xxhash_rust::xxh3::xxh3_64(bytes)
}

/// Maps a key to the logical tree it belongs to.
///
/// There is no default: a caller embedding the engine across multiple logical trees
/// must say how keys are routed, and an engine over a single tree can just return a
/// constant, so requiring this at construction is the fail-fast choice (§7, programmer
/// misuse is caught at construction rather than producing silently-wrong digests).
pub trait TreeIdProvider: Send + Sync {
    /// Returns the `tree_id` a key belongs to.
    fn tree_id_of(&self, key: &[u8]) -> TreeId;
}

impl<F> TreeIdProvider for F
where
    F: Fn(&[u8]) -> TreeId + Send + Sync,
{
    fn tree_id_of(&self, key: &[u8]) -> TreeId {
        self(key)
    }
}

/// A [`TreeIdProvider`] that routes every key to the same fixed tree.
pub struct FixedTreeId(pub TreeId);

impl TreeIdProvider for FixedTreeId {
    fn tree_id_of(&self, _key: &[u8]) -> TreeId {
        self.0
    }
}

/// Maps a key to its segment id within a tree, deterministically.
pub trait SegIdProvider: Send + Sync {
    /// Returns the `seg_id` a key belongs to, in `[0, no_of_segments)`.
    fn seg_id_of(&self, key: &[u8]) -> SegmentId;
}

/// Default [`SegIdProvider`]: modulo of a stable hash (`xxh3_64`, the same primitive
/// the teacher crate uses for its own internal hashing -- see its `hash.rs`).
pub struct ModuloSegIdProvider {
    no_of_segments: u32,
}

impl ModuloSegIdProvider {
    /// `no_of_segments` must already be a power of two; [`crate::config::HashTreeConfig`]
    /// enforces this before constructing the provider.
    #[must_use]
    pub fn new(no_of_segments: u32) -> Self {
        Self { no_of_segments }
    }
}

impl SegIdProvider for ModuloSegIdProvider {
    fn seg_id_of(&self, key: &[u8]) -> SegmentId {
        #[allow(clippy::cast_possible_truncation)]
        {
            (hash64(key) % u64::from(self.no_of_segments)) as SegmentId
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modulo_provider_is_deterministic_and_in_range() {
        let provider = ModuloSegIdProvider::new(16);
        let a = provider.seg_id_of(b"hello");
        let b = provider.seg_id_of(b"hello");
        assert_eq!(a, b);
        assert!(a < 16);
    }

    #[test]
    fn fixed_tree_id_always_returns_the_same_id() {
        let provider = FixedTreeId(42);
        assert_eq!(42, provider.tree_id_of(b"a"));
        assert_eq!(42, provider.tree_id_of(b"b"));
    }

    #[test]
    fn closures_implement_tree_id_provider() {
        let provider = |key: &[u8]| -> TreeId { u64::from(key.first().copied().unwrap_or(0)) };
        assert_eq!(u64::from(b'x'), provider.tree_id_of(b"x"));
    }
}

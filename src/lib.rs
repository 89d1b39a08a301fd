// Copyright (c) 2024-present
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

#![forbid(unsafe_code)]

//! A persistent Merkle hash-tree engine for detecting and reconciling differences
//! between two replicas of a key/value dataset.
//!
//! The user's data lives in an external [`UserStore`]; this crate maintains, alongside
//! it, a compact digest structure (the [`DigestStore`]) that partitions the key space
//! into fixed-size segments, records a per-key digest in each segment, and summarizes
//! segments with a balanced binary tree of hashes. Two [`HashTree`]s can compare their
//! trees top-down over a [`Peer`] connection, locate the smallest set of differing
//! segments, and exchange only the keys that actually diverge.
//!
//! ```
//! use hash_tree::{HashTreeConfig, HashTree, MemoryDigestStore, MemoryUserStore, FixedTreeId};
//! use std::sync::Arc;
//!
//! let config = HashTreeConfig::new()
//!     .tree_id_provider(Arc::new(FixedTreeId(1)))
//!     .build()
//!     .unwrap();
//!
//! let tree = HashTree::new(config, MemoryDigestStore::new(), MemoryUserStore::single_tree(1));
//! tree.h_put(b"hello", b"world").unwrap();
//! tree.rebuild(1, hash_tree::FullRebuildMode::Always).unwrap();
//! ```

mod config;
mod digest;
mod engine;
mod error;
mod keys;
mod lock;
mod manager;
mod observer;
mod providers;
mod queue;
mod rpc;
mod store;
mod time;
mod tree_math;
mod user_store;
mod walker;

pub use config::{FullRebuildMode, HashTreeConfig, UNBOUNDED_QUEUE_SIZE};
pub use digest::{empty_hash, internal_hash, leaf_hash, value_digest, Hash};
pub use engine::{HashTree, SyncOutcome, SyncType};
pub use error::{Error, Result};
pub use keys::TreeId;
pub use lock::{LockProvider, ReentrantLockProvider, TreeLockGuard};
pub use manager::{HashTreeManager, StopSignal};
pub use observer::{HashTreeObserver, ObserverRegistry};
pub use providers::{FixedTreeId, ModuloSegIdProvider, SegIdProvider, TreeIdProvider};
pub use queue::{NonBlockingQueue, QueueItem};
pub use rpc::{LocalPeer, Peer, TcpPeerClient, TcpPeerServer};
pub use store::{DigestStore, MemoryDigestStore, SegmentEntry};
pub use tree_math::{NodeId, SegmentId, MAX_SEGMENTS};
pub use user_store::{MemoryUserStore, UserStore};

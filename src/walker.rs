// Copyright (c) 2024-present
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The `synch` reconciliation algorithm (§4.5): a top-down tree diff that narrows to
//! the segments that actually differ, then a per-segment key-level diff that produces
//! the minimal `s_put`/`s_remove`/`delete_tree_node` calls against a remote peer.

use crate::engine::{SyncOutcome, SyncType};
use crate::keys::TreeId;
use crate::rpc::Peer;
use crate::store::DigestStore;
use crate::tree_math::{self, NodeId, SegmentId};
use crate::user_store::UserStore;
use crate::Result;

/// Peer-bound batch size for `s_put` during a local-only-subtree push (§4.5).
const BATCH_SIZE: usize = 5000;

/// Runs the full top-down walk for `tree_id` between `local` (this side) and `remote`,
/// returning the aggregate [`SyncOutcome`]. `sync_type` controls whether differences
/// are actually pushed to `remote` or only counted.
pub fn synch<D, U>(
    tree_id: TreeId,
    height: u32,
    local_store: &D,
    local_user: &U,
    remote: &dyn Peer,
    sync_type: SyncType,
) -> Result<SyncOutcome>
where
    D: DigestStore,
    U: UserStore,
{
    let do_update = sync_type == SyncType::Update;
    let mut outcome = SyncOutcome::default();
    let mut worklist = vec![tree_math::ROOT];

    while !worklist.is_empty() {
        let local_hashes = local_store.get_segment_hashes(tree_id, &worklist)?;
        let remote_hashes = remote.get_segment_hashes(tree_id, &worklist)?;

        let mut next_worklist = Vec::new();
        merge_by_node_id(&local_hashes, &remote_hashes, |node_id, local, remote_hash| {
            match (local, remote_hash) {
                (Some(l), Some(r)) => {
                    if l == r {
                        return Ok(());
                    }
                    if tree_math::is_leaf(height, node_id) {
                        let seg_id = tree_math::seg_id_of_leaf(height, node_id);
                        outcome.key_differences +=
                            sync_segment(tree_id, seg_id, local_store, local_user, remote, do_update)?;
                    } else {
                        next_worklist.extend(tree_math::immediate_children(node_id));
                    }
                }
                (Some(_), None) => {
                    push_local_only_subtree(tree_id, height, node_id, local_store, local_user, remote, do_update, &mut outcome)?;
                }
                (None, Some(_)) => {
                    if do_update {
                        remote.delete_tree_node(tree_id, node_id)?;
                    }
                    outcome.extrinsic_segments += 1;
                }
                (None, None) => {}
            }
            Ok(())
        })?;

        worklist = next_worklist;
    }

    Ok(outcome)
}

/// Three-way merge of two `(node_id, hash)` streams, already ordered by `node_id`
/// ascending (the contract [`DigestStore::get_segment_hashes`] and
/// [`Peer::get_segment_hashes`] both guarantee).
fn merge_by_node_id<F>(local: &[(NodeId, crate::digest::Hash)], remote: &[(NodeId, crate::digest::Hash)], mut on_pair: F) -> Result<()>
where
    F: FnMut(NodeId, Option<&crate::digest::Hash>, Option<&crate::digest::Hash>) -> Result<()>,
{
    let mut i = 0;
    let mut j = 0;

    while i < local.len() || j < remote.len() {
        match (local.get(i), remote.get(j)) {
            (Some((ln, lh)), Some((rn, rh))) if ln == rn => {
                on_pair(*ln, Some(lh), Some(rh))?;
                i += 1;
                j += 1;
            }
            (Some((ln, lh)), Some((rn, _))) if ln < rn => {
                on_pair(*ln, Some(lh), None)?;
                i += 1;
            }
            (Some(_), Some((rn, rh))) => {
                on_pair(*rn, None, Some(rh))?;
                j += 1;
            }
            (Some((ln, lh)), None) => {
                on_pair(*ln, Some(lh), None)?;
                i += 1;
            }
            (None, Some((rn, rh))) => {
                on_pair(*rn, None, Some(rh))?;
                j += 1;
            }
            (None, None) => unreachable!("loop condition guards against this"),
        }
    }

    Ok(())
}

/// Enumerates every user-store key under `node_id`'s segment range and pushes it to
/// `remote` in batches of [`BATCH_SIZE`] (the "local-only" branch of §4.5).
#[allow(clippy::too_many_arguments)]
fn push_local_only_subtree<D, U>(
    tree_id: TreeId,
    height: u32,
    node_id: NodeId,
    local_store: &D,
    local_user: &U,
    remote: &dyn Peer,
    do_update: bool,
    outcome: &mut SyncOutcome,
) -> Result<()>
where
    D: DigestStore,
    U: UserStore,
{
    let from = tree_math::seg_id_of_leaf(height, tree_math::left_most_leaf(height, node_id));
    let to = tree_math::seg_id_of_leaf(height, tree_math::right_most_leaf(height, node_id));

    let mut batch = Vec::with_capacity(BATCH_SIZE);
    for item in local_store.segment_data_iter(tree_id, from, to)? {
        let (_, key, _) = item?;

        // A value present at hash-computation time may have since been deleted from
        // the user store by a concurrent h_remove; treat that as nothing to push.
        let Some(value) = local_user.get(&key)? else {
            continue;
        };

        batch.push((key, value));
        outcome.key_differences += 1;

        if batch.len() == BATCH_SIZE {
            if do_update {
                remote.s_put(tree_id, &batch)?;
            }
            batch.clear();
        }
    }

    if !batch.is_empty() && do_update {
        remote.s_put(tree_id, &batch)?;
    }

    Ok(())
}

/// Per-leaf key-level diff (§4.5). Returns the number of keys found to differ.
fn sync_segment<D, U>(
    tree_id: TreeId,
    seg_id: SegmentId,
    local_store: &D,
    local_user: &U,
    remote: &dyn Peer,
    do_update: bool,
) -> Result<usize>
where
    D: DigestStore,
    U: UserStore,
{
    let local = local_store.get_segment(tree_id, seg_id)?;
    let remote_entries = remote.get_segment(tree_id, seg_id)?;

    let mut kvs_for_addition = Vec::new();
    let mut keys_for_removal = Vec::new();

    let mut i = 0;
    let mut j = 0;
    while i < local.len() || j < remote_entries.len() {
        match (local.get(i), remote_entries.get(j)) {
            (Some((lk, ld)), Some((rk, rd))) if lk == rk => {
                if ld != rd {
                    if let Some(value) = local_user.get(lk)? {
                        kvs_for_addition.push((lk.clone(), value));
                    }
                }
                i += 1;
                j += 1;
            }
            (Some((lk, _)), Some((rk, _))) if lk < rk => {
                if let Some(value) = local_user.get(lk)? {
                    kvs_for_addition.push((lk.clone(), value));
                }
                i += 1;
            }
            (Some(_), Some((rk, _))) => {
                keys_for_removal.push(rk.clone());
                j += 1;
            }
            (Some((lk, _)), None) => {
                if let Some(value) = local_user.get(lk)? {
                    kvs_for_addition.push((lk.clone(), value));
                }
                i += 1;
            }
            (None, Some((rk, _))) => {
                keys_for_removal.push(rk.clone());
                j += 1;
            }
            (None, None) => unreachable!("loop condition guards against this"),
        }
    }

    let differences = kvs_for_addition.len() + keys_for_removal.len();

    if do_update {
        if !kvs_for_addition.is_empty() {
            remote.s_put(tree_id, &kvs_for_addition)?;
        }
        if !keys_for_removal.is_empty() {
            remote.s_remove(tree_id, &keys_for_removal)?;
        }
    }

    Ok(differences)
}

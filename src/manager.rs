// Copyright (c) 2024-present
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The background scheduler (§4.8): one thread per registered `tree_id`, periodically
//! rebuilding and syncing against configured peers, stopped cooperatively through the
//! same `Arc<AtomicBool>` stop-signal pattern the teacher crate uses for its own
//! compaction worker.

use crate::config::FullRebuildMode;
use crate::engine::{HashTree, SyncType};
use crate::keys::TreeId;
use crate::rpc::Peer;
use crate::store::DigestStore;
use crate::user_store::UserStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// A cooperative cancellation flag, cloned into a worker thread and checked between
/// sleeps so shutdown never has to wait out a full tick.
#[derive(Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    /// Creates a signal that has not yet fired.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the signal fired; threads observing it via [`Self::is_stopped`] exit at
    /// their next check.
    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether [`Self::stop`] has been called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Sleeps up to `duration`, in short slices, returning early if stopped mid-sleep.
    fn sleep_interruptible(&self, duration: Duration) {
        const SLICE: Duration = Duration::from_millis(100);
        let mut remaining = duration;
        while remaining > Duration::ZERO && !self.is_stopped() {
            let slice = remaining.min(SLICE);
            std::thread::sleep(slice);
            remaining = remaining.saturating_sub(slice);
        }
    }
}

/// A periodic rebuild + sync schedule for one tree.
struct Schedule {
    tree_id: TreeId,
    rebuild_period: Duration,
    stop: StopSignal,
    handle: JoinHandle<()>,
}

/// Owns a [`HashTree`] and a background thread per registered `tree_id`, periodically
/// calling `rebuild` then `synch` against each configured peer. Dropping the manager
/// stops and joins every thread.
pub struct HashTreeManager<D, U> {
    tree: Arc<HashTree<D, U>>,
    schedules: Vec<Schedule>,
}

impl<D, U> HashTreeManager<D, U>
where
    D: DigestStore + 'static,
    U: UserStore + 'static,
{
    /// Wraps `tree`; no background threads are running yet until [`Self::schedule`]
    /// is called.
    #[must_use]
    pub fn new(tree: Arc<HashTree<D, U>>) -> Self {
        Self { tree, schedules: Vec::new() }
    }

    /// Starts a background thread for `tree_id`: every `rebuild_period`, call
    /// `rebuild(tree_id, FullRebuildMode::Periodic(rebuild_period))`, then `synch`
    /// against each of `sync_targets` in turn. A failure on either call is logged and
    /// the loop continues to the next tick; one tree's failures never affect another's
    /// schedule.
    pub fn schedule(&mut self, tree_id: TreeId, rebuild_period: Duration, sync_targets: Vec<Arc<dyn Peer>>) {
        let stop = StopSignal::new();
        let worker_stop = stop.clone();
        let tree = Arc::clone(&self.tree);
        let peers = sync_targets;

        let handle = std::thread::spawn(move || {
            while !worker_stop.is_stopped() {
                worker_stop.sleep_interruptible(rebuild_period);
                if worker_stop.is_stopped() {
                    break;
                }

                if let Err(e) = tree.rebuild(tree_id, FullRebuildMode::Periodic(rebuild_period)) {
                    log::error!("hash-tree: scheduled rebuild failed for tree {tree_id}: {e}");
                    continue;
                }

                for peer in &peers {
                    if let Err(e) = tree.synch(tree_id, peer.as_ref(), SyncType::Update) {
                        log::error!("hash-tree: scheduled sync failed for tree {tree_id}: {e}");
                    }
                }
            }
        });

        self.schedules.push(Schedule {
            tree_id,
            rebuild_period,
            stop,
            handle,
        });
    }

    /// Stops and joins the background thread for `tree_id`, if one is scheduled.
    pub fn unschedule(&mut self, tree_id: TreeId) {
        if let Some(idx) = self.schedules.iter().position(|s| s.tree_id == tree_id) {
            let schedule = self.schedules.remove(idx);
            schedule.stop.stop();
            let _ = schedule.handle.join();
        }
    }

    /// The trees currently scheduled, with their rebuild period.
    pub fn scheduled_trees(&self) -> impl Iterator<Item = (TreeId, Duration)> + '_ {
        self.schedules.iter().map(|s| (s.tree_id, s.rebuild_period))
    }
}

impl<D, U> Drop for HashTreeManager<D, U> {
    fn drop(&mut self) {
        for schedule in &self.schedules {
            schedule.stop.stop();
        }
        for schedule in self.schedules.drain(..) {
            let _ = schedule.handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HashTreeConfig;
    use crate::providers::FixedTreeId;
    use crate::rpc::LocalPeer;
    use crate::store::MemoryDigestStore;
    use crate::user_store::MemoryUserStore;
    use test_log::test;

    fn build_tree() -> Arc<HashTree<MemoryDigestStore, MemoryUserStore>> {
        let config = HashTreeConfig::new()
            .enable_non_blocking_calls(false)
            .tree_id_provider(Arc::new(FixedTreeId(1)))
            .build()
            .unwrap();
        HashTree::new(config, MemoryDigestStore::new(), MemoryUserStore::single_tree(1))
    }

    #[test]
    fn stop_signal_interrupts_a_long_sleep_promptly() {
        let signal = StopSignal::new();
        let signal2 = signal.clone();

        let handle = std::thread::spawn(move || {
            signal2.sleep_interruptible(Duration::from_secs(3600));
        });

        std::thread::sleep(Duration::from_millis(50));
        signal.stop();
        handle.join().expect("worker thread should exit promptly once stopped");
    }

    #[test]
    fn schedule_and_unschedule_tracks_the_tree() {
        let tree = build_tree();
        let mut manager = HashTreeManager::new(tree);

        manager.schedule(1, Duration::from_secs(3600), Vec::new());
        assert_eq!(vec![(1, Duration::from_secs(3600))], manager.scheduled_trees().collect::<Vec<_>>());

        manager.unschedule(1);
        assert!(manager.scheduled_trees().next().is_none());
    }

    #[test]
    fn dropping_the_manager_stops_all_threads() {
        let tree = build_tree();
        let mut manager = HashTreeManager::new(tree);
        manager.schedule(1, Duration::from_secs(3600), Vec::new());
        drop(manager);
    }

    #[test]
    fn scheduled_rebuild_and_sync_run_at_least_once_on_a_short_period() {
        let a = build_tree();
        a.h_put(b"k", b"v").unwrap();

        let b = build_tree();
        let peer: Arc<dyn Peer> = Arc::new(LocalPeer::new(Arc::clone(&b)));

        let mut manager = HashTreeManager::new(Arc::clone(&a));
        manager.schedule(1, Duration::from_millis(20), vec![peer]);

        std::thread::sleep(Duration::from_millis(200));
        manager.unschedule(1);

        assert_eq!(Some(b"v".to_vec()), b.user_store().get(b"k").unwrap());
    }
}

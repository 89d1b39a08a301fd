// Copyright (c) 2024-present
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The non-blocking update queue (§4.3, §9): a bounded FIFO decoupling user-thread
//! `h_put`/`h_remove` calls from the digest-store writes that actually do the work,
//! with `PutIfAbsent`/`RemoveIfAbsent` coalescing while a key is in flight.

use crate::config::UNBOUNDED_QUEUE_SIZE;
use crate::keys::TreeId;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use std::sync::Arc;
use std::thread::JoinHandle;

/// A queued mutation.
#[derive(Clone)]
pub enum QueueItem {
    Put { tree_id: TreeId, key: Vec<u8>, value: Vec<u8> },
    Remove { tree_id: TreeId, key: Vec<u8> },
    PutIfAbsent { tree_id: TreeId, key: Vec<u8>, value: Vec<u8> },
    RemoveIfAbsent { tree_id: TreeId, key: Vec<u8> },
    /// Signals `sender` once every item enqueued ahead of it has been applied. Carries
    /// no key of its own and never touches `in_flight`.
    Barrier(Sender<()>),
    /// Shutdown sentinel. Draining stops after this item.
    Stop,
}

impl QueueItem {
    fn key(&self) -> Option<(TreeId, &[u8])> {
        match self {
            Self::Put { tree_id, key, .. }
            | Self::Remove { tree_id, key }
            | Self::PutIfAbsent { tree_id, key, .. }
            | Self::RemoveIfAbsent { tree_id, key } => Some((*tree_id, key.as_slice())),
            Self::Barrier(_) | Self::Stop => None,
        }
    }

    fn is_conditional(&self) -> bool {
        matches!(self, Self::PutIfAbsent { .. } | Self::RemoveIfAbsent { .. })
    }
}

/// A bounded queue of [`QueueItem`]s, decoupling producers from the worker that
/// drains them. Handed to a worker via [`NonBlockingQueue::drain_with`].
pub struct NonBlockingQueue {
    sender: Sender<QueueItem>,
    receiver: Receiver<QueueItem>,
    in_flight: Mutex<FxHashSet<(TreeId, Vec<u8>)>>,
    stopped: Arc<std::sync::atomic::AtomicBool>,
}

impl NonBlockingQueue {
    /// Creates a queue with the given bounded capacity. A capacity at or above
    /// [`UNBOUNDED_QUEUE_SIZE`] is backed by a genuinely unbounded channel rather than
    /// an array-backed one sized to that capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = if capacity >= UNBOUNDED_QUEUE_SIZE { unbounded() } else { bounded(capacity.max(1)) };
        Self {
            sender,
            receiver,
            in_flight: Mutex::default(),
            stopped: Arc::default(),
        }
    }

    /// Enqueues `item`. `Put`/`Remove` are always enqueued. `PutIfAbsent`/
    /// `RemoveIfAbsent` are enqueued only if no item is currently queued for the same
    /// key; a no-op in that case. Blocks if the queue is at capacity, until space
    /// frees up or `stop()` has been called.
    pub fn enqueue(&self, item: QueueItem) {
        // Checked before touching `in_flight`: once stopped, the worker has already
        // drained past `Stop` and exited, so anything inserted here would never be
        // released by a `ReleaseGuard` and would leak in `in_flight` forever.
        if self.stopped.load(std::sync::atomic::Ordering::Acquire) {
            return;
        }

        if let Some((tree_id, key)) = item.key() {
            if item.is_conditional() {
                let mut in_flight = self.in_flight.lock();
                if !in_flight.insert((tree_id, key.to_vec())) {
                    return;
                }
            } else {
                self.in_flight.lock().insert((tree_id, key.to_vec()));
            }
        }

        // `Sender::send` blocks the calling thread while the channel is full, which is
        // exactly the "no lossy drop policy" behavior required of the queue.
        let _ = self.sender.send(item);
    }

    /// Enqueues the shutdown sentinel. Idempotent.
    pub fn stop(&self) {
        self.stopped.store(true, std::sync::atomic::Ordering::Release);
        let _ = self.sender.send(QueueItem::Stop);
    }

    /// Enqueues `item`, then blocks the calling thread until the worker has actually
    /// drained and applied it (and everything sent ahead of it on this producer).
    /// Used by a full rebuild's reconciliation scan so a `PutIfAbsent`/`RemoveIfAbsent`
    /// takes effect, in order relative to any concurrent `h_put`/`h_remove` on the same
    /// key, before the rebuild proceeds to snapshot dirty segments. A no-op (returns
    /// immediately) once the queue has been stopped, matching `enqueue`'s behavior.
    pub fn enqueue_and_wait(&self, item: QueueItem) {
        if self.stopped.load(std::sync::atomic::Ordering::Acquire) {
            return;
        }

        self.enqueue(item);

        let (tx, rx) = crossbeam_channel::bounded(1);
        // crossbeam's channel preserves the sending order of a single producer, so this
        // barrier is only signaled once the item sent just above has been handled.
        let _ = self.sender.send(QueueItem::Barrier(tx));
        let _ = rx.recv();
    }

    /// Drains the queue on the calling thread, invoking `handler` for every item until
    /// `Stop` is dequeued. `handler` errors are logged; the in-flight entry for that
    /// key is always released afterward, success or failure.
    pub fn drain_with<F>(&self, mut handler: F)
    where
        F: FnMut(&QueueItem) -> crate::Result<()>,
    {
        for item in &self.receiver {
            if matches!(item, QueueItem::Stop) {
                break;
            }

            if let QueueItem::Barrier(tx) = item {
                let _ = tx.send(());
                continue;
            }

            let key = item.key().map(|(t, k)| (t, k.to_vec()));

            // Scoped release: the in-flight entry is removed once the handler returns,
            // regardless of outcome.
            let _release_guard = key.as_ref().map(|k| ReleaseGuard {
                in_flight: &self.in_flight,
                key: k.clone(),
            });

            if let Err(e) = handler(&item) {
                log::error!("hash-tree: queue handler failed: {e}");
            }
        }
    }

    /// Spawns a dedicated worker thread draining `self` via `handler`. `self` must be
    /// wrapped in an `Arc` since the worker outlives the call to this function.
    pub fn spawn_worker<F>(queue: Arc<Self>, mut handler: F) -> JoinHandle<()>
    where
        F: FnMut(&QueueItem) -> crate::Result<()> + Send + 'static,
    {
        std::thread::spawn(move || {
            queue.drain_with(|item| handler(item));
        })
    }

    #[cfg(test)]
    fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }
}

struct ReleaseGuard<'a> {
    in_flight: &'a Mutex<FxHashSet<(TreeId, Vec<u8>)>>,
    key: (TreeId, Vec<u8>),
}

impl Drop for ReleaseGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use test_log::test;

    #[test]
    fn put_if_absent_coalesces_while_in_flight() {
        let queue = Arc::new(NonBlockingQueue::new(16));

        queue.enqueue(QueueItem::PutIfAbsent {
            tree_id: 1,
            key: b"k".to_vec(),
            value: b"v1".to_vec(),
        });
        // Same key, still in-flight (nothing has drained yet) -> coalesced away.
        queue.enqueue(QueueItem::PutIfAbsent {
            tree_id: 1,
            key: b"k".to_vec(),
            value: b"v2".to_vec(),
        });

        assert_eq!(1, queue.in_flight_count());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        queue.stop();
        queue.drain_with(move |item| {
            if let QueueItem::PutIfAbsent { value, .. } = item {
                seen2.lock().push(value.clone());
            }
            Ok(())
        });

        assert_eq!(vec![b"v1".to_vec()], *seen.lock());
        assert_eq!(0, queue.in_flight_count());
    }

    #[test]
    fn put_is_never_coalesced() {
        let queue = Arc::new(NonBlockingQueue::new(16));

        queue.enqueue(QueueItem::Put {
            tree_id: 1,
            key: b"k".to_vec(),
            value: b"v1".to_vec(),
        });
        queue.enqueue(QueueItem::Put {
            tree_id: 1,
            key: b"k".to_vec(),
            value: b"v2".to_vec(),
        });
        queue.stop();

        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        queue.drain_with(move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert_eq!(2, count.load(Ordering::SeqCst));
    }

    #[test]
    fn stop_sentinel_ends_drain_without_invoking_handler_on_it() {
        let queue = Arc::new(NonBlockingQueue::new(16));
        queue.enqueue(QueueItem::Remove { tree_id: 1, key: b"a".to_vec() });
        queue.stop();

        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        queue.drain_with(move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert_eq!(1, count.load(Ordering::SeqCst));
    }

    #[test]
    fn handler_errors_are_swallowed_and_still_release_in_flight() {
        let queue = Arc::new(NonBlockingQueue::new(16));
        queue.enqueue(QueueItem::RemoveIfAbsent { tree_id: 1, key: b"a".to_vec() });
        queue.stop();

        queue.drain_with(|_| Err(crate::Error::Store("boom".into())));
        assert_eq!(0, queue.in_flight_count());
    }
}

//! Bounded queue of membership events for downstream consumers.
//!
//! Producers enqueue [`NodeUpdate`]s in controller-log offset order; the
//! allocator-facing consumer drains them. Both ends block when the queue is
//! full/empty and fail with [`QueueAborted`] once the queue is aborted at
//! shutdown.

use std::collections::VecDeque;
use std::sync::Mutex;

use thiserror::Error;
use tokio::sync::Notify;

use crate::command::NodeUpdate;

/// Error returned from both queue ends after [`NodeUpdateQueue::abort`].
///
/// This is the shutdown signal, not a failure; background loops treat it as
/// a clean exit condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("node update queue aborted")]
pub struct QueueAborted;

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<NodeUpdate>,
    aborted: bool,
}

/// Bounded FIFO of [`NodeUpdate`]s with abort support.
///
/// Insertion order is preserved; consumers may assume monotonic offsets per
/// `(id, kind)` but not globally.
#[derive(Debug)]
pub struct NodeUpdateQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    not_empty: Notify,
    not_full: Notify,
}

impl NodeUpdateQueue {
    /// Creates a queue holding at most `capacity` events.
    ///
    /// # Panics
    ///
    /// Panics on a zero capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "update queue capacity must be positive");
        Self {
            state: Mutex::new(QueueState::default()),
            capacity,
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    /// Enqueues an update, waiting for space when the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`QueueAborted`] once the queue has been aborted.
    pub async fn push_eventually(&self, update: NodeUpdate) -> Result<(), QueueAborted> {
        loop {
            let notified = self.not_full.notified();
            {
                let mut state = self.state.lock().expect("update queue lock poisoned");
                if state.aborted {
                    return Err(QueueAborted);
                }
                if state.items.len() < self.capacity {
                    state.items.push_back(update);
                    drop(state);
                    self.not_empty.notify_one();
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Dequeues the oldest update, waiting when the queue is empty.
    ///
    /// # Errors
    ///
    /// Returns [`QueueAborted`] once the queue has been aborted.
    pub async fn pop_eventually(&self) -> Result<NodeUpdate, QueueAborted> {
        loop {
            let notified = self.not_empty.notified();
            {
                let mut state = self.state.lock().expect("update queue lock poisoned");
                if state.aborted {
                    return Err(QueueAborted);
                }
                if let Some(update) = state.items.pop_front() {
                    drop(state);
                    self.not_full.notify_one();
                    return Ok(update);
                }
            }
            notified.await;
        }
    }

    /// Removes and returns everything currently queued, in insertion order.
    ///
    /// Never blocks; an empty result is a valid outcome.
    #[must_use]
    pub fn drain_nonblocking(&self) -> Vec<NodeUpdate> {
        let drained: Vec<NodeUpdate> = {
            let mut state = self.state.lock().expect("update queue lock poisoned");
            state.items.drain(..).collect()
        };
        if !drained.is_empty() {
            self.not_full.notify_waiters();
            self.not_full.notify_one();
        }
        drained
    }

    /// Aborts the queue: pending and future producers and consumers fail
    /// with [`QueueAborted`]. Queued items are dropped.
    pub fn abort(&self) {
        {
            let mut state = self.state.lock().expect("update queue lock poisoned");
            state.aborted = true;
            state.items.clear();
        }
        // wake registered waiters and leave a stored permit for racers
        self.not_empty.notify_waiters();
        self.not_empty.notify_one();
        self.not_full.notify_waiters();
        self.not_full.notify_one();
    }

    /// True once [`Self::abort`] has been called.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.state.lock().expect("update queue lock poisoned").aborted
    }

    /// Number of queued events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().expect("update queue lock poisoned").items.len()
    }

    /// True when nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::command::NodeUpdateKind;

    use super::*;

    fn update(id: i32, offset: u64) -> NodeUpdate {
        NodeUpdate { id, kind: NodeUpdateKind::Added, offset }
    }

    #[tokio::test]
    async fn test_push_pop_fifo() {
        let queue = NodeUpdateQueue::new(4);
        queue.push_eventually(update(1, 10)).await.unwrap();
        queue.push_eventually(update(2, 11)).await.unwrap();

        assert_eq!(queue.pop_eventually().await.unwrap(), update(1, 10));
        assert_eq!(queue.pop_eventually().await.unwrap(), update(2, 11));
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let queue = Arc::new(NodeUpdateQueue::new(4));
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop_eventually().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push_eventually(update(7, 1)).await.unwrap();

        assert_eq!(consumer.await.unwrap().unwrap(), update(7, 1));
    }

    #[tokio::test]
    async fn test_push_waits_when_full() {
        let queue = Arc::new(NodeUpdateQueue::new(1));
        queue.push_eventually(update(1, 1)).await.unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.push_eventually(update(2, 2)).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!producer.is_finished());

        assert_eq!(queue.pop_eventually().await.unwrap(), update(1, 1));
        producer.await.unwrap().unwrap();
        assert_eq!(queue.pop_eventually().await.unwrap(), update(2, 2));
    }

    #[tokio::test]
    async fn test_drain_nonblocking_preserves_order() {
        let queue = NodeUpdateQueue::new(8);
        for i in 0..5 {
            queue.push_eventually(update(i, i as u64)).await.unwrap();
        }

        let drained = queue.drain_nonblocking();
        assert_eq!(drained.len(), 5);
        assert!(drained.windows(2).all(|w| w[0].offset < w[1].offset));
        assert!(queue.is_empty());
        assert!(queue.drain_nonblocking().is_empty());
    }

    #[tokio::test]
    async fn test_abort_fails_both_ends() {
        let queue = Arc::new(NodeUpdateQueue::new(1));
        queue.push_eventually(update(1, 1)).await.unwrap();

        let blocked_producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.push_eventually(update(2, 2)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        queue.abort();

        assert_eq!(blocked_producer.await.unwrap(), Err(QueueAborted));
        assert_eq!(queue.pop_eventually().await, Err(QueueAborted));
        assert_eq!(queue.push_eventually(update(3, 3)).await, Err(QueueAborted));
        assert!(queue.is_aborted());
    }

    #[tokio::test]
    async fn test_abort_wakes_blocked_consumer() {
        let queue = Arc::new(NodeUpdateQueue::new(1));
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop_eventually().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        queue.abort();
        assert_eq!(consumer.await.unwrap(), Err(QueueAborted));
    }
}

//! In-process work queue shared by consumers and workers.
//!
//! Consumers push deliveries tagged with a priority; workers pop the highest
//! priority first, oldest first within a priority.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

pub(crate) struct Entry<T> {
    pub(crate) priority: u8,
    seq: u64,
    pub(crate) item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // 優先度が高い順、同じなら先に入った順
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

pub(crate) struct WorkQueue<T> {
    heap: Mutex<BinaryHeap<Entry<T>>>,
    seq: AtomicU64,
    available: Notify,
    closed: AtomicBool,
}

impl<T> WorkQueue<T> {
    pub(crate) fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
            available: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    // ロックは await を跨がない
    fn lock(&self) -> MutexGuard<'_, BinaryHeap<Entry<T>>> {
        self.heap.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn push(&self, priority: u8, item: T) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.lock().push(Entry { priority, seq, item });
        self.available.notify_one();
    }

    /// Put a popped entry back with its original place in line.
    pub(crate) fn requeue(&self, entry: Entry<T>) {
        self.lock().push(entry);
        self.available.notify_one();
    }

    /// The next entry; `None` once closed and drained.
    pub(crate) async fn pop(&self) -> Option<Entry<T>> {
        loop {
            // Register interest before checking so a concurrent push is not missed.
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(entry) = self.lock().pop() {
                return Some(entry);
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            notified.await;
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.available.notify_waiters();
    }
}

/// Pause switch checked by workers between messages.
#[derive(Default)]
pub(crate) struct PauseGate {
    paused: AtomicBool,
    resumed: Notify,
}

impl PauseGate {
    pub(crate) fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub(crate) fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.resumed.notify_waiters();
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub(crate) async fn wait_resumed(&self) {
        loop {
            let notified = self.resumed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.is_paused() {
                return;
            }
            notified.await;
        }
    }
}

/// Counts deliveries that were received but not yet settled with the broker.
#[derive(Default)]
pub(crate) struct WorkTracker {
    outstanding: AtomicUsize,
    idle: Notify,
}

impl WorkTracker {
    pub(crate) fn begin(&self) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn done(&self) {
        self.done_many(1);
    }

    pub(crate) fn done_many(&self, n: usize) {
        if n == 0 {
            return;
        }
        let previous = self
            .outstanding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(current.saturating_sub(n))
            })
            .unwrap_or(0);
        if previous <= n {
            self.idle.notify_waiters();
        }
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    pub(crate) async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.outstanding() == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn higher_priorities_pop_first_then_oldest() {
        let queue = WorkQueue::new();
        queue.push(0, "low");
        queue.push(5, "high-1");
        queue.push(5, "high-2");
        queue.push(1, "mid");

        let mut order = Vec::new();
        while queue.len() > 0 {
            order.push(queue.pop().await.unwrap().item);
        }
        assert_eq!(order, vec!["high-1", "high-2", "mid", "low"]);
    }

    #[tokio::test]
    async fn requeued_entries_keep_their_place() {
        let queue = WorkQueue::new();
        queue.push(0, "first");
        queue.push(0, "second");

        let first = queue.pop().await.unwrap();
        queue.requeue(first);
        assert_eq!(queue.pop().await.unwrap().item, "first");
    }

    #[tokio::test]
    async fn pop_waits_for_push_and_ends_on_close() {
        let queue = Arc::new(WorkQueue::new());
        let popper = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await.map(|entry| entry.item) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push(0, 7);
        assert_eq!(popper.await.unwrap(), Some(7));

        queue.close();
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn tracker_reports_idle() {
        let tracker = Arc::new(WorkTracker::default());
        tracker.begin();
        tracker.begin();

        let waiter = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move { tracker.wait_idle().await })
        };
        tracker.done();
        assert_eq!(tracker.outstanding(), 1);
        tracker.done_many(5);
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(tracker.outstanding(), 0);
    }

    #[tokio::test]
    async fn paused_gate_blocks_until_resumed() {
        let gate = Arc::new(PauseGate::default());
        gate.pause();
        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.wait_resumed().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        gate.resume();
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }
}

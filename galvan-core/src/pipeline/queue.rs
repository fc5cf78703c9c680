use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use tokio::sync::Notify;

/// Result of pushing into a [`DropOldestQueue`].
#[derive(Debug)]
pub(crate) enum PushOutcome<T> {
    /// The item was enqueued; `evicted` holds the oldest item if the queue
    /// was full.
    Enqueued { evicted: Option<T> },
    /// The queue is closed; the item is handed back to the caller.
    Closed(T),
}

/// Bounded multi-producer queue with DropOldest overflow, shared by the
/// pipeline and the per-sink forwarding queues.
///
/// Producers never block: when full, the oldest item is evicted and returned
/// so the caller can hand it to the overflow exporter. A single consumer
/// drains with `try_pop` and parks on `wait`.
#[derive(Debug)]
pub(crate) struct DropOldestQueue<T> {
    buf: Mutex<VecDeque<T>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
    depth: AtomicUsize,
    dropped: AtomicU64,
}

impl<T> DropOldestQueue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        Self {
            buf: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity,
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            depth: AtomicUsize::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn push(&self, item: T) -> PushOutcome<T> {
        if self.closed.load(Ordering::Acquire) {
            return PushOutcome::Closed(item);
        }
        let evicted = {
            let mut buf = self.buf.lock().unwrap_or_else(|e| e.into_inner());
            let evicted = if buf.len() >= self.capacity {
                buf.pop_front()
            } else {
                None
            };
            buf.push_back(item);
            self.depth.store(buf.len(), Ordering::Relaxed);
            evicted
        };
        if evicted.is_some() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        PushOutcome::Enqueued { evicted }
    }

    pub fn try_pop(&self) -> Option<T> {
        let mut buf = self.buf.lock().unwrap_or_else(|e| e.into_inner());
        let item = buf.pop_front();
        self.depth.store(buf.len(), Ordering::Relaxed);
        item
    }

    /// Park until a producer pushes or the queue closes. Spurious wakeups are
    /// fine; callers re-check with `try_pop`.
    pub async fn wait(&self) {
        self.notify.notified().await;
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_oldest_preserves_recency() {
        let queue = DropOldestQueue::new(4);
        let mut evicted = Vec::new();
        for i in 1..=10 {
            match queue.push(i) {
                PushOutcome::Enqueued { evicted: Some(old) } => evicted.push(old),
                PushOutcome::Enqueued { evicted: None } => {}
                PushOutcome::Closed(_) => panic!("queue closed"),
            }
        }
        assert_eq!(evicted, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(queue.dropped(), 6);

        let mut remaining = Vec::new();
        while let Some(item) = queue.try_pop() {
            remaining.push(item);
        }
        assert_eq!(remaining, vec![7, 8, 9, 10]);
    }

    #[test]
    fn closed_queue_refuses_pushes() {
        let queue = DropOldestQueue::new(2);
        queue.push(1);
        queue.close();
        assert!(matches!(queue.push(2), PushOutcome::Closed(2)));
        // Items enqueued before close still drain.
        assert_eq!(queue.try_pop(), Some(1));
    }
}

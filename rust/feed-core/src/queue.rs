// rust/feed-core/src/queue.rs

//! Thread-safe FIFO used as the synchronization primitive of the feed.
//!
//! Capacity is not enforced here: every queue in the pipeline carries a
//! fixed population of items cycling between two queues, so the population
//! bounds the depth.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::fatal;
use crate::worker::{Interrupt, StopToken};

struct QueueInner<T> {
    name: String,
    items: Mutex<VecDeque<T>>,
    available: Condvar,
}

impl<T: Send> Interrupt for QueueInner<T> {
    fn interrupt(&self) {
        // Taking the lock orders this wake-up after any waiter's flag check.
        let _items = self.items.lock();
        self.available.notify_all();
    }
}

/// A blocking FIFO queue.
pub struct BoundedSyncQueue<T> {
    inner: Arc<QueueInner<T>>,
}

impl<T> BoundedSyncQueue<T> {
    /// Creates an empty, unnamed queue.
    pub fn new() -> Self {
        Self::named("queue")
    }

    /// Creates an empty queue whose name appears in logs and fatal errors.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                name: name.into(),
                items: Mutex::new(VecDeque::new()),
                available: Condvar::new(),
            }),
        }
    }

    /// Returns the queue name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Appends an item and wakes one blocked popper.
    pub fn push(&self, item: T) {
        let mut items = self.inner.items.lock();
        items.push_back(item);
        drop(items);
        self.inner.available.notify_one();
    }

    /// Removes the front item if there is one.
    pub fn try_pop(&self) -> Option<T> {
        self.inner.items.lock().pop_front()
    }

    /// Blocks until an item is available and removes it.
    pub fn pop(&self) -> T {
        let mut items = self.inner.items.lock();
        loop {
            if let Some(item) = items.pop_front() {
                return item;
            }
            self.inner.available.wait(&mut items);
        }
    }

    /// Waits at most `timeout` for an item.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut items = self.inner.items.lock();
        loop {
            if let Some(item) = items.pop_front() {
                return Some(item);
            }
            if self.inner.available.wait_until(&mut items, deadline).timed_out() {
                return items.pop_front();
            }
        }
    }

    /// Pops at the consumer boundary, where starvation means the pipeline is
    /// misconfigured: waits at most `timeout`, then aborts the process naming
    /// this queue.
    pub fn pop_or_abort(&self, timeout: Duration) -> T {
        if let Some(item) = self.try_pop() {
            return item;
        }
        tracing::debug!(queue = %self.inner.name, "queue empty, waiting");
        match self.pop_timeout(timeout) {
            Some(item) => item,
            None => fatal(format!(
                "queue '{}' stayed empty for {:?}; the producer is stalled",
                self.inner.name, timeout
            )),
        }
    }

    /// Inspects the front item without removing it.
    pub fn try_peek_with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.inner.items.lock().front().map(f)
    }

    /// Waits at most `timeout` for an item, then inspects it in place.
    pub fn peek_timeout_with<R>(&self, timeout: Duration, f: impl FnOnce(&T) -> R) -> Option<R> {
        let deadline = Instant::now() + timeout;
        let mut items = self.inner.items.lock();
        loop {
            if let Some(front) = items.front() {
                return Some(f(front));
            }
            if self.inner.available.wait_until(&mut items, deadline).timed_out() {
                return items.front().map(f);
            }
        }
    }

    /// Number of items currently queued.
    pub fn len(&self) -> usize {
        self.inner.items.lock().len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.inner.items.lock().is_empty()
    }
}

impl<T: Send + 'static> BoundedSyncQueue<T> {
    /// Blocks until an item is available or `stop` is requested.
    ///
    /// Returns `None` only when stopped; a stop request always wins over a
    /// queued item so shutdown is prompt.
    pub fn pop_interruptible(&self, stop: &StopToken) -> Option<T> {
        stop.watch(self.as_interrupt());
        let mut items = self.inner.items.lock();
        loop {
            if stop.is_stop_requested() {
                return None;
            }
            if let Some(item) = items.pop_front() {
                return Some(item);
            }
            self.inner.available.wait(&mut items);
        }
    }

    fn as_interrupt(&self) -> Weak<dyn Interrupt> {
        let weak: Weak<QueueInner<T>> = Arc::downgrade(&self.inner);
        weak
    }
}

impl<T> Default for BoundedSyncQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for BoundedSyncQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedSyncQueue")
            .field("name", &self.inner.name)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_pop_or_abort_names_the_queue() {
        if crate::error::abort_check::in_child() {
            let queue: BoundedSyncQueue<u32> = BoundedSyncQueue::named("stalled-batches");
            queue.pop_or_abort(Duration::from_millis(10));
            return;
        }
        let output =
            crate::error::abort_check::run_in_child("queue::tests::test_pop_or_abort_names_the_queue");
        assert!(!output.status.success());
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(stderr.contains("queue 'stalled-batches' stayed empty"), "{stderr}");
    }

    #[test]
    fn test_fifo_order() {
        let queue = BoundedSyncQueue::new();
        for i in 0..5 {
            queue.push(i);
        }
        let popped: Vec<_> = (0..5).map(|_| queue.pop()).collect();
        assert_eq!(popped, vec![0, 1, 2, 3, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_try_pop_empty() {
        let queue: BoundedSyncQueue<u8> = BoundedSyncQueue::named("empty");
        assert_eq!(queue.try_pop(), None);
        assert_eq!(queue.name(), "empty");
    }

    #[test]
    fn test_pop_blocks_until_push() {
        let queue = Arc::new(BoundedSyncQueue::new());
        let producer = {
            let queue = queue.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                queue.push(42u32);
            })
        };

        assert_eq!(queue.pop(), 42);
        producer.join().unwrap();
    }

    #[test]
    fn test_pop_timeout_expires() {
        let queue: BoundedSyncQueue<u32> = BoundedSyncQueue::new();
        let start = Instant::now();
        assert_eq!(queue.pop_timeout(Duration::from_millis(20)), None);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_pop_or_abort_returns_available_item() {
        let queue = BoundedSyncQueue::new();
        queue.push("ready");
        assert_eq!(queue.pop_or_abort(Duration::from_millis(1)), "ready");
    }

    #[test]
    fn test_peek_does_not_remove() {
        let queue = BoundedSyncQueue::new();
        assert_eq!(queue.try_peek_with(|v: &Vec<u8>| v.len()), None);

        queue.push(vec![1u8, 2, 3]);
        assert_eq!(queue.try_peek_with(|v| v.len()), Some(3));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop(), vec![1, 2, 3]);
    }

    #[test]
    fn test_peek_timeout_waits_for_item() {
        let queue = Arc::new(BoundedSyncQueue::new());
        let producer = {
            let queue = queue.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                queue.push(7u32);
            })
        };

        let seen = queue.peek_timeout_with(Duration::from_secs(5), |v| *v);
        assert_eq!(seen, Some(7));
        assert_eq!(queue.len(), 1);
        producer.join().unwrap();
    }

    #[test]
    fn test_per_producer_order_preserved() {
        let queue = Arc::new(BoundedSyncQueue::new());
        let producers: Vec<_> = (0..4u32)
            .map(|p| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for i in 0..100u32 {
                        queue.push((p, i));
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        let mut last = [None::<u32>; 4];
        while let Some((p, i)) = queue.try_pop() {
            if let Some(prev) = last[p as usize] {
                assert!(i > prev);
            }
            last[p as usize] = Some(i);
        }
        assert!(last.iter().all(|l| *l == Some(99)));
    }

    #[test]
    fn test_pop_interruptible_prefers_stop() {
        let queue = BoundedSyncQueue::new();
        queue.push(1u32);
        let stop = StopToken::new();
        stop.request_stop();
        assert_eq!(queue.pop_interruptible(&stop), None);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_pop_interruptible_receives_item() {
        let queue = Arc::new(BoundedSyncQueue::new());
        let stop = StopToken::new();
        let producer = {
            let queue = queue.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                queue.push(5u32);
            })
        };
        assert_eq!(queue.pop_interruptible(&stop), Some(5));
        producer.join().unwrap();
    }
}

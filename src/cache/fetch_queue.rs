//! Priority-ordered blocking queue feeding the fetcher threads.
//!
//! Requests are kept in one FIFO sub-queue per priority level (0 is the
//! highest). On frame rollover the remaining contents are moved to a
//! prefetch shadow rather than discarded, so the next frame can
//! reprioritize without losing enqueue decisions that were already paid
//! for. The shadow is only drained once all live queues are empty.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

pub struct BlockingPriorityQueue<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
}

struct Inner<T> {
    queues: Vec<VecDeque<T>>,
    prefetch: VecDeque<T>,
    len: usize,
    closed: bool,
}

impl<T> BlockingPriorityQueue<T> {
    pub fn new(num_priorities: usize) -> Self {
        let num_priorities = num_priorities.max(1);
        Self {
            inner: Mutex::new(Inner {
                queues: (0..num_priorities).map(|_| VecDeque::new()).collect(),
                prefetch: VecDeque::new(),
                len: 0,
                closed: false,
            }),
            not_empty: Condvar::new(),
        }
    }

    /// Append `item` to the sub-queue for `priority` (clamped to the
    /// configured range).
    pub fn put(&self, item: T, priority: usize) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        let p = priority.min(inner.queues.len() - 1);
        inner.queues[p].push_back(item);
        inner.len += 1;
        self.not_empty.notify_one();
    }

    /// Block until an item is available and remove it, live queues in
    /// strict priority order first, then the prefetch shadow. Returns
    /// `None` once the queue has been closed.
    pub fn take(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return None;
            }
            if inner.len > 0 {
                inner.len -= 1;
                for p in 0..inner.queues.len() {
                    if let Some(item) = inner.queues[p].pop_front() {
                        return Some(item);
                    }
                }
                return inner.prefetch.pop_front();
            }
            self.not_empty.wait(&mut inner);
        }
    }

    /// Atomically degrade all pending requests to prefetch priority.
    /// Nothing is dropped; the shadow is consumed after the live queues.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        for p in 0..inner.queues.len() {
            while let Some(item) = inner.queues[p].pop_front() {
                inner.prefetch.push_back(item);
            }
        }
    }

    /// Wake all blocked takers and make subsequent `take` calls return
    /// `None`. Used for shutdown only.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        self.not_empty.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub(crate) fn live_len(&self) -> usize {
        let inner = self.inner.lock();
        inner.queues.iter().map(|q| q.len()).sum()
    }

    #[cfg(test)]
    pub(crate) fn prefetch_len(&self) -> usize {
        self.inner.lock().prefetch.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn takes_in_priority_order() {
        let queue = BlockingPriorityQueue::new(3);
        queue.put("low", 2);
        queue.put("high", 0);
        queue.put("mid", 1);
        queue.put("high2", 0);

        assert_eq!(queue.take(), Some("high"));
        assert_eq!(queue.take(), Some("high2"));
        assert_eq!(queue.take(), Some("mid"));
        assert_eq!(queue.take(), Some("low"));
    }

    #[test]
    fn clear_degrades_to_prefetch_without_losing_items() {
        let queue = BlockingPriorityQueue::new(2);
        queue.put(1, 0);
        queue.put(2, 1);
        queue.clear();

        assert_eq!(queue.live_len(), 0);
        assert_eq!(queue.prefetch_len(), 2);
        assert_eq!(queue.len(), 2);

        // fresh requests are served before the degraded ones
        queue.put(3, 1);
        assert_eq!(queue.take(), Some(3));
        assert_eq!(queue.take(), Some(1));
        assert_eq!(queue.take(), Some(2));
    }

    #[test]
    fn close_unblocks_takers() {
        let queue = std::sync::Arc::new(BlockingPriorityQueue::<u32>::new(1));
        let q = queue.clone();
        let taker = std::thread::spawn(move || q.take());
        std::thread::sleep(std::time::Duration::from_millis(20));
        queue.close();
        assert_eq!(taker.join().expect("taker thread panicked"), None);
    }
}

//! Background workers that drain the fetch queue into the cache.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::cache::block_cache::{BlockKey, CacheInner};
use crate::cache::fetch_queue::BlockingPriorityQueue;
use crate::volume::{BlockLoader, LoaderError};

/// Deadline gate shared by all fetchers. While a deadline is set and in
/// the future, fetchers hold the key they last took and wait.
struct FetcherGate {
    deadline: Mutex<Option<Instant>>,
    resume: Condvar,
}

impl FetcherGate {
    fn new() -> Self {
        Self {
            deadline: Mutex::new(None),
            resume: Condvar::new(),
        }
    }

    fn wait_while_paused(&self) {
        let mut deadline = self.deadline.lock();
        while let Some(until) = *deadline {
            if Instant::now() >= until {
                break;
            }
            self.resume.wait_until(&mut deadline, until);
        }
    }

    fn pause_until(&self, until: Instant) {
        *self.deadline.lock() = Some(until);
        self.resume.notify_all();
    }

    fn wake(&self) {
        *self.deadline.lock() = None;
        self.resume.notify_all();
    }
}

pub(crate) struct FetcherPool {
    gate: Arc<FetcherGate>,
    queue: Arc<BlockingPriorityQueue<BlockKey>>,
    workers: Vec<JoinHandle<()>>,
}

impl FetcherPool {
    pub(crate) fn new<L: BlockLoader>(
        cache: &Arc<CacheInner<L>>,
        queue: Arc<BlockingPriorityQueue<BlockKey>>,
        num_threads: usize,
    ) -> Self {
        let gate = Arc::new(FetcherGate::new());
        let workers = (0..num_threads)
            .map(|i| {
                let cache = Arc::clone(cache);
                let queue = Arc::clone(&queue);
                let gate = Arc::clone(&gate);
                std::thread::Builder::new()
                    .name(format!("fetcher-{}", i))
                    .spawn(move || run_fetcher(cache, queue, gate))
                    .expect("failed to spawn fetcher thread")
            })
            .collect();
        Self { gate, queue, workers }
    }

    pub(crate) fn pause_until(&self, deadline: Instant) {
        self.gate.pause_until(deadline);
    }

    pub(crate) fn wake(&self) {
        self.gate.wake();
    }
}

impl Drop for FetcherPool {
    fn drop(&mut self) {
        self.queue.close();
        self.gate.wake();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::warn!("fetcher thread panicked during shutdown");
            }
        }
    }
}

fn run_fetcher<L: BlockLoader>(
    cache: Arc<CacheInner<L>>,
    queue: Arc<BlockingPriorityQueue<BlockKey>>,
    gate: Arc<FetcherGate>,
) {
    log::debug!("fetcher started");
    while let Some(key) = queue.take() {
        gate.wait_while_paused();
        // entry may have been reclaimed since it was enqueued
        if let Some(entry) = cache.lookup(&key) {
            loop {
                match cache.load_if_invalid(&entry) {
                    Err(LoaderError::Interrupted) => continue,
                    _ => break,
                }
            }
        }
    }
    log::debug!("fetcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn paused_gate_releases_at_deadline() {
        let gate = FetcherGate::new();
        gate.pause_until(Instant::now() + Duration::from_millis(20));
        let t0 = Instant::now();
        gate.wait_while_paused();
        let waited = t0.elapsed();
        assert!(waited >= Duration::from_millis(15), "waited {:?}", waited);
    }

    #[test]
    fn wake_clears_the_deadline() {
        let gate = Arc::new(FetcherGate::new());
        gate.pause_until(Instant::now() + Duration::from_secs(60));
        let waiter = {
            let gate = Arc::clone(&gate);
            std::thread::spawn(move || {
                let t0 = Instant::now();
                gate.wait_while_paused();
                t0.elapsed()
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        gate.wake();
        let waited = waiter.join().expect("waiter thread panicked");
        assert!(waited < Duration::from_secs(10), "waited {:?}", waited);
    }
}

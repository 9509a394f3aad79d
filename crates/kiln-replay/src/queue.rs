//! Work queue and worker pool.
//!
//! One mutex guards the queue together with the `queued`/`completed`
//! counters, so `queued == completed` is a consistent quiescence test rather
//! than a racy pair of atomics. Two condition variables: `available` wakes
//! workers, `done` wakes `drain` callers when the queue empties.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Instant;

struct QueueState<T> {
    queue: VecDeque<T>,
    queued: u64,
    completed: u64,
    shutting_down: bool,
}

struct QueueShared<T> {
    state: Mutex<QueueState<T>>,
    available: Condvar,
    done: Condvar,
    idle_ns: AtomicU64,
    total_ns: AtomicU64,
}

impl<T> QueueShared<T> {
    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// A pool of worker threads draining a shared queue.
///
/// Contracts:
/// - `enqueue` never blocks beyond mutex acquisition.
/// - `drain` returns only once every enqueued item has completed and may be
///   called repeatedly.
/// - `shutdown` is idempotent; pending items are discarded, workers join.
pub struct WorkerPool<T: Send + 'static> {
    shared: Arc<QueueShared<T>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn new<F>(num_threads: usize, handler: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let shared = Arc::new(QueueShared {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                queued: 0,
                completed: 0,
                shutting_down: false,
            }),
            available: Condvar::new(),
            done: Condvar::new(),
            idle_ns: AtomicU64::new(0),
            total_ns: AtomicU64::new(0),
        });

        let handler = Arc::new(handler);
        let mut workers = Vec::with_capacity(num_threads.max(1));
        for i in 0..num_threads.max(1) {
            let shared = Arc::clone(&shared);
            let handler = Arc::clone(&handler);
            let thread = std::thread::Builder::new()
                .name(format!("kiln-worker-{i}"))
                .spawn(move || worker_loop(&shared, handler.as_ref()))
                .expect("spawning a worker thread should not fail at startup");
            workers.push(thread);
        }

        Self {
            shared,
            workers: Mutex::new(workers),
        }
    }

    pub fn enqueue(&self, item: T) {
        let mut state = self.shared.lock();
        state.queue.push_back(item);
        state.queued += 1;
        self.shared.available.notify_one();
    }

    /// Block until every enqueued item has completed.
    pub fn drain(&self) {
        let mut state = self.shared.lock();
        while state.queued != state.completed {
            state = match self.shared.done.wait(state) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    pub fn shutdown(&self) {
        {
            let mut state = self.shared.lock();
            state.shutting_down = true;
            self.shared.available.notify_all();
        }
        let workers = {
            let mut guard = match self.workers.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::take(&mut *guard)
        };
        for worker in workers {
            let _ = worker.join();
        }
    }

    pub fn queued(&self) -> u64 {
        self.shared.lock().queued
    }

    pub fn completed(&self) -> u64 {
        self.shared.lock().completed
    }

    /// Accumulated time workers spent parked on the queue.
    pub fn idle_ns(&self) -> u64 {
        self.shared.idle_ns.load(Ordering::Relaxed)
    }

    /// Accumulated worker thread lifetimes; final once the pool is shut down.
    pub fn total_ns(&self) -> u64 {
        self.shared.total_ns.load(Ordering::Relaxed)
    }
}

impl<T: Send + 'static> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop<T>(shared: &QueueShared<T>, handler: &dyn Fn(T)) {
    let thread_start = Instant::now();
    let mut idle_ns = 0u64;

    loop {
        let idle_start = Instant::now();
        let item = {
            let mut state = shared.lock();
            loop {
                if state.shutting_down {
                    break None;
                }
                if let Some(item) = state.queue.pop_front() {
                    break Some(item);
                }
                state = match shared.available.wait(state) {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
            }
        };
        idle_ns += idle_start.elapsed().as_nanos() as u64;

        let Some(item) = item else { break };

        handler(item);

        let mut state = shared.lock();
        state.completed += 1;
        if state.completed == state.queued {
            shared.done.notify_all();
        }
    }

    shared.idle_ns.fetch_add(idle_ns, Ordering::Relaxed);
    shared
        .total_ns
        .fetch_add(thread_start.elapsed().as_nanos() as u64, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::WorkerPool;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[test]
    fn drain_waits_for_all_items() {
        let sum = Arc::new(AtomicU64::new(0));
        let sum2 = Arc::clone(&sum);
        let pool = WorkerPool::new(4, move |value: u64| {
            sum2.fetch_add(value, Ordering::Relaxed);
        });

        for i in 1..=100 {
            pool.enqueue(i);
        }
        pool.drain();
        assert_eq!(sum.load(Ordering::Relaxed), 5050);
        assert_eq!(pool.queued(), pool.completed());

        // drain is repeatable and quiescence holds.
        pool.drain();
        assert_eq!(pool.queued(), pool.completed());
    }

    #[test]
    fn drain_on_empty_pool_returns_immediately() {
        let pool = WorkerPool::new(2, |_: u64| {});
        pool.drain();
        assert_eq!(pool.completed(), 0);
    }

    #[test]
    fn shutdown_is_idempotent_and_empty_shutdown_is_a_noop() {
        let pool = WorkerPool::new(2, |_: u64| {});
        pool.shutdown();
        pool.shutdown();
    }

    #[test]
    fn items_enqueued_from_many_threads_all_complete() {
        let count = Arc::new(AtomicU64::new(0));
        let count2 = Arc::clone(&count);
        let pool = Arc::new(WorkerPool::new(4, move |_: u64| {
            count2.fetch_add(1, Ordering::Relaxed);
        }));

        let mut producers = Vec::new();
        for t in 0..4u64 {
            let pool = Arc::clone(&pool);
            producers.push(std::thread::spawn(move || {
                for i in 0..250 {
                    pool.enqueue(t * 1000 + i);
                }
            }));
        }
        for producer in producers {
            producer.join().expect("producer join");
        }

        pool.drain();
        assert_eq!(count.load(Ordering::Relaxed), 1000);
        assert_eq!(pool.queued(), 1000);
        assert_eq!(pool.completed(), 1000);
    }
}

//! The `Schedule(task)` abstraction executors implement (§6), plus the two
//! concrete executors the scheduler ships with: a worker-thread pool
//! (grounded on `communication/src/initialize.rs`'s thread-spawn loop and the
//! single-thread pipe allocator in `communication/src/allocator/thread.rs`)
//! and a reserved, synchronous "run on the caller's thread" executor.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

/// A unit of work an executor runs exactly once.
pub type Task = Box<dyn FnOnce() + Send>;

/// The only capability the scheduler needs from an executor. Deliberately
/// minimal: the scheduler, not the executor, owns priority and throttling.
pub trait Executor: Send + Sync {
    /// Enqueues `task` for execution; may run concurrently with other tasks.
    fn schedule(&self, task: Task);
}

/// A fixed-size pool of worker threads pulling tasks off a shared queue.
pub struct ThreadPoolExecutor {
    queue: Arc<Mutex<VecDeque<Task>>>,
    condvar: Arc<Condvar>,
    shutdown: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPoolExecutor {
    /// Spawns `num_threads` workers (at least one), each looping on the
    /// shared queue until `shutdown` is called.
    pub fn new(num_threads: usize) -> Self {
        let queue: Arc<Mutex<VecDeque<Task>>> = Arc::new(Mutex::new(VecDeque::new()));
        let condvar = Arc::new(Condvar::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::new();
        for _ in 0..num_threads.max(1) {
            let queue = queue.clone();
            let condvar = condvar.clone();
            let shutdown = shutdown.clone();
            workers.push(std::thread::spawn(move || Self::worker_loop(queue, condvar, shutdown)));
        }
        ThreadPoolExecutor { queue, condvar, shutdown, workers: Mutex::new(workers) }
    }

    /// The default pool size: `min(available_parallelism, node_count)`,
    /// never less than one (§5).
    pub fn default_pool_size(node_count: usize) -> usize {
        let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        cpus.min(node_count.max(1))
    }

    fn worker_loop(queue: Arc<Mutex<VecDeque<Task>>>, condvar: Arc<Condvar>, shutdown: Arc<AtomicBool>) {
        loop {
            let task = {
                let mut guard = queue.lock().unwrap();
                loop {
                    if let Some(task) = guard.pop_front() {
                        break Some(task);
                    }
                    if shutdown.load(Ordering::Acquire) {
                        break None;
                    }
                    guard = condvar.wait(guard).unwrap();
                }
            };
            match task {
                Some(task) => task(),
                None => return,
            }
        }
    }

    /// Signals every worker to exit once its queue drains, and joins them.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.condvar.notify_all();
        let mut workers = self.workers.lock().unwrap();
        for worker in workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Executor for ThreadPoolExecutor {
    fn schedule(&self, task: Task) {
        self.queue.lock().unwrap().push_back(task);
        self.condvar.notify_one();
    }
}

impl Drop for ThreadPoolExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The reserved executor backing [`crate::contract::APPLICATION_THREAD_EXECUTOR`].
/// `schedule` only enqueues; tasks run when [`Self::drain`] is called from the
/// thread that called `wait_until_done` — no worker pool is ever spawned.
#[derive(Default)]
pub struct ApplicationThreadExecutor {
    queue: Mutex<VecDeque<Task>>,
}

impl ApplicationThreadExecutor {
    /// Creates an empty executor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs every currently queued task, including ones enqueued by tasks run
    /// during this same call, until the queue is empty.
    pub fn drain(&self) {
        loop {
            let task = self.queue.lock().unwrap().pop_front();
            match task {
                Some(task) => task(),
                None => return,
            }
        }
    }

    /// Whether any task is currently queued.
    pub fn is_empty(&self) -> bool {
        self.queue.lock().unwrap().is_empty()
    }
}

impl Executor for ApplicationThreadExecutor {
    fn schedule(&self, task: Task) {
        self.queue.lock().unwrap().push_back(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn thread_pool_runs_every_task() {
        let pool = ThreadPoolExecutor::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = counter.clone();
            pool.schedule(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn application_thread_executor_runs_only_on_drain() {
        let exec = ApplicationThreadExecutor::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        exec.schedule(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        exec.drain();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}

//! Worker thread pool
//!
//! A FIFO queue of boxed work items guarded by a mutex, with a condvar
//! playing the counting semaphore: growth and wakeup are ordered under
//! the mutex, so a woken `work` call always finds either an item or the
//! shutdown flag.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::trace;
use parking_lot::{Condvar, Mutex};

use crate::aflags::AtomicFlags8;
use crate::error::{Error, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

const STOP: u8 = 1;

struct PoolShared {
    queue: Mutex<VecDeque<Job>>,
    ready: Condvar,
    flags: AtomicFlags8,
}

/// Fixed pool of worker threads blocked on the work queue.
///
/// Single-owner: dropping the pool shuts it down and joins the workers.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    workers: Vec<JoinHandle<()>>,
}

impl Default for ThreadPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadPool {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(PoolShared {
                queue: Mutex::new(VecDeque::new()),
                ready: Condvar::new(),
                flags: AtomicFlags8::new(0),
            }),
            workers: Vec::new(),
        }
    }

    /// Enqueue a work item and wake one worker.
    pub fn add(&self, job: impl FnOnce() + Send + 'static) -> Result<()> {
        if self.shared.flags.test(STOP) {
            return Err(Error::Closed);
        }
        let mut queue = self.shared.queue.lock();
        if queue.try_reserve(1).is_err() {
            return Err(Error::NoMemory);
        }
        queue.push_back(Box::new(job));
        drop(queue);
        self.shared.ready.notify_one();
        Ok(())
    }

    /// Pop and run one item without blocking. True if an item ran.
    pub fn try_work(&self) -> bool {
        Self::try_work_on(&self.shared)
    }

    /// Block until an item is available and run it. False once the pool
    /// is shut down.
    pub fn work(&self) -> bool {
        Self::work_on(&self.shared)
    }

    /// The ready-made worker loop: run items until shutdown. May be
    /// called from caller-owned threads alongside the spawned workers.
    pub fn run_worker(&self) {
        while self.work() {}
    }

    /// Spawn `n` worker threads blocked on the queue.
    pub fn spawn_workers(&mut self, n: usize) -> Result<()> {
        for i in 0..n {
            let shared = self.shared.clone();
            let handle = thread::Builder::new()
                .name(format!("znet-pool-{}", self.workers.len() + i))
                .spawn(move || while Self::work_on(&shared) {})
                .map_err(Error::from)?;
            self.workers.push(handle);
        }
        Ok(())
    }

    /// Request exit and join every worker. Pending items are dropped.
    /// Must not be called from a worker thread.
    pub fn shutdown(&mut self) {
        self.shared.flags.set(STOP);
        self.shared.ready.notify_all();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        let dropped = {
            let mut queue = self.shared.queue.lock();
            let len = queue.len();
            queue.clear();
            len
        };
        if dropped > 0 {
            trace!("pool: dropped {} pending work items", dropped);
        }
    }

    /// Items waiting in the queue.
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().len()
    }

    fn try_work_on(shared: &PoolShared) -> bool {
        let job = shared.queue.lock().pop_front();
        match job {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }

    fn work_on(shared: &PoolShared) -> bool {
        let mut queue = shared.queue.lock();
        loop {
            if shared.flags.test(STOP) {
                return false;
            }
            if let Some(job) = queue.pop_front() {
                drop(queue);
                job();
                return true;
            }
            shared.ready.wait(&mut queue);
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn try_work_runs_queued_item() {
        let pool = ThreadPool::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        pool.add(move || {
            r.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        assert!(pool.try_work());
        assert!(!pool.try_work());
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn workers_drain_the_queue() {
        let mut pool = ThreadPool::new();
        pool.spawn_workers(4).unwrap();

        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..64 {
            let done = done.clone();
            pool.add(move || {
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while done.load(Ordering::SeqCst) != 64 {
            assert!(std::time::Instant::now() < deadline, "workers stalled");
            thread::sleep(Duration::from_millis(1));
        }
        pool.shutdown();
    }

    #[test]
    fn add_after_shutdown_fails() {
        let mut pool = ThreadPool::new();
        pool.spawn_workers(1).unwrap();
        pool.shutdown();
        assert_eq!(pool.add(|| {}).unwrap_err(), Error::Closed);
    }

    #[test]
    fn shutdown_unblocks_idle_workers() {
        let mut pool = ThreadPool::new();
        pool.spawn_workers(2).unwrap();
        thread::sleep(Duration::from_millis(10));
        pool.shutdown();
        assert_eq!(pool.pending(), 0);
    }
}

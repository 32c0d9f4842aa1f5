//! Process-wide bounded execution pool.
//!
//! A fixed set of named threads (`ddal-exec-N`) pulls boxed jobs from a
//! shared FIFO queue guarded by a `parking_lot` mutex/condvar pair. The pool
//! knows nothing about workers or deadlines: the dispatcher wraps each
//! worker into a job and joins on its own completion channel.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;

use ddal_common::error::{DdalError, DdalResult};
use parking_lot::{Condvar, Mutex};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolQueue {
    jobs: VecDeque<Job>,
    shutdown: bool,
}

struct PoolShared {
    queue: Mutex<PoolQueue>,
    available: Condvar,
    completed: AtomicU64,
    panicked: AtomicU64,
}

pub struct ExecutionPool {
    shared: Arc<PoolShared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    threads: usize,
}

static GLOBAL_POOL: OnceLock<ExecutionPool> = OnceLock::new();

impl ExecutionPool {
    /// Start a pool with `threads` threads (at least one).
    pub fn new(threads: usize) -> Self {
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(PoolQueue {
                jobs: VecDeque::new(),
                shutdown: false,
            }),
            available: Condvar::new(),
            completed: AtomicU64::new(0),
            panicked: AtomicU64::new(0),
        });
        let mut handles = Vec::with_capacity(threads.max(1));
        for i in 0..threads.max(1) {
            let shared = Arc::clone(&shared);
            match std::thread::Builder::new()
                .name(format!("ddal-exec-{}", i))
                .spawn(move || worker_loop(&shared))
            {
                Ok(handle) => handles.push(handle),
                Err(e) => tracing::error!("failed to spawn execution thread {}: {}", i, e),
            }
        }
        let threads = handles.len();
        tracing::info!(threads, "execution pool started");
        Self {
            shared,
            handles: Mutex::new(handles),
            threads,
        }
    }

    /// Size the process-wide pool. Returns `false` if it already exists.
    pub fn init_global(threads: usize) -> bool {
        let mut created = false;
        GLOBAL_POOL.get_or_init(|| {
            created = true;
            ExecutionPool::new(threads)
        });
        created
    }

    /// The process-wide pool, created with the default size on first use.
    pub fn global() -> &'static ExecutionPool {
        GLOBAL_POOL.get_or_init(|| {
            ExecutionPool::new(ddal_common::config::ExecutorConfig::default().pool_threads)
        })
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Queue a job. Fails once the pool is shut down or has no threads.
    pub fn submit(&self, job: Job) -> DdalResult<()> {
        if self.threads == 0 {
            return Err(DdalError::Internal("execution pool has no threads".into()));
        }
        let mut queue = self.shared.queue.lock();
        if queue.shutdown {
            return Err(DdalError::Internal("execution pool is shut down".into()));
        }
        queue.jobs.push_back(job);
        drop(queue);
        self.shared.available.notify_one();
        Ok(())
    }

    /// Jobs currently waiting for a thread.
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().jobs.len()
    }

    pub fn completed_jobs(&self) -> u64 {
        self.shared.completed.load(Ordering::Relaxed)
    }

    pub fn panicked_jobs(&self) -> u64 {
        self.shared.panicked.load(Ordering::Relaxed)
    }

    /// Stop accepting jobs, drain the queue and join all threads.
    pub fn shutdown(&self) {
        {
            let mut queue = self.shared.queue.lock();
            if queue.shutdown {
                return;
            }
            queue.shutdown = true;
        }
        self.shared.available.notify_all();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.join();
        }
        tracing::debug!("execution pool stopped");
    }
}

impl Drop for ExecutionPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &PoolShared) {
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(job) = queue.jobs.pop_front() {
                    break job;
                }
                if queue.shutdown {
                    return;
                }
                shared.available.wait(&mut queue);
            }
        };
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            shared.panicked.fetch_add(1, Ordering::Relaxed);
            tracing::error!("execution pool job panicked");
        }
        shared.completed.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_runs_jobs_on_named_threads() {
        let pool = ExecutionPool::new(2);
        let (tx, rx) = mpsc::channel();
        for i in 0..8 {
            let tx = tx.clone();
            pool.submit(Box::new(move || {
                let name = std::thread::current().name().map(str::to_string);
                tx.send((i, name)).unwrap();
            }))
            .unwrap();
        }
        drop(tx);
        let mut results: Vec<_> = rx.iter().collect();
        results.sort_by_key(|(i, _)| *i);
        assert_eq!(results.len(), 8);
        assert!(results
            .iter()
            .all(|(_, n)| n.as_deref().is_some_and(|n| n.starts_with("ddal-exec-"))));
    }

    #[test]
    fn test_jobs_run_concurrently() {
        let pool = ExecutionPool::new(2);
        let (tx, rx) = mpsc::channel();
        let barrier = Arc::new(std::sync::Barrier::new(2));
        for _ in 0..2 {
            let tx = tx.clone();
            let barrier = Arc::clone(&barrier);
            pool.submit(Box::new(move || {
                barrier.wait();
                tx.send(()).unwrap();
            }))
            .unwrap();
        }
        for _ in 0..2 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
    }

    #[test]
    fn test_panic_does_not_kill_thread() {
        let pool = ExecutionPool::new(1);
        pool.submit(Box::new(|| panic!("boom"))).unwrap();
        let (tx, rx) = mpsc::channel();
        pool.submit(Box::new(move || tx.send(7).unwrap())).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
        assert_eq!(pool.panicked_jobs(), 1);
    }

    #[test]
    fn test_submit_after_shutdown_fails() {
        let pool = ExecutionPool::new(1);
        pool.shutdown();
        assert!(pool.submit(Box::new(|| {})).is_err());
        pool.shutdown();
    }

    #[test]
    fn test_global_is_shared() {
        let a = ExecutionPool::global() as *const ExecutionPool;
        let b = ExecutionPool::global() as *const ExecutionPool;
        assert_eq!(a, b);
        assert!(ExecutionPool::global().threads() >= 1);
        assert!(!ExecutionPool::init_global(3));
    }
}

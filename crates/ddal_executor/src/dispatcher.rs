//! Serial vs. concurrent execution of one flush's workers.
//!
//! - 0 workers: nothing to do.
//! - 1 worker: runs on the calling thread with no pool round trip. When a
//!   statement timeout is set, a watchdog thread cancels the worker's token
//!   at the deadline and the outcome is reported as `Timeout`.
//! - N workers: each is submitted to the execution pool; the caller joins on
//!   a completion channel until every worker reported or the statement
//!   deadline passed.
//!
//! Workers still outstanding at the deadline are abandoned: their cancel
//! tokens are signalled and they are reported as `Timeout`. The pool thread
//! still releases the worker's connection when its remote call returns, so a
//! shard may apply the effect after the statement already failed.
//!
//! Every worker's resource is released exactly once, by the task wrapper in
//! this module, on every completion path.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use ddal_common::cancel::CancelToken;
use ddal_common::error::{DdalError, ShardError};
use ddal_common::types::WorkerId;

use crate::context::ExecutionContext;
use crate::worker::{UpdateWorker, WorkerOutcome, WorkerSet};

/// Dispatch counters of one session.
#[derive(Debug, Default)]
pub struct DispatchStats {
    /// Flushes handed to the dispatcher.
    pub flushes: AtomicU64,
    /// Flushes that took the single-row path.
    pub single_row_flushes: AtomicU64,
    /// Dispatches run on the calling thread.
    pub inline_dispatches: AtomicU64,
    /// Dispatches fanned out to the pool.
    pub pooled_dispatches: AtomicU64,
    /// Batch merges performed.
    pub batch_merges: AtomicU64,
    pub workers_executed: AtomicU64,
    pub worker_failures: AtomicU64,
    pub timeouts: AtomicU64,
}

impl DispatchStats {
    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            flushes: self.flushes.load(Ordering::Relaxed),
            single_row_flushes: self.single_row_flushes.load(Ordering::Relaxed),
            inline_dispatches: self.inline_dispatches.load(Ordering::Relaxed),
            pooled_dispatches: self.pooled_dispatches.load(Ordering::Relaxed),
            batch_merges: self.batch_merges.load(Ordering::Relaxed),
            workers_executed: self.workers_executed.load(Ordering::Relaxed),
            worker_failures: self.worker_failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of dispatch stats.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStatsSnapshot {
    pub flushes: u64,
    pub single_row_flushes: u64,
    pub inline_dispatches: u64,
    pub pooled_dispatches: u64,
    pub batch_merges: u64,
    pub workers_executed: u64,
    pub worker_failures: u64,
    pub timeouts: u64,
}

pub struct Dispatcher;

impl Dispatcher {
    /// Execute every worker of `workers` and return one outcome per worker,
    /// in input order.
    pub fn execute(workers: WorkerSet, ctx: &ExecutionContext) -> Vec<WorkerOutcome> {
        let mut workers = workers.into_workers();
        match workers.len() {
            0 => Vec::new(),
            1 => match workers.pop() {
                Some(worker) => vec![Self::execute_inline(worker, ctx)],
                None => Vec::new(),
            },
            _ => Self::execute_pooled(workers, ctx),
        }
    }

    fn execute_inline(mut worker: UpdateWorker, ctx: &ExecutionContext) -> WorkerOutcome {
        let id = worker.id();
        let timeout_ms = ctx.statement_timeout_ms();
        ctx.register(id, worker.shard(), worker.cancel_token());
        tracing::debug!(shard = %worker.shard(), rows = worker.row_count(), timeout_ms, "dispatch inline");
        let (mut outcome, timed_out) = if timeout_ms > 0 {
            run_with_deadline(&mut worker, Duration::from_millis(timeout_ms))
        } else {
            (run_to_completion(&mut worker), false)
        };
        ctx.unregister(id);

        let stats = ctx.stats();
        if timed_out {
            tracing::warn!(timeout_ms, shard = %outcome.shard, "statement timeout on inline worker");
            stats.timeouts.fetch_add(1, Ordering::Relaxed);
            outcome.result = Err(DdalError::Timeout {
                timeout_ms,
                pending: 1,
                shards: vec![outcome.shard.clone()],
            });
        }
        stats.inline_dispatches.fetch_add(1, Ordering::Relaxed);
        stats.workers_executed.fetch_add(1, Ordering::Relaxed);
        if !outcome.is_ok() {
            stats.worker_failures.fetch_add(1, Ordering::Relaxed);
        }
        outcome
    }

    fn execute_pooled(workers: Vec<UpdateWorker>, ctx: &ExecutionContext) -> Vec<WorkerOutcome> {
        let n = workers.len();
        let timeout_ms = ctx.statement_timeout_ms();
        tracing::debug!(workers = n, timeout_ms, "dispatch to pool");

        let mut slots: Vec<Option<WorkerOutcome>> = (0..n).map(|_| None).collect();
        let mut meta: Vec<(WorkerId, String)> = Vec::with_capacity(n);
        for w in &workers {
            ctx.register(w.id(), w.shard(), w.cancel_token());
            meta.push((w.id(), w.shard().to_string()));
        }
        let tokens: Vec<_> = workers.iter().map(|w| w.cancel_token()).collect();

        let (tx, rx) = mpsc::channel::<(usize, WorkerOutcome)>();
        let mut pending = n;
        for (idx, mut worker) in workers.into_iter().enumerate() {
            let tx = tx.clone();
            let job = Box::new(move || {
                let outcome = run_to_completion(&mut worker);
                // The receiver is gone once the caller stopped waiting.
                let _ = tx.send((idx, outcome));
            });
            if let Err(e) = ctx.pool().submit(job) {
                // Never started, so no connection was opened.
                slots[idx] = Some(WorkerOutcome {
                    worker: meta[idx].0,
                    shard: meta[idx].1.clone(),
                    result: Err(e),
                });
                pending -= 1;
            }
        }
        drop(tx);

        let deadline = (timeout_ms > 0).then(|| Instant::now() + Duration::from_millis(timeout_ms));
        let mut timed_out = false;
        while pending > 0 {
            let received = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        Err(RecvTimeoutError::Timeout)
                    } else {
                        rx.recv_timeout(deadline - now)
                    }
                }
                None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            match received {
                Ok((idx, outcome)) => {
                    if slots[idx].is_none() {
                        slots[idx] = Some(outcome);
                        pending -= 1;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    timed_out = true;
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        if pending > 0 {
            let late: Vec<usize> = (0..n).filter(|i| slots[*i].is_none()).collect();
            let shards: Vec<String> = late.iter().map(|i| meta[*i].1.clone()).collect();
            if timed_out {
                tracing::warn!(
                    timeout_ms,
                    pending = late.len(),
                    shards = ?shards,
                    "statement timeout, abandoning outstanding workers"
                );
                ctx.stats().timeouts.fetch_add(1, Ordering::Relaxed);
            }
            for &i in &late {
                tokens[i].cancel();
                let result = if timed_out {
                    Err(DdalError::Timeout {
                        timeout_ms,
                        pending: late.len(),
                        shards: shards.clone(),
                    })
                } else {
                    Err(DdalError::internal_bug(
                        "E-DISPATCH-001",
                        "worker completion lost",
                        format!("worker={} shard={}", meta[i].0, meta[i].1),
                    ))
                };
                slots[i] = Some(WorkerOutcome {
                    worker: meta[i].0,
                    shard: meta[i].1.clone(),
                    result,
                });
            }
        }

        for (id, _) in &meta {
            ctx.unregister(*id);
        }

        let outcomes: Vec<WorkerOutcome> = slots.into_iter().flatten().collect();
        let stats = ctx.stats();
        stats.pooled_dispatches.fetch_add(1, Ordering::Relaxed);
        stats.workers_executed.fetch_add(n as u64, Ordering::Relaxed);
        let failures = outcomes.iter().filter(|o| !o.is_ok()).count();
        stats.worker_failures.fetch_add(failures as u64, Ordering::Relaxed);
        outcomes
    }
}

/// Run `worker` on the calling thread while a watchdog cancels it once
/// `timeout` elapses. The flag is true when the watchdog fired.
fn run_with_deadline(worker: &mut UpdateWorker, timeout: Duration) -> (WorkerOutcome, bool) {
    let done = CancelToken::new();
    let target = worker.cancel_token();
    let fired = AtomicBool::new(false);
    let outcome = thread::scope(|s| {
        let watchdog = thread::Builder::new()
            .name("ddal-deadline".into())
            .spawn_scoped(s, || {
                if !done.wait_timeout(timeout) {
                    fired.store(true, Ordering::SeqCst);
                    target.cancel();
                }
            });
        if let Err(e) = &watchdog {
            tracing::warn!(shard = %worker.shard(), "deadline watchdog not started, running unbounded: {}", e);
        }
        let outcome = run_to_completion(worker);
        done.cancel();
        outcome
    });
    (outcome, fired.load(Ordering::SeqCst))
}

/// Run a worker and release its resource, whatever happened.
fn run_to_completion(worker: &mut UpdateWorker) -> WorkerOutcome {
    let result = match panic::catch_unwind(AssertUnwindSafe(|| worker.do_work())) {
        Ok(result) => result,
        Err(payload) => {
            let message = if let Some(s) = payload.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "<non-string panic payload>".to_string()
            };
            tracing::error!(shard = %worker.shard(), panic_message = %message, "worker panicked");
            Err(DdalError::remote(worker.shard(), worker.sql(), ShardError::Panicked(message)))
        }
    };
    worker.close_resource();
    if let Err(e) = &result {
        tracing::warn!(shard = %worker.shard(), worker = %worker.id(), "worker failed: {}", e);
    }
    WorkerOutcome {
        worker: worker.id(),
        shard: worker.shard().to_string(),
        result,
    }
}

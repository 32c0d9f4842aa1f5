//! Session-scoped execution state.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use ddal_common::cancel::CancelToken;
use ddal_common::config::ExecutorConfig;
use ddal_common::error::DdalResult;
use ddal_common::types::WorkerId;
use parking_lot::Mutex;

use crate::dispatcher::DispatchStats;
use crate::pool::ExecutionPool;

/// An in-flight worker as seen by cancellation handling.
#[derive(Debug, Clone)]
pub struct RunningWorker {
    pub shard: String,
    pub cancel: CancelToken,
}

/// Configuration and bookkeeping shared by every statement of a session.
///
/// Holds the statement timeout, the row-buffer and merge thresholds, the
/// current row number used for error attribution, and the registry of
/// workers currently running for this session. `cancel` may be called from
/// any thread.
pub struct ExecutionContext {
    statement_timeout_ms: AtomicU64,
    flush_threshold: usize,
    batch_merge_threshold: usize,
    current_row: AtomicUsize,
    statement_cancel: Mutex<CancelToken>,
    running: DashMap<WorkerId, RunningWorker>,
    pool: Arc<PoolHandle>,
    stats: DispatchStats,
}

/// Either the process-wide pool or a private one.
pub enum PoolHandle {
    Global,
    Owned(ExecutionPool),
}

impl PoolHandle {
    pub fn get(&self) -> &ExecutionPool {
        match self {
            PoolHandle::Global => ExecutionPool::global(),
            PoolHandle::Owned(pool) => pool,
        }
    }
}

impl ExecutionContext {
    /// Context backed by the process-wide execution pool.
    pub fn new(config: &ExecutorConfig) -> Self {
        ExecutionPool::init_global(config.pool_threads);
        Self::with_pool(config, Arc::new(PoolHandle::Global))
    }

    pub fn with_pool(config: &ExecutorConfig, pool: Arc<PoolHandle>) -> Self {
        Self {
            statement_timeout_ms: AtomicU64::new(config.statement_timeout_ms),
            flush_threshold: config.flush_threshold.max(1),
            batch_merge_threshold: config.batch_merge_threshold,
            current_row: AtomicUsize::new(0),
            statement_cancel: Mutex::new(CancelToken::new()),
            running: DashMap::new(),
            pool,
            stats: DispatchStats::default(),
        }
    }

    pub fn statement_timeout_ms(&self) -> u64 {
        self.statement_timeout_ms.load(Ordering::Relaxed)
    }

    /// `SET statement_timeout`; 0 disables the deadline.
    pub fn set_statement_timeout_ms(&self, ms: u64) {
        self.statement_timeout_ms.store(ms, Ordering::Relaxed);
    }

    pub fn flush_threshold(&self) -> usize {
        self.flush_threshold
    }

    pub fn batch_merge_threshold(&self) -> usize {
        self.batch_merge_threshold
    }

    pub fn pool(&self) -> &ExecutionPool {
        self.pool.get()
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    // ── Statement lifecycle ──

    /// Reset per-statement state: row counter and cancellation flag.
    pub fn begin_statement(&self) {
        self.current_row.store(0, Ordering::SeqCst);
        *self.statement_cancel.lock() = CancelToken::new();
    }

    /// Advance the row counter; returns the new 1-based row number.
    pub fn next_row(&self) -> usize {
        self.current_row.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current_row(&self) -> usize {
        self.current_row.load(Ordering::SeqCst)
    }

    // ── Cancellation ──

    /// `Err(Cancelled)` if the running statement was cancelled.
    pub fn check_canceled(&self) -> DdalResult<()> {
        self.statement_cancel.lock().check()
    }

    pub fn is_cancelled(&self) -> bool {
        self.statement_cancel.lock().is_cancelled()
    }

    /// Cancel the running statement and signal every in-flight worker.
    pub fn cancel(&self) {
        self.statement_cancel.lock().cancel();
        let shards = self.running_shards();
        for entry in self.running.iter() {
            entry.value().cancel.cancel();
        }
        tracing::info!(workers = shards.len(), shards = ?shards, "statement cancelled, in-flight workers signalled");
    }

    // ── Running-worker registry ──

    pub fn register(&self, id: WorkerId, shard: &str, cancel: CancelToken) {
        self.running.insert(
            id,
            RunningWorker {
                shard: shard.to_string(),
                cancel: cancel.clone(),
            },
        );
        // Insert before checking: a concurrent `cancel` either sees this
        // entry or has already set the flag.
        if self.is_cancelled() {
            cancel.cancel();
        }
    }

    pub fn unregister(&self, id: WorkerId) {
        self.running.remove(&id);
    }

    pub fn running_workers(&self) -> usize {
        self.running.len()
    }

    pub fn running_shards(&self) -> Vec<String> {
        let mut shards: Vec<String> = self.running.iter().map(|e| e.value().shard.clone()).collect();
        shards.sort();
        shards
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("statement_timeout_ms", &self.statement_timeout_ms())
            .field("flush_threshold", &self.flush_threshold)
            .field("batch_merge_threshold", &self.batch_merge_threshold)
            .field("current_row", &self.current_row())
            .field("running", &self.running.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ExecutionContext {
        ExecutionContext::with_pool(
            &ExecutorConfig {
                pool_threads: 1,
                ..ExecutorConfig::default()
            },
            Arc::new(PoolHandle::Owned(ExecutionPool::new(1))),
        )
    }

    #[test]
    fn test_row_counter_resets_per_statement() {
        let ctx = ctx();
        ctx.begin_statement();
        assert_eq!(ctx.next_row(), 1);
        assert_eq!(ctx.next_row(), 2);
        ctx.begin_statement();
        assert_eq!(ctx.current_row(), 0);
        assert_eq!(ctx.next_row(), 1);
    }

    #[test]
    fn test_cancel_reaches_registered_workers() {
        let ctx = ctx();
        ctx.begin_statement();
        let a = CancelToken::new();
        let b = CancelToken::new();
        ctx.register(WorkerId(1), "s0", a.clone());
        ctx.register(WorkerId(2), "s1", b.clone());
        assert_eq!(ctx.running_shards(), vec!["s0", "s1"]);
        ctx.cancel();
        assert!(a.is_cancelled() && b.is_cancelled());
        assert!(ctx.check_canceled().is_err());
        ctx.unregister(WorkerId(1));
        ctx.unregister(WorkerId(2));
        assert_eq!(ctx.running_workers(), 0);
    }

    #[test]
    fn test_worker_tokens_are_separate_from_statement_token() {
        let ctx = ctx();
        ctx.begin_statement();
        let worker = CancelToken::new();
        ctx.register(WorkerId(3), "s0", worker.clone());
        // A worker cancelled by its deadline leaves the statement running.
        worker.cancel();
        assert!(ctx.check_canceled().is_ok());
        ctx.unregister(WorkerId(3));

        let finished = CancelToken::new();
        ctx.register(WorkerId(4), "s1", finished.clone());
        ctx.unregister(WorkerId(4));
        ctx.cancel();
        assert!(!finished.is_cancelled());
    }

    #[test]
    fn test_new_statement_clears_cancel() {
        let ctx = ctx();
        ctx.begin_statement();
        ctx.cancel();
        assert!(ctx.is_cancelled());
        ctx.begin_statement();
        assert!(ctx.check_canceled().is_ok());
    }

    #[test]
    fn test_late_registration_after_cancel() {
        let ctx = ctx();
        ctx.begin_statement();
        ctx.cancel();
        let token = CancelToken::new();
        ctx.register(WorkerId(9), "s0", token.clone());
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_timeout_is_adjustable() {
        let ctx = ctx();
        assert_eq!(ctx.statement_timeout_ms(), 0);
        ctx.set_statement_timeout_ms(75);
        assert_eq!(ctx.statement_timeout_ms(), 75);
    }
}

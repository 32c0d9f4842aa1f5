//! Cooperative cancellation flag for in-flight shard work.
//!
//! Each worker owns its own token, and the execution context keeps a separate
//! token for the statement. Cancelling the statement signals every registered
//! worker token. Remote calls that block (or simulate blocking) wait on
//! [`CancelToken::wait_timeout`] so a cancel request wakes them immediately
//! rather than after the full wait has elapsed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{DdalError, DdalResult};

#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

struct CancelInner {
    flag: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelInner {
                flag: AtomicBool::new(false),
                mutex: Mutex::new(()),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Request cancellation. Wakes all waiters.
    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        let _guard = self.inner.mutex.lock();
        self.inner.condvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once cancellation was requested.
    pub fn check(&self) -> DdalResult<()> {
        if self.is_cancelled() {
            Err(DdalError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep for at most `duration`, waking early on cancel.
    /// Returns `true` if cancellation was requested.
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        let deadline = std::time::Instant::now() + duration;
        let mut guard = self.inner.mutex.lock();
        while !self.is_cancelled() {
            if self.inner.condvar.wait_until(&mut guard, deadline).timed_out() {
                break;
            }
        }
        self.is_cancelled()
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_token_starts_clear() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());
    }

    #[test]
    fn test_cancel_visible_through_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(DdalError::Cancelled)));
    }

    #[test]
    fn test_wait_timeout_elapses() {
        let token = CancelToken::new();
        let start = Instant::now();
        assert!(!token.wait_timeout(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_wait_timeout_wakes_on_cancel() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = std::thread::spawn(move || {
            let start = Instant::now();
            let cancelled = waiter.wait_timeout(Duration::from_secs(10));
            (cancelled, start.elapsed())
        });
        std::thread::sleep(Duration::from_millis(20));
        token.cancel();
        let (cancelled, elapsed) = handle.join().unwrap();
        assert!(cancelled);
        assert!(elapsed < Duration::from_secs(2));
    }
}
